//! Engine configuration, read once from the environment.
//!
//! Every knob has a sensible default so the engine runs with no configuration
//! at all (planner-less, local cache and memory in the working directory).
//! Environment variables override field by field.

use std::path::PathBuf;

use crate::fix_cache::{DEFAULT_MAX_MEGABYTES, DEFAULT_TTL_DAYS};
use crate::types::{
    DEFAULT_TIMEOUT_SECS, MAX_CHANGES, MAX_PLANNER_ITERATIONS, MAX_SNAPSHOTS,
};

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// API key for the LLM planner; absent means the planner strategy is
    /// skipped entirely.
    pub planner_api_key: Option<String>,
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub planner_url: String,
    /// Planner model identity; also keys the fix-cache sentinel.
    pub planner_model: String,

    pub cache_dir: PathBuf,
    pub cache_ttl_days: i64,
    pub cache_max_megabytes: u64,

    pub memory_path: PathBuf,

    pub sandbox_timeout_secs: u64,
    pub max_iterations: usize,
    pub max_snapshots: usize,
    pub max_changes: usize,

    /// Gate for exposing raw sandbox entry points outside the engine.
    pub debug_api_enabled: bool,
    pub debug_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner_api_key: None,
            planner_url: "https://api.openai.com/v1".to_string(),
            planner_model: "gpt-4o-mini".to_string(),
            cache_dir: PathBuf::from(".pyfix_cache"),
            cache_ttl_days: DEFAULT_TTL_DAYS,
            cache_max_megabytes: DEFAULT_MAX_MEGABYTES,
            memory_path: PathBuf::from(".pyfix_memory/memory.json"),
            sandbox_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_iterations: MAX_PLANNER_ITERATIONS,
            max_snapshots: MAX_SNAPSHOTS,
            max_changes: MAX_CHANGES,
            debug_api_enabled: false,
            debug_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from `PYFIX_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            planner_api_key: env_string("PYFIX_PLANNER_API_KEY"),
            planner_url: env_string("PYFIX_PLANNER_URL").unwrap_or(defaults.planner_url),
            planner_model: env_string("PYFIX_PLANNER_MODEL").unwrap_or(defaults.planner_model),
            cache_dir: env_string("PYFIX_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_ttl_days: env_parse("PYFIX_CACHE_TTL_DAYS").unwrap_or(defaults.cache_ttl_days),
            cache_max_megabytes: env_parse("PYFIX_CACHE_MAX_MB")
                .unwrap_or(defaults.cache_max_megabytes),
            memory_path: env_string("PYFIX_MEMORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.memory_path),
            sandbox_timeout_secs: env_parse("PYFIX_SANDBOX_TIMEOUT")
                .unwrap_or(defaults.sandbox_timeout_secs),
            max_iterations: env_parse("PYFIX_MAX_ITERATIONS").unwrap_or(defaults.max_iterations),
            max_snapshots: env_parse("PYFIX_MAX_SNAPSHOTS").unwrap_or(defaults.max_snapshots),
            max_changes: env_parse("PYFIX_MAX_CHANGES").unwrap_or(defaults.max_changes),
            debug_api_enabled: env_parse("PYFIX_DEBUG_API").unwrap_or(false),
            debug_api_key: env_string("PYFIX_DEBUG_API_KEY"),
        }
    }

    /// Whether a request presenting `key` may reach the raw sandbox entry
    /// points. Denied unless the debug API is enabled, a key is configured,
    /// and the presented key matches.
    pub fn debug_api_authorized(&self, key: Option<&str>) -> bool {
        if !self.debug_api_enabled {
            return false;
        }
        match (&self.debug_api_key, key) {
            (Some(expected), Some(presented)) => expected == presented,
            _ => false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_caps() {
        let config = EngineConfig::default();
        assert!(config.planner_api_key.is_none());
        assert_eq!(config.cache_ttl_days, 30);
        assert_eq!(config.cache_max_megabytes, 100);
        assert_eq!(config.sandbox_timeout_secs, 5);
        assert_eq!(config.max_iterations, 5);
        assert!(!config.debug_api_enabled);
    }

    #[test]
    fn test_debug_api_denied_when_disabled() {
        let config = EngineConfig::default();
        assert!(!config.debug_api_authorized(Some("anything")));
        assert!(!config.debug_api_authorized(None));
    }

    #[test]
    fn test_debug_api_requires_matching_key() {
        let config = EngineConfig {
            debug_api_enabled: true,
            debug_api_key: Some("hunter2".to_string()),
            ..EngineConfig::default()
        };
        assert!(config.debug_api_authorized(Some("hunter2")));
        assert!(!config.debug_api_authorized(Some("wrong")));
        assert!(!config.debug_api_authorized(None));
    }

    #[test]
    fn test_debug_api_denied_without_configured_key() {
        let config = EngineConfig {
            debug_api_enabled: true,
            debug_api_key: None,
            ..EngineConfig::default()
        };
        assert!(!config.debug_api_authorized(Some("anything")));
    }
}
