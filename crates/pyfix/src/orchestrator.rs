//! The hybrid fix orchestrator.
//!
//! Drives one `fix` call through an explicit state machine:
//!
//! ```text
//! RuleAttempt → CacheLookup → PlannerLoop → MemoryFallback → Fallback
//!      └─hit────────┴─hit──────────┴─fixed────────┴─hit──→ Done
//! ```
//!
//! Rules are free and deterministic, so they run first. The cache returns
//! previously verified fixes without planner traffic. The planner loop is a
//! bounded tool-calling conversation; every candidate it produces must
//! recompile through the safe compiler before it counts. When the planner is
//! unavailable or exhausted, a high-similarity memory exemplar may stand in.
//! The terminal fallback returns manual suggestions keyed by error kind.
//!
//! Failure policy: rule and handler failures degrade to no-op; cache and
//! memory failures degrade to miss; planner and tool errors are reported into
//! the conversation. Only a panic inside the orchestrator itself surfaces as
//! a generic internal-error artifact — never the raw panic payload.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::compiler::SafeCompiler;
use crate::config::EngineConfig;
use crate::fix_cache::{CachedFix, FixCache};
use crate::memory::FixMemory;
use crate::planner::{
    extract_code_block, ChatMessage, HttpPlanner, Planner, SYSTEM_INSTRUCTION,
};
use crate::rules::{suggestions_for, RuleRegistry};
use crate::sandbox::ExecutionSandbox;
use crate::tools::ToolBroker;
use crate::types::{FixArtifact, FixMethod, PyErrorKind};

/// Memory exemplars below this similarity are not offered as fallback fixes.
const MEMORY_FALLBACK_MIN_SIMILARITY: f32 = 0.8;

/// Quality floor for memory-fallback retrieval.
const MEMORY_FALLBACK_MIN_SUCCESS_RATE: f64 = 0.6;

/// States of one fix call. Transitions happen in [`HybridFixOrchestrator::fix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixState {
    RuleAttempt,
    CacheLookup,
    PlannerLoop,
    MemoryFallback,
    Fallback,
}

/// Outcome of the planner loop.
enum PlannerLoopResult {
    Fixed { code: String, explanation: String },
    Unavailable,
    Exhausted,
}

/// End-to-end repair pipeline over the sandbox, cache, memory, and planner.
pub struct HybridFixOrchestrator {
    config: EngineConfig,
    compiler: SafeCompiler,
    sandbox: Arc<ExecutionSandbox>,
    cache: FixCache,
    memory: Option<Arc<FixMemory>>,
    planner: Option<Box<dyn Planner>>,
    rules: RuleRegistry,
    broker: ToolBroker,
}

impl HybridFixOrchestrator {
    /// Build the full pipeline from configuration: HTTP planner when an API
    /// key is present, file-backed cache and memory at the configured paths.
    pub fn from_config(config: EngineConfig) -> Self {
        let planner: Option<Box<dyn Planner>> = match &config.planner_api_key {
            Some(key) => match HttpPlanner::new(
                &config.planner_url,
                key,
                &config.planner_model,
                ToolBroker::declarations(),
            ) {
                Ok(planner) => Some(Box::new(planner)),
                Err(err) => {
                    warn!(%err, "planner client unavailable; continuing without it");
                    None
                }
            },
            None => {
                info!("no planner API key configured; AI strategy disabled");
                None
            }
        };
        Self::with_planner(config, planner)
    }

    /// Build the pipeline around an explicit planner (or none). The cache
    /// sentinel is keyed by the planner's identity.
    pub fn with_planner(config: EngineConfig, planner: Option<Box<dyn Planner>>) -> Self {
        let identity = planner
            .as_ref()
            .map(|p| p.identity().to_string())
            .unwrap_or_else(|| config.planner_model.clone());

        let sandbox = Arc::new(ExecutionSandbox::new());
        let cache = FixCache::open(
            &config.cache_dir,
            &identity,
            config.cache_ttl_days,
            config.cache_max_megabytes,
        );
        let memory = Some(Arc::new(FixMemory::open(&config.memory_path)));
        let broker = ToolBroker::new(Arc::clone(&sandbox), memory.clone());

        Self {
            config,
            compiler: SafeCompiler::new(),
            sandbox,
            cache,
            memory,
            planner,
            rules: RuleRegistry::with_default_handlers(),
            broker,
        }
    }

    pub fn sandbox(&self) -> &Arc<ExecutionSandbox> {
        &self.sandbox
    }

    pub fn cache(&self) -> &FixCache {
        &self.cache
    }

    pub fn memory(&self) -> Option<&Arc<FixMemory>> {
        self.memory.as_ref()
    }

    /// Repair `source`. `declared_error` is the error text the caller already
    /// observed; when absent, the sandbox reproduces it first.
    ///
    /// Never panics across this boundary: unrecoverable bugs return a generic
    /// internal-error artifact.
    pub fn fix(&self, source: &str, declared_error: Option<&str>) -> FixArtifact {
        let original = source.to_string();
        match catch_unwind(AssertUnwindSafe(|| self.fix_inner(source, declared_error))) {
            Ok(artifact) => artifact,
            Err(_) => {
                error!("internal error during fix; returning generic artifact");
                FixArtifact {
                    success: false,
                    original,
                    fixed: None,
                    error_kind: PyErrorKind::Unknown,
                    method: FixMethod::Fallback,
                    cache_hit: false,
                    changes: Vec::new(),
                    duration_ns: 0,
                    explanation: Some(
                        "InternalError: an unexpected internal error occurred".to_string(),
                    ),
                    suggestions: Vec::new(),
                }
            }
        }
    }

    fn fix_inner(&self, source: &str, declared_error: Option<&str>) -> FixArtifact {
        let start = Instant::now();

        // Resolve the error text, reproducing it in the sandbox when the
        // caller did not declare one.
        let error_text = match declared_error {
            Some(text) if !text.trim().is_empty() && text.trim() != "Unknown" => {
                text.trim().to_string()
            }
            _ => {
                let probe = self
                    .sandbox
                    .execute(source, self.config.sandbox_timeout_secs);
                if probe.success {
                    info!("source runs cleanly; nothing to fix");
                    return FixArtifact {
                        success: true,
                        original: source.to_string(),
                        fixed: None,
                        error_kind: PyErrorKind::Unknown,
                        method: FixMethod::Fallback,
                        cache_hit: false,
                        changes: Vec::new(),
                        duration_ns: start.elapsed().as_nanos() as u64,
                        explanation: Some("No error detected; the code runs cleanly.".to_string()),
                        suggestions: Vec::new(),
                    };
                }
                probe.error.unwrap_or_else(|| "Unknown".to_string())
            }
        };

        let kind = PyErrorKind::detect(&error_text);
        debug!(%kind, "fix pipeline starting");

        let mut state = FixState::RuleAttempt;
        loop {
            state = match state {
                FixState::RuleAttempt => {
                    match self.rules.attempt(source, &error_text, kind) {
                        Some(rule_fix) if self.compiler.check(&rule_fix.fixed).is_ok() => {
                            info!(handler = rule_fix.handler, "rule handler produced a fix");
                            self.remember(source, kind, &rule_fix.fixed, "rule", &error_text, None);
                            return self.done(
                                source,
                                Some(rule_fix.fixed),
                                kind,
                                FixMethod::Rule,
                                false,
                                rule_fix.changes,
                                start,
                                Some(rule_fix.diagnosis.description),
                            );
                        }
                        Some(rule_fix) => {
                            debug!(
                                handler = rule_fix.handler,
                                "rule fix failed validation; discarding"
                            );
                            FixState::CacheLookup
                        }
                        None => FixState::CacheLookup,
                    }
                }

                FixState::CacheLookup => match self.cache.get(source, &error_text) {
                    Some(cached) if self.compiler.check(&cached.fixed).is_ok() => {
                        info!("cache hit");
                        return self.done(
                            source,
                            Some(cached.fixed),
                            kind,
                            FixMethod::Cache,
                            true,
                            vec!["Restored previously verified fix".to_string()],
                            start,
                            cached.explanation,
                        );
                    }
                    Some(_) => {
                        warn!("cached fix no longer compiles; treating as miss");
                        FixState::PlannerLoop
                    }
                    None => FixState::PlannerLoop,
                },

                FixState::PlannerLoop => match self.run_planner_loop(source, &error_text) {
                    PlannerLoopResult::Fixed { code, explanation } => {
                        self.remember(source, kind, &code, "ai", &error_text, Some(&explanation));
                        return self.done(
                            source,
                            Some(code),
                            kind,
                            FixMethod::Ai,
                            false,
                            vec!["Repaired by the AI planner".to_string()],
                            start,
                            Some(explanation),
                        );
                    }
                    PlannerLoopResult::Unavailable => {
                        debug!("planner unavailable; trying memory fallback");
                        FixState::MemoryFallback
                    }
                    PlannerLoopResult::Exhausted => {
                        warn!("planner loop exhausted without a valid fix");
                        FixState::MemoryFallback
                    }
                },

                FixState::MemoryFallback => {
                    if let Some(fixed) = self.try_memory_fallback(source, kind) {
                        return self.done(
                            source,
                            Some(fixed),
                            kind,
                            FixMethod::Memory,
                            false,
                            vec!["Applied a similar fix from memory".to_string()],
                            start,
                            Some("A past fix for very similar code was applied.".to_string()),
                        );
                    }
                    FixState::Fallback
                }

                FixState::Fallback => {
                    info!(%kind, "returning fallback suggestions");
                    return FixArtifact {
                        success: false,
                        original: source.to_string(),
                        fixed: None,
                        error_kind: kind,
                        method: FixMethod::Fallback,
                        cache_hit: false,
                        changes: Vec::new(),
                        duration_ns: start.elapsed().as_nanos() as u64,
                        explanation: Some(format!(
                            "Automated repair did not converge for this {kind}. \
                             The suggestions below may help fix it manually."
                        )),
                        suggestions: suggestions_for(kind),
                    };
                }
            };
        }
    }

    // ── Planner loop ─────────────────────────────────────────────────────────

    fn run_planner_loop(&self, source: &str, error_text: &str) -> PlannerLoopResult {
        let Some(planner) = &self.planner else {
            return PlannerLoopResult::Unavailable;
        };

        let mut conversation = vec![
            ChatMessage::system(SYSTEM_INSTRUCTION),
            ChatMessage::user(format!(
                "Fix this Python code.\n\nReported error:\n{error_text}\n\nCode:\n```python\n{source}\n```"
            )),
        ];

        // One budget bounds both planner turns and tool dispatches.
        let mut tool_budget = self.config.max_iterations;

        for iteration in 0..self.config.max_iterations {
            let turn = match planner.next_turn(&conversation) {
                Ok(turn) => turn,
                Err(err) => {
                    warn!(%err, iteration, "planner call failed");
                    return PlannerLoopResult::Unavailable;
                }
            };

            if !turn.tool_calls.is_empty() {
                let calls = turn.tool_calls.clone();
                conversation.push(ChatMessage::assistant(
                    turn.text.unwrap_or_default(),
                    calls.clone(),
                ));
                for call in calls {
                    let result = if tool_budget == 0 {
                        serde_json::json!({
                            "success": false,
                            "error": "Tool budget exhausted; reply with the final fixed code",
                        })
                    } else {
                        tool_budget -= 1;
                        self.broker.dispatch(&call.name, &call.arguments)
                    };
                    conversation.push(ChatMessage::tool_result(call.id, result.to_string()));
                }
                continue;
            }

            let Some(text) = turn.text else {
                conversation.push(ChatMessage::user(
                    "Respond with tool calls or the final fixed code in a fenced code block."
                        .to_string(),
                ));
                continue;
            };

            let candidate =
                extract_code_block(&text).unwrap_or_else(|| text.trim().to_string());
            match self.compiler.check(&candidate) {
                Ok(_) => {
                    debug!(iteration, "planner produced a compiling candidate");
                    return PlannerLoopResult::Fixed {
                        code: candidate,
                        explanation: text,
                    };
                }
                Err(err) => {
                    debug!(iteration, %err, "planner candidate failed validation");
                    conversation.push(ChatMessage::assistant(text, Vec::new()));
                    conversation.push(ChatMessage::user(format!(
                        "That fix does not pass validation: {err}. \
                         Provide the complete corrected program in a fenced code block."
                    )));
                }
            }
        }

        PlannerLoopResult::Exhausted
    }

    // ── Memory fallback ──────────────────────────────────────────────────────

    fn try_memory_fallback(&self, source: &str, kind: PyErrorKind) -> Option<String> {
        let memory = self.memory.as_ref()?;
        let hits = memory.search_with_quality(source, kind, 1, MEMORY_FALLBACK_MIN_SUCCESS_RATE);
        let hit = hits.into_iter().next()?;
        if hit.similarity < MEMORY_FALLBACK_MIN_SIMILARITY {
            return None;
        }
        if self.compiler.check(&hit.record.fixed).is_ok() {
            memory.record_outcome(&hit.record.id, true);
            info!(similarity = hit.similarity, "memory exemplar applied as fallback");
            Some(hit.record.fixed)
        } else {
            memory.record_outcome(&hit.record.id, false);
            None
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    /// Persist a verified fix to the cache and the memory store.
    fn remember(
        &self,
        source: &str,
        kind: PyErrorKind,
        fixed: &str,
        method: &str,
        error_text: &str,
        explanation: Option<&str>,
    ) {
        self.cache.set(
            source,
            error_text,
            &CachedFix {
                fixed: fixed.to_string(),
                explanation: explanation.map(str::to_string),
                error_type: kind.label().to_string(),
            },
        );
        if let Some(memory) = &self.memory {
            memory.store_validated(source, kind, fixed, method, true);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn done(
        &self,
        source: &str,
        fixed: Option<String>,
        kind: PyErrorKind,
        method: FixMethod,
        cache_hit: bool,
        changes: Vec<String>,
        start: Instant,
        explanation: Option<String>,
    ) -> FixArtifact {
        FixArtifact {
            success: true,
            original: source.to_string(),
            fixed,
            error_kind: kind,
            method,
            cache_hit,
            changes,
            duration_ns: start.elapsed().as_nanos() as u64,
            explanation,
            suggestions: Vec::new(),
        }
    }
}
