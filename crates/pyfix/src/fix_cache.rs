//! Content-addressed, TTL-bounded cache of repaired code.
//!
//! One JSON file per entry in a flat directory, named by the hex SHA-256 of
//! `source ∥ "|||" ∥ error_text`. Entries carry their storage timestamp and
//! expire after the configured TTL. A `.model_version` sentinel records the
//! planner identity the cache was filled with; on mismatch at open time the
//! whole cache is purged, since fixes from one model say nothing about
//! another's.
//!
//! The cache is never on the correctness path: every I/O failure is logged
//! and degraded to a miss, and a corrupt entry is deleted rather than
//! surfaced. Entry writes go through a temp file and rename, so concurrent
//! writers to the same key race benignly (last write wins).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Default entry lifetime.
pub const DEFAULT_TTL_DAYS: i64 = 30;

/// Default aggregate size cap.
pub const DEFAULT_MAX_MEGABYTES: u64 = 100;

const MODEL_SENTINEL: &str = ".model_version";

/// The cached payload: the repaired code plus how it came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFix {
    pub fixed: String,
    pub explanation: Option<String>,
    pub error_type: String,
}

/// On-disk entry wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    result: CachedFix,
    cached_at: DateTime<Utc>,
    /// Key prefix, kept for debugging entries by eye.
    code_hash: String,
    code_length: usize,
    error_type: String,
}

/// Cache hit/size statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub size_bytes: u64,
    pub ttl_days: i64,
}

/// File-backed cache mapping `(source, error_text)` to a repaired artifact.
pub struct FixCache {
    dir: PathBuf,
    ttl_days: i64,
    max_bytes: u64,
    counters: Mutex<Counters>,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

impl FixCache {
    /// Open (creating if needed) the cache at `dir` for the given planner
    /// identity. A differing identity sentinel purges all entries.
    pub fn open(
        dir: impl Into<PathBuf>,
        model_identity: &str,
        ttl_days: i64,
        max_megabytes: u64,
    ) -> Self {
        let dir = dir.into();
        let cache = Self {
            dir,
            ttl_days: ttl_days.max(0),
            max_bytes: max_megabytes.saturating_mul(1024 * 1024),
            counters: Mutex::new(Counters::default()),
        };

        if let Err(err) = fs::create_dir_all(&cache.dir) {
            warn!(dir = %cache.dir.display(), %err, "failed to create cache directory");
            return cache;
        }

        cache.check_model_identity(model_identity);
        info!(dir = %cache.dir.display(), ttl_days, "fix cache ready");
        cache
    }

    /// Open with the default TTL and size cap.
    pub fn open_default(dir: impl Into<PathBuf>, model_identity: &str) -> Self {
        Self::open(dir, model_identity, DEFAULT_TTL_DAYS, DEFAULT_MAX_MEGABYTES)
    }

    fn check_model_identity(&self, model_identity: &str) {
        let sentinel = self.dir.join(MODEL_SENTINEL);
        match fs::read_to_string(&sentinel) {
            Ok(stored) if stored.trim() == model_identity => {}
            Ok(stored) => {
                warn!(
                    stored = stored.trim(),
                    current = model_identity,
                    "planner identity changed; purging fix cache"
                );
                self.clear();
                let _ = fs::write(&sentinel, model_identity);
            }
            Err(_) => {
                let _ = fs::write(&sentinel, model_identity);
            }
        }
    }

    /// The cache key for `(source, error_text)`: hex SHA-256 of
    /// `source ∥ "|||" ∥ error_text`.
    pub fn cache_key(source: &str, error_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b"|||");
        hasher.update(error_text.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up a cached fix. Expired and corrupt entries are deleted and
    /// reported as misses.
    pub fn get(&self, source: &str, error_text: &str) -> Option<CachedFix> {
        let key = Self::cache_key(source, error_text);
        let path = self.entry_path(&key);

        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => {
                self.record_miss();
                debug!(key = &key[..8.min(key.len())], "cache miss");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "corrupt cache entry; deleting");
                let _ = fs::remove_file(&path);
                self.record_miss();
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(entry.cached_at);
        if age > chrono::Duration::days(self.ttl_days) {
            info!(age_days = age.num_days(), "cache entry expired; deleting");
            let _ = fs::remove_file(&path);
            self.record_miss();
            return None;
        }

        self.record_hit();
        debug!(key = &key[..8.min(key.len())], "cache hit");
        Some(entry.result)
    }

    /// Store a fix, then enforce the aggregate size cap.
    pub fn set(&self, source: &str, error_text: &str, result: &CachedFix) {
        let key = Self::cache_key(source, error_text);
        let entry = CacheEntry {
            result: result.clone(),
            cached_at: Utc::now(),
            code_hash: key[..16.min(key.len())].to_string(),
            code_length: source.len(),
            error_type: result.error_type.clone(),
        };

        let data = match serde_json::to_string_pretty(&entry) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "failed to serialize cache entry");
                return;
            }
        };

        let path = self.entry_path(&key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        if let Err(err) = fs::write(&tmp, &data).and_then(|_| fs::rename(&tmp, &path)) {
            warn!(%err, "failed to write cache entry");
            let _ = fs::remove_file(&tmp);
            return;
        }

        self.enforce_size_cap();
    }

    /// Delete the oldest quarter of entries (by mtime) once the aggregate
    /// size exceeds the cap.
    fn enforce_size_cap(&self) {
        let entries = match self.list_entries() {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let total: u64 = entries.iter().map(|(_, _, size)| size).sum();
        if total <= self.max_bytes {
            return;
        }

        warn!(
            total_bytes = total,
            cap_bytes = self.max_bytes,
            "cache over size cap; evicting oldest quarter"
        );

        let mut by_mtime = entries;
        by_mtime.sort_by_key(|(_, mtime, _)| *mtime);
        let remove_count = by_mtime.len() / 4;
        for (path, _, _) in by_mtime.into_iter().take(remove_count) {
            let _ = fs::remove_file(path);
        }
    }

    #[allow(clippy::type_complexity)]
    fn list_entries(&self) -> std::io::Result<Vec<(PathBuf, std::time::SystemTime, u64)>> {
        let mut entries = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let path = item.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let meta = item.metadata()?;
                let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                entries.push((path, mtime, meta.len()));
            }
        }
        Ok(entries)
    }

    /// Remove every entry and reset the counters.
    pub fn clear(&self) {
        if let Ok(entries) = self.list_entries() {
            for (path, _, _) in entries {
                let _ = fs::remove_file(path);
            }
        }
        let mut counters = self.counters.lock().expect("cache counters poisoned");
        counters.hits = 0;
        counters.misses = 0;
        info!("fix cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let (hits, misses) = {
            let counters = self.counters.lock().expect("cache counters poisoned");
            (counters.hits, counters.misses)
        };
        let total = hits + misses;
        let (entries, size_bytes) = self
            .list_entries()
            .map(|list| (list.len(), list.iter().map(|(_, _, s)| s).sum()))
            .unwrap_or((0, 0));
        CacheStats {
            hits,
            misses,
            total_requests: total,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entries,
            size_bytes,
            ttl_days: self.ttl_days,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_hit(&self) {
        self.counters.lock().expect("cache counters poisoned").hits += 1;
    }

    fn record_miss(&self) {
        self.counters.lock().expect("cache counters poisoned").misses += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fix(code: &str) -> CachedFix {
        CachedFix {
            fixed: code.to_string(),
            explanation: Some("added the missing colon".to_string()),
            error_type: "SyntaxError".to_string(),
        }
    }

    fn open_cache(dir: &TempDir) -> FixCache {
        FixCache::open_default(dir.path(), "planner-v1")
    }

    #[test]
    fn test_cache_key_is_stable_and_sensitive() {
        let a = FixCache::cache_key("x = 1", "NameError");
        let b = FixCache::cache_key("x = 1", "NameError");
        let c = FixCache::cache_key("x = 2", "NameError");
        let d = FixCache::cache_key("x = 1", "TypeError");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open_cache(&dir);

        assert!(cache.get("broken", "SyntaxError: x").is_none());
        cache.set("broken", "SyntaxError: x", &fix("fixed"));
        let got = cache.get("broken", "SyntaxError: x").expect("hit");
        assert_eq!(got.fixed, "fixed");
        assert_eq!(got.error_type, "SyntaxError");
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open_cache(&dir);

        let _ = cache.get("a", "e");
        cache.set("a", "e", &fix("f"));
        let _ = cache.get("a", "e");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 2);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.ttl_days, DEFAULT_TTL_DAYS);
    }

    #[test]
    fn test_clear_removes_entries() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open_cache(&dir);
        cache.set("a", "e", &fix("f"));
        cache.clear();
        assert!(cache.get("a", "e").is_none());
        // The first get after clear is a miss; counters were reset before it.
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_corrupt_entry_is_deleted_and_missed() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open_cache(&dir);

        let key = FixCache::cache_key("a", "e");
        let path = dir.path().join(format!("{key}.json"));
        fs::write(&path, "{ not json").expect("write corrupt entry");

        assert!(cache.get("a", "e").is_none());
        assert!(!path.exists(), "corrupt entry should be deleted");
    }

    #[test]
    fn test_expired_entry_is_deleted_and_missed() {
        let dir = TempDir::new().expect("tempdir");
        // TTL of zero days: anything stored is instantly expired.
        let cache = FixCache::open(dir.path(), "planner-v1", 0, DEFAULT_MAX_MEGABYTES);

        cache.set("a", "e", &fix("f"));
        // Entries are timestamped now; with chrono resolution the age exceeds
        // the zero-day TTL as soon as any time has passed.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("a", "e").is_none());

        let key = FixCache::cache_key("a", "e");
        assert!(!dir.path().join(format!("{key}.json")).exists());
    }

    #[test]
    fn test_model_identity_change_purges_cache() {
        let dir = TempDir::new().expect("tempdir");
        {
            let cache = FixCache::open_default(dir.path(), "planner-v1");
            cache.set("a", "e", &fix("f"));
            assert!(cache.get("a", "e").is_some());
        }
        {
            let cache = FixCache::open_default(dir.path(), "planner-v2");
            assert!(cache.get("a", "e").is_none(), "purged on identity change");
        }
    }

    #[test]
    fn test_same_model_identity_preserves_cache() {
        let dir = TempDir::new().expect("tempdir");
        {
            let cache = FixCache::open_default(dir.path(), "planner-v1");
            cache.set("a", "e", &fix("f"));
        }
        {
            let cache = FixCache::open_default(dir.path(), "planner-v1");
            assert!(cache.get("a", "e").is_some());
        }
    }

    #[test]
    fn test_size_cap_evicts_oldest_quarter() {
        let dir = TempDir::new().expect("tempdir");
        // Cap of 0 MiB: every set pushes the cache over the cap.
        let cache = FixCache::open(dir.path(), "planner-v1", DEFAULT_TTL_DAYS, 0);

        for i in 0..8 {
            cache.set(&format!("code-{i}"), "e", &fix(&format!("fix-{i}")));
        }

        // Each set evicted a quarter of what was there; the cache cannot have
        // kept all eight entries.
        assert!(cache.stats().entries < 8);
    }

    #[test]
    fn test_last_write_wins_on_same_key() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open_cache(&dir);
        cache.set("a", "e", &fix("first"));
        cache.set("a", "e", &fix("second"));
        assert_eq!(cache.get("a", "e").expect("hit").fixed, "second");
        assert_eq!(cache.stats().entries, 1);
    }
}
