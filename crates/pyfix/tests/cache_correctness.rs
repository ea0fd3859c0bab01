//! FixCache correctness: round-trips, TTL, invalidation, and concurrency.

use pyfix::{CachedFix, FixCache};
use tempfile::TempDir;

fn fix(code: &str) -> CachedFix {
    CachedFix {
        fixed: code.to_string(),
        explanation: None,
        error_type: "NameError".to_string(),
    }
}

#[test]
fn set_get_round_trip_within_ttl() {
    let dir = TempDir::new().expect("tempdir");
    let cache = FixCache::open_default(dir.path(), "model-x");

    cache.set("src", "err", &fix("fixed-src"));
    let got = cache.get("src", "err").expect("hit within TTL");
    assert_eq!(got.fixed, "fixed-src");
}

#[test]
fn clear_then_get_misses_for_any_key() {
    let dir = TempDir::new().expect("tempdir");
    let cache = FixCache::open_default(dir.path(), "model-x");

    for i in 0..5 {
        cache.set(&format!("src-{i}"), "err", &fix("f"));
    }
    cache.clear();
    for i in 0..5 {
        assert!(cache.get(&format!("src-{i}"), "err").is_none());
    }
}

#[test]
fn distinct_errors_get_distinct_entries() {
    let dir = TempDir::new().expect("tempdir");
    let cache = FixCache::open_default(dir.path(), "model-x");

    cache.set("src", "NameError: a", &fix("fix-a"));
    cache.set("src", "TypeError: b", &fix("fix-b"));

    assert_eq!(cache.get("src", "NameError: a").expect("hit").fixed, "fix-a");
    assert_eq!(cache.get("src", "TypeError: b").expect("hit").fixed, "fix-b");
}

#[test]
fn model_change_purges_while_same_model_preserves() {
    let dir = TempDir::new().expect("tempdir");
    {
        let cache = FixCache::open_default(dir.path(), "model-x");
        cache.set("src", "err", &fix("f"));
    }
    {
        let cache = FixCache::open_default(dir.path(), "model-x");
        assert!(cache.get("src", "err").is_some(), "same model keeps entries");
    }
    {
        let cache = FixCache::open_default(dir.path(), "model-y");
        assert!(cache.get("src", "err").is_none(), "new model purges entries");
    }
}

#[test]
fn concurrent_writers_to_same_key_race_benignly() {
    use std::sync::Arc;
    use std::thread;

    let dir = TempDir::new().expect("tempdir");
    let cache = Arc::new(FixCache::open_default(dir.path(), "model-x"));

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.set("shared-src", "shared-err", &fix(&format!("fix-{i}")));
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    // Exactly one entry survives and it is one of the written values.
    let got = cache.get("shared-src", "shared-err").expect("hit");
    assert!(got.fixed.starts_with("fix-"));
    assert_eq!(cache.stats().entries, 1);
}

#[test]
fn stats_reflect_traffic() {
    let dir = TempDir::new().expect("tempdir");
    let cache = FixCache::open_default(dir.path(), "model-x");

    for i in 0..3 {
        let _ = cache.get(&format!("miss-{i}"), "err");
    }
    cache.set("hit-src", "err", &fix("f"));
    let _ = cache.get("hit-src", "err");

    let stats = cache.stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.total_requests, 4);
    assert!(stats.size_bytes > 0);
}
