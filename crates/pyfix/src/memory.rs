//! Similarity-searchable memory of past fixes, with quality tracking.
//!
//! Each record pairs a broken source with its repaired form, keyed by
//! `md5(original ∥ error_kind)` so storing the same pair twice updates in
//! place instead of duplicating. Retrieval is k-nearest-neighbour over a
//! deterministic hashed character-trigram embedding (cosine similarity),
//! filtered by error kind.
//!
//! A quality side-table counts retrievals and outcomes per record.
//! Quality-weighted search multiplies similarity by the record's success
//! rate, granting a 0.8 prior to records retrieved fewer than three times so
//! new entries get a fair chance. `cleanup` deletes records that keep
//! failing once they have seen real use.
//!
//! Persistence is a single JSON side-store, rewritten atomically on every
//! mutation. Mutations take the writer lock; searches share the read lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::PyErrorKind;

/// Dimension of the hashed trigram embedding.
const EMBED_DIM: usize = 256;

/// Records retrieved fewer times than this get the prior success rate.
const QUALITY_PRIOR_MIN_RETRIEVALS: u64 = 3;

/// Optimistic success rate assumed for barely-used records.
const QUALITY_PRIOR: f64 = 0.8;

/// One stored fix exemplar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub original: String,
    pub fixed: String,
    /// [`PyErrorKind`] label, e.g. `"IndexError"`.
    pub error_kind: String,
    /// Strategy that produced the fix (`"rule"`, `"ai"`, …).
    pub method: String,
    pub embedding: Vec<f32>,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Usage counters for one record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityStats {
    pub retrievals: u64,
    pub successes: u64,
    pub failures: u64,
}

impl QualityStats {
    pub fn success_rate(&self) -> f64 {
        if self.retrievals == 0 {
            0.0
        } else {
            self.successes as f64 / self.retrievals as f64
        }
    }
}

/// A search result: the record plus its scores.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub similarity: f32,
    /// Effective success rate used for weighting (prior-adjusted).
    pub success_rate: f64,
    pub weighted_score: f64,
}

/// Aggregate memory statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub records: usize,
    pub total_retrievals: u64,
    pub mean_success_rate: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryStore {
    records: HashMap<String, MemoryRecord>,
    quality: HashMap<String, QualityStats>,
}

/// Vector-indexed store of `(original → fixed)` exemplars.
pub struct FixMemory {
    path: PathBuf,
    inner: RwLock<MemoryStore>,
}

impl FixMemory {
    /// Open the store at `path`, loading any existing side-store. A corrupt
    /// or unreadable file degrades to an empty store with a log line — the
    /// memory is never on the correctness path.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<MemoryStore>(&data) {
                Ok(store) => store,
                Err(err) => {
                    warn!(%err, "corrupt memory store; starting empty");
                    MemoryStore::default()
                }
            },
            Err(_) => MemoryStore::default(),
        };
        info!(path = %path.display(), records = store.records.len(), "fix memory ready");
        Self {
            path,
            inner: RwLock::new(store),
        }
    }

    /// The record id for `(original, error_kind)`.
    pub fn record_id(original: &str, error_kind: PyErrorKind) -> String {
        let digest = md5::compute(format!("{original}:{}", error_kind.label()));
        format!("{digest:x}")
    }

    /// Store a fix exemplar, updating in place when the id already exists.
    /// Returns the record id.
    pub fn store(
        &self,
        original: &str,
        error_kind: PyErrorKind,
        fixed: &str,
        method: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> String {
        let id = Self::record_id(original, error_kind);
        let record = MemoryRecord {
            id: id.clone(),
            original: original.to_string(),
            fixed: fixed.to_string(),
            error_kind: error_kind.label().to_string(),
            method: method.to_string(),
            embedding: embed(original),
            stored_at: Utc::now(),
            metadata: metadata.unwrap_or_default(),
        };

        {
            let mut inner = self.inner.write().expect("memory store lock poisoned");
            inner.records.insert(id.clone(), record);
            inner.quality.entry(id.clone()).or_default();
        }
        self.persist();
        debug!(id = %id, kind = %error_kind, "memory record stored");
        id
    }

    /// Store only when the fix passed validation; returns `None` otherwise.
    pub fn store_validated(
        &self,
        original: &str,
        error_kind: PyErrorKind,
        fixed: &str,
        method: &str,
        validation_success: bool,
    ) -> Option<String> {
        if !validation_success {
            return None;
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("validated".to_string(), "true".to_string());
        Some(self.store(original, error_kind, fixed, method, Some(metadata)))
    }

    /// Plain k-nearest-neighbour search filtered by error kind.
    pub fn search_similar(
        &self,
        query: &str,
        error_kind: PyErrorKind,
        k: usize,
    ) -> Vec<SearchHit> {
        let query_vec = embed(query);
        let label = error_kind.label();
        let inner = self.inner.read().expect("memory store lock poisoned");

        let mut hits: Vec<SearchHit> = inner
            .records
            .values()
            .filter(|r| r.error_kind == label)
            .map(|r| {
                let similarity = cosine(&query_vec, &r.embedding);
                let stats = inner.quality.get(&r.id).copied().unwrap_or_default();
                let success_rate = effective_success_rate(&stats);
                SearchHit {
                    record: r.clone(),
                    similarity,
                    success_rate,
                    weighted_score: similarity as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        hits
    }

    /// Quality-weighted search: similarity × success rate, with the prior
    /// applied to barely-used records, filtered by `min_success_rate`.
    ///
    /// Returned records have their retrieval counter bumped.
    pub fn search_with_quality(
        &self,
        query: &str,
        error_kind: PyErrorKind,
        k: usize,
        min_success_rate: f64,
    ) -> Vec<SearchHit> {
        // Over-fetch candidates, then re-rank by quality.
        let mut candidates = self.search_similar(query, error_kind, k.saturating_mul(3));

        candidates.retain(|hit| hit.success_rate >= min_success_rate);
        for hit in &mut candidates {
            hit.weighted_score = hit.similarity as f64 * hit.success_rate;
        }
        candidates.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);

        if !candidates.is_empty() {
            let mut inner = self.inner.write().expect("memory store lock poisoned");
            for hit in &candidates {
                inner
                    .quality
                    .entry(hit.record.id.clone())
                    .or_default()
                    .retrievals += 1;
            }
            drop(inner);
            self.persist();
        }

        candidates
    }

    /// Record whether a retrieved fix actually worked.
    pub fn record_outcome(&self, id: &str, success: bool) {
        {
            let mut inner = self.inner.write().expect("memory store lock poisoned");
            let stats = inner.quality.entry(id.to_string()).or_default();
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }
        self.persist();
    }

    /// Delete records whose success rate fell below `min_success_rate` after
    /// at least `min_usage` retrievals. Returns the number removed.
    pub fn cleanup(&self, min_success_rate: f64, min_usage: u64) -> usize {
        let removed = {
            let mut inner = self.inner.write().expect("memory store lock poisoned");
            let doomed: Vec<String> = inner
                .quality
                .iter()
                .filter(|(_, stats)| {
                    stats.retrievals >= min_usage && stats.success_rate() < min_success_rate
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &doomed {
                inner.records.remove(id);
                inner.quality.remove(id);
            }
            doomed.len()
        };
        if removed > 0 {
            info!(removed, "low-quality memory records removed");
            self.persist();
        }
        removed
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.read().expect("memory store lock poisoned");
        let records = inner.records.len();
        let total_retrievals: u64 = inner.quality.values().map(|s| s.retrievals).sum();
        let rates: Vec<f64> = inner
            .quality
            .values()
            .filter(|s| s.retrievals > 0)
            .map(|s| s.success_rate())
            .collect();
        let mean_success_rate = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        MemoryStats {
            records,
            total_retrievals,
            mean_success_rate,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) {
        let data = {
            let inner = self.inner.read().expect("memory store lock poisoned");
            match serde_json::to_string(&*inner) {
                Ok(data) => data,
                Err(err) => {
                    warn!(%err, "failed to serialize memory store");
                    return;
                }
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, &data).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!(%err, "failed to persist memory store");
            let _ = fs::remove_file(&tmp);
        }
    }
}

fn effective_success_rate(stats: &QualityStats) -> f64 {
    if stats.retrievals < QUALITY_PRIOR_MIN_RETRIEVALS {
        QUALITY_PRIOR
    } else {
        stats.success_rate()
    }
}

// ── Embedding ────────────────────────────────────────────────────────────────

/// Deterministic hashed character-trigram embedding, L2-normalized.
///
/// Not a learned embedding; near-duplicate sources land close together, which
/// is what exemplar retrieval needs, and determinism keeps the store portable
/// across processes.
pub(crate) fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBED_DIM];
    let bytes: Vec<u8> = text
        .bytes()
        .map(|b| if b.is_ascii_whitespace() { b' ' } else { b })
        .collect();

    if bytes.len() < 3 {
        if !bytes.is_empty() {
            vector[fnv1a(&bytes) as usize % EMBED_DIM] = 1.0;
        }
        return normalize(vector);
    }

    for trigram in bytes.windows(3) {
        vector[fnv1a(trigram) as usize % EMBED_DIM] += 1.0;
    }
    normalize(vector)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Cosine similarity of two normalized vectors.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
