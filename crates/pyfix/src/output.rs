//! Thread-safe stdout capture for sandboxed executions.
//!
//! [`OutputSink`] accumulates everything the rebound `print` writes during an
//! execution. The buffer is shared between the calling thread (which reads the
//! result after execution) and the VM worker thread (which writes during
//! execution) via `Arc<Mutex<_>>` interior mutability.
//!
//! Unlike a hard output limit, the cap here is a retention bound: writes past
//! `max_bytes` are silently discarded and a truncation flag is set, so noisy
//! user code keeps running and the caller still sees the head of its output.
//!
//! ## Timeout path
//!
//! When the VM worker is abandoned on timeout it may still hold a clone of the
//! sink. [`into_string`](OutputSink::into_string) handles this gracefully: it
//! tries `Arc::try_unwrap` first (fast path when no other clone exists) and
//! falls back to locking the `Mutex` and cloning the inner data.

use std::sync::{Arc, Mutex};

// ── Inner state ───────────────────────────────────────────────────────────────

struct SinkInner {
    bytes: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
}

impl SinkInner {
    fn new(max_bytes: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_bytes,
            truncated: false,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// A bounded capture buffer for sandboxed stdout.
///
/// Cheap to clone — all clones share the same underlying data.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl OutputSink {
    /// Creates a sink that retains up to `max_bytes` of output.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner::new(max_bytes))),
        }
    }

    /// Appends `data`, retaining at most the remaining budget.
    ///
    /// Never fails: once the budget is exhausted further bytes are dropped and
    /// the truncation flag is set.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock().expect("OutputSink mutex poisoned");
        let remaining = inner.max_bytes.saturating_sub(inner.bytes.len());
        if data.len() <= remaining {
            inner.bytes.extend_from_slice(data);
        } else {
            let keep = remaining;
            inner.bytes.extend_from_slice(&data[..keep]);
            inner.truncated = true;
        }
    }

    /// `true` once any bytes have been discarded.
    pub fn is_truncated(&self) -> bool {
        self.inner.lock().expect("OutputSink mutex poisoned").truncated
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("OutputSink mutex poisoned").bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes this handle and returns the captured output as UTF-8.
    ///
    /// Invalid UTF-8 sequences are replaced with the Unicode replacement
    /// character. If another clone exists (e.g. an abandoned worker after a
    /// timeout), the data is cloned out under the lock instead of panicking.
    pub fn into_string(self) -> (String, bool) {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let inner = mutex.into_inner().expect("OutputSink mutex poisoned");
                (
                    String::from_utf8_lossy(&inner.bytes).into_owned(),
                    inner.truncated,
                )
            }
            Err(arc) => {
                let inner = arc.lock().expect("OutputSink mutex poisoned");
                (
                    String::from_utf8_lossy(&inner.bytes).into_owned(),
                    inner.truncated,
                )
            }
        }
    }

    /// Snapshot the current contents without consuming the sink.
    pub fn peek_string(&self) -> (String, bool) {
        let inner = self.inner.lock().expect("OutputSink mutex poisoned");
        (
            String::from_utf8_lossy(&inner.bytes).into_owned(),
            inner.truncated,
        )
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_under_cap_retained() {
        let sink = OutputSink::new(64);
        sink.write(b"hello\n");
        let (out, truncated) = sink.into_string();
        assert_eq!(out, "hello\n");
        assert!(!truncated);
    }

    #[test]
    fn test_write_exactly_at_cap_not_truncated() {
        let sink = OutputSink::new(5);
        sink.write(b"hello");
        let (out, truncated) = sink.into_string();
        assert_eq!(out, "hello");
        assert!(!truncated);
    }

    #[test]
    fn test_write_past_cap_discards_and_flags() {
        let sink = OutputSink::new(5);
        sink.write(b"hello world");
        assert!(sink.is_truncated());
        let (out, truncated) = sink.into_string();
        assert_eq!(out, "hello");
        assert!(truncated);
    }

    #[test]
    fn test_writes_after_exhaustion_are_noops() {
        let sink = OutputSink::new(3);
        sink.write(b"abc");
        sink.write(b"def");
        assert_eq!(sink.len(), 3);
        assert!(sink.is_truncated());
    }

    #[test]
    fn test_clone_shares_state() {
        let sink = OutputSink::new(64);
        let clone = sink.clone();
        clone.write(b"from clone");
        let (out, _) = sink.into_string();
        assert_eq!(out, "from clone");
    }

    #[test]
    fn test_into_string_with_live_clone_does_not_panic() {
        let sink = OutputSink::new(64);
        sink.write(b"data");
        let _live = sink.clone();
        let (out, truncated) = sink.into_string();
        assert_eq!(out, "data");
        assert!(!truncated);
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let sink = OutputSink::new(64);
        sink.write(&[0xFF, 0xFE]);
        let (out, _) = sink.into_string();
        assert!(out.contains('\u{FFFD}'));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let sink = OutputSink::new(64);
        sink.write(b"peek me");
        let (first, _) = sink.peek_string();
        let (second, _) = sink.peek_string();
        assert_eq!(first, "peek me");
        assert_eq!(second, "peek me");
    }
}
