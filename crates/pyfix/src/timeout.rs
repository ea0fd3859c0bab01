//! Deadline enforcement for sandbox workers.
//!
//! The wall-clock timeout is the only cancellation channel user code has. A
//! worker cannot be forcibly killed from another thread, so the protocol is:
//!
//! 1. Wait up to the requested timeout for the worker's result.
//! 2. On expiry, raise the shared [`CancelToken`] — a cooperative interrupt
//!    the worker observes at its safe points (print writes, line-step
//!    boundaries).
//! 3. Wait a short grace window for the worker to notice.
//! 4. Give up and abandon the worker. The abandoned thread holds only clones
//!    of reference-counted state, so it cannot corrupt later executions; it
//!    terminates on its own when its work finishes or the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared cooperative-cancellation flag between a caller and its worker.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Run `f` on a fresh worker thread and wait for its result.
///
/// Returns `Some(T)` if `f` completed within `timeout` plus the grace window,
/// `None` otherwise. On expiry of `timeout` the `cancel` token is raised
/// before the grace wait begins, so cooperative workers get one last chance
/// to bail out and return partial results.
///
/// A `None` return also covers a panicking worker: the channel sender is
/// dropped without sending and the receiver observes a disconnect.
pub fn run_with_deadline<F, T>(
    f: F,
    timeout: Duration,
    grace: Duration,
    cancel: CancelToken,
) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    let _handle = thread::Builder::new()
        .name("pyfix-vm".to_string())
        .spawn(move || {
            let result = f();
            // If send fails, the receiver was dropped (timed out). Ignore.
            let _ = tx.send(result);
        })
        .expect("failed to spawn execution thread");

    match rx.recv_timeout(timeout) {
        Ok(result) => Some(result),
        Err(mpsc::RecvTimeoutError::Disconnected) => None,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.cancel();
            match rx.recv_timeout(grace) {
                Ok(result) => Some(result),
                Err(_) => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fast_closure_returns_some() {
        let result = run_with_deadline(
            || {
                thread::sleep(Duration::from_millis(1));
                42u32
            },
            Duration::from_secs(1),
            Duration::from_millis(100),
            CancelToken::new(),
        );
        assert_eq!(result, Some(42u32));
    }

    #[test]
    fn test_slow_closure_returns_none() {
        let result = run_with_deadline(
            || {
                thread::sleep(Duration::from_millis(500));
                99u32
            },
            Duration::from_millis(50),
            Duration::from_millis(50),
            CancelToken::new(),
        );
        assert!(result.is_none(), "expected None, got {result:?}");
    }

    #[test]
    fn test_cancel_token_raised_on_expiry() {
        let cancel = CancelToken::new();
        let observed = cancel.clone();
        let result = run_with_deadline(
            move || {
                // Busy-wait until cancelled, then return a partial result.
                while !observed.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                7u32
            },
            Duration::from_millis(50),
            Duration::from_millis(400),
            cancel.clone(),
        );
        // The cooperative worker noticed the flag inside the grace window.
        assert_eq!(result, Some(7));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_timeout_returns_promptly() {
        let timeout = Duration::from_millis(50);
        let grace = Duration::from_millis(50);
        let start = Instant::now();
        let result = run_with_deadline(
            || {
                thread::sleep(Duration::from_millis(800));
                0u32
            },
            timeout,
            grace,
            CancelToken::new(),
        );
        assert!(result.is_none());
        // Generous slop for CI: 5x the combined deadline.
        assert!(
            start.elapsed() < (timeout + grace) * 5,
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_panicking_closure_returns_none() {
        let result = run_with_deadline(
            || -> u32 { panic!("intentional panic in worker thread") },
            Duration::from_secs(1),
            Duration::from_millis(100),
            CancelToken::new(),
        );
        assert!(result.is_none());
    }
}
