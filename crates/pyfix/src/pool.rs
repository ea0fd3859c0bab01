//! Interpreter pool — persistent-thread-per-slot actor model.
//!
//! Interpreter construction is by far the most expensive step of a sandboxed
//! execution, so the sandbox keeps a small pool of pre-warmed interpreters.
//! Each pool slot is a dedicated OS thread that:
//!
//! 1. Initializes one `PyInterp` at startup (pre-warming).
//! 2. Blocks on a `Receiver<SlotWork>` channel.
//! 3. On receiving work: runs the job, resets `sys.modules` to its baseline,
//!    sends the outcome back via the work item's response channel.
//! 4. The interpreter NEVER crosses thread boundaries — `PyInterp` is not
//!    `Send`, only the channel endpoints are.
//!
//! ## Timeout handling
//!
//! If the caller's `recv_timeout` on the response channel expires, the work is
//! already executing on the slot thread. The slot finishes eventually, finds
//! the response channel disconnected, discards the result, resets interpreter
//! state, and returns its sender to the available queue. Pool size stays
//! stable; no replacement thread is needed.
//!
//! ## Pool size
//!
//! Configured via `PYFIX_POOL_SIZE` at first use. Default: 4.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::vm::{build_interpreter, run_job, PyInterp, VmJob, VmOutcome};

/// A unit of work sent from the sandbox to a pool slot thread.
///
/// All fields are `Send`: the job carries only strings, the shared output
/// sink, and the cancel token; the response end is a `SyncSender`.
pub(crate) struct SlotWork {
    pub job: VmJob,
    pub response: std::sync::mpsc::SyncSender<VmOutcome>,
}

// ── Pool slot ────────────────────────────────────────────────────────────────

type SlotQueue = Arc<(Mutex<VecDeque<std::sync::mpsc::SyncSender<SlotWork>>>, Condvar)>;

/// Start one pool slot: a dedicated OS thread owning one interpreter.
///
/// Returns the sender the pool uses to dispatch work to this slot.
fn start_slot_thread(slot_id: usize, available: SlotQueue) -> std::sync::mpsc::SyncSender<SlotWork> {
    // Bounded capacity 1: the slot processes one item at a time.
    let (tx, rx) = std::sync::mpsc::sync_channel::<SlotWork>(1);
    let tx_for_pool = tx.clone();

    std::thread::Builder::new()
        .name(format!("pyfix-pool-slot-{slot_id}"))
        .spawn(move || {
            let interp = build_interpreter();

            // Baseline sys.modules, captured before any user code runs; the
            // slot restores it after every job so one execution's imports
            // cannot leak into the next.
            let baseline = capture_baseline_modules(&interp);

            {
                let (lock, cvar) = &*available;
                let mut queue = lock.lock().expect("pool slot queue poisoned");
                queue.push_back(tx.clone());
                cvar.notify_one();
            }

            loop {
                let work = match rx.recv() {
                    Ok(work) => work,
                    Err(_) => break, // Pool dropped; exit.
                };

                let outcome = run_job(&interp, &work.job);

                reset_sys_modules(&interp, &baseline);

                // If the caller timed out, the receiver is gone and send fails;
                // discard and continue.
                let _ = work.response.send(outcome);

                {
                    let (lock, cvar) = &*available;
                    let mut queue = lock.lock().expect("pool slot queue poisoned");
                    queue.push_back(tx.clone());
                    cvar.notify_one();
                }
            }
        })
        .expect("failed to spawn pool slot thread");

    tx_for_pool
}

// ── sys.modules baseline capture and reset ───────────────────────────────────

/// The set of module names currently in sys.modules.
fn capture_baseline_modules(interp: &PyInterp) -> HashSet<String> {
    interp.with_vm(|vm| {
        let sys_modules = match vm.sys_module.get_attr("modules", vm) {
            Ok(m) => m,
            Err(_) => return HashSet::new(),
        };
        let keys = match vm.call_method(&sys_modules, "keys", ()) {
            Ok(k) => k,
            Err(_) => return HashSet::new(),
        };
        let iter = match vm.call_method(&keys, "__iter__", ()) {
            Ok(i) => i,
            Err(_) => return HashSet::new(),
        };
        let mut result = HashSet::new();
        loop {
            match vm.call_method(&iter, "__next__", ()) {
                Ok(key) => {
                    if let Ok(s) = key.str(vm) {
                        result.insert(s.as_str().to_owned());
                    }
                }
                Err(_) => break, // StopIteration or error
            }
        }
        result
    })
}

/// Remove any sys.modules entries that were not present at baseline.
fn reset_sys_modules(interp: &PyInterp, baseline: &HashSet<String>) {
    let current = capture_baseline_modules(interp);
    let extras: Vec<String> = current.difference(baseline).cloned().collect();
    if extras.is_empty() {
        return;
    }
    debug!(count = extras.len(), "resetting sys.modules after execution");
    interp.with_vm(|vm| {
        let sys_modules = match vm.sys_module.get_attr("modules", vm) {
            Ok(m) => m,
            Err(_) => return,
        };
        for name in &extras {
            let _ = vm.call_method(
                &sys_modules,
                "pop",
                (vm.ctx.new_str(name.as_str()), vm.ctx.none()),
            );
        }
    });
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// A fixed-size pool of pre-warmed interpreters.
pub(crate) struct InterpreterPool {
    available: SlotQueue,
    size: usize,
}

impl InterpreterPool {
    /// Create a pool with `size` slots (clamped to at least 1).
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        let available: SlotQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        for slot_id in 0..size {
            start_slot_thread(slot_id, Arc::clone(&available));
        }
        Self { available, size }
    }

    /// Process-wide pool. Size read once from `PYFIX_POOL_SIZE` (default 4).
    pub(crate) fn global() -> &'static InterpreterPool {
        static INSTANCE: OnceLock<InterpreterPool> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let size = std::env::var("PYFIX_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(4);
            InterpreterPool::new(size)
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Hand `work` to an available slot, waiting up to `checkout_timeout` for
    /// one to free up. Returns `false` if every slot stayed busy — the caller
    /// falls back to a fresh interpreter.
    pub(crate) fn dispatch(&self, work: SlotWork, checkout_timeout: Duration) -> bool {
        let (lock, cvar) = &*self.available;
        let mut queue = lock.lock().expect("pool slot queue poisoned");

        let deadline = std::time::Instant::now() + checkout_timeout;
        while queue.is_empty() {
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            let (guard, timeout_result) = cvar
                .wait_timeout(queue, remaining)
                .expect("pool slot queue poisoned");
            queue = guard;
            if timeout_result.timed_out() && queue.is_empty() {
                return false;
            }
        }

        let slot = queue.pop_front().expect("queue checked non-empty");
        drop(queue);

        // A slot sender with a full buffer means the slot is mid-job; that
        // cannot happen for senders taken from the available queue.
        slot.send(work).is_ok()
    }
}
