//! The diagnostic execution sandbox.
//!
//! Top-level pipeline for one sandboxed execution:
//! 1. Syntax validation via the safe compiler (no interpreter involved).
//! 2. Static restriction check against the capability whitelist.
//! 3. Dispatch to a pre-warmed pool interpreter (warm path), falling back to a
//!    fresh interpreter on a new thread when every slot is busy.
//! 4. Wait up to the requested timeout; on expiry raise the cooperative
//!    cancel flag, wait a short grace window, then abandon the worker and
//!    report `Timeout`. An abandoned worker finishing late is harmless — its
//!    slot rejoins the pool and its result is discarded.
//!
//! Three entry points share this pipeline: [`execute`](ExecutionSandbox::execute)
//! (simple mode), [`execute_with_trace`](ExecutionSandbox::execute_with_trace)
//! (adds stack context on failure), and
//! [`execute_with_tracking`](ExecutionSandbox::execute_with_tracking)
//! (line-stepped variable history).

use std::sync::mpsc::sync_channel;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::compiler::SafeCompiler;
use crate::error::CompileError;
use crate::output::OutputSink;
use crate::pool::{InterpreterPool, SlotWork};
use crate::timeout::{run_with_deadline, CancelToken};
use crate::types::{
    ErrorKind, ExecutionResult, SandboxSettings, StackFrame, TraceResult, TrackedResult,
    MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS, TIMEOUT_GRACE_MS,
};
use crate::vm::{build_interpreter, run_job, ExecMode, VmFailure, VmJob, VmOutcome};

/// How long to wait for a pool slot before falling back to a fresh
/// interpreter. Generous so all slots can finish current work first.
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes untrusted Python under timeout-enforced isolation.
pub struct ExecutionSandbox {
    compiler: SafeCompiler,
    settings: SandboxSettings,
    last_trace: Mutex<Option<TraceResult>>,
}

impl Default for ExecutionSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionSandbox {
    pub fn new() -> Self {
        Self::with_settings(SandboxSettings::default())
    }

    pub fn with_settings(settings: SandboxSettings) -> Self {
        Self {
            compiler: SafeCompiler::new(),
            settings,
            last_trace: Mutex::new(None),
        }
    }

    pub fn compiler(&self) -> &SafeCompiler {
        &self.compiler
    }

    /// Execute `source` in simple mode.
    pub fn execute(&self, source: &str, timeout_secs: u64) -> ExecutionResult {
        self.run(source, timeout_secs, ExecMode::Whole).result
    }

    /// Execute `source` and capture stack context on failure.
    ///
    /// The result is also retained in the per-process last-trace slot until
    /// [`clear_last_trace`](Self::clear_last_trace) is called.
    pub fn execute_with_trace(&self, source: &str, timeout_secs: u64) -> TraceResult {
        let run = self.run(source, timeout_secs, ExecMode::Whole);
        let trace = self.assemble_trace(source, run);
        *self.last_trace.lock().expect("last-trace mutex poisoned") = Some(trace.clone());
        trace
    }

    /// Execute `source` one logical line at a time, recording variable
    /// history. On mid-run failure, all snapshots collected so far are
    /// returned alongside the failure.
    pub fn execute_with_tracking(&self, source: &str, timeout_secs: u64) -> TrackedResult {
        let run = self.run(source, timeout_secs, ExecMode::Stepped);
        TrackedResult {
            snapshots: run.snapshots,
            changes: run.changes,
            result: run.result,
        }
    }

    /// The most recent traced execution, if any.
    pub fn last_trace(&self) -> Option<TraceResult> {
        self.last_trace
            .lock()
            .expect("last-trace mutex poisoned")
            .clone()
    }

    pub fn clear_last_trace(&self) {
        *self.last_trace.lock().expect("last-trace mutex poisoned") = None;
    }

    // ── Shared pipeline ──────────────────────────────────────────────────────

    fn run(&self, source: &str, timeout_secs: u64, mode: ExecMode) -> RunOutput {
        let start = Instant::now();
        let timeout_secs = timeout_secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);

        if source.trim().is_empty() {
            return RunOutput::from_result(ExecutionResult::trivial());
        }

        let report = self.compiler.validate_syntax(source);
        if !report.valid {
            let message = format!(
                "SyntaxError: {} (line {})",
                report.message.as_deref().unwrap_or("invalid syntax"),
                report.line.unwrap_or(0),
            );
            let mut result = ExecutionResult::failure(ErrorKind::Syntax, message);
            result.duration_ns = start.elapsed().as_nanos() as u64;
            return RunOutput::from_result(result);
        }

        if let Err(CompileError::Restriction { reason }) = self.compiler.check(source) {
            let mut result = ExecutionResult::failure(
                ErrorKind::Restriction,
                format!("RestrictionError: {reason}"),
            );
            result.duration_ns = start.elapsed().as_nanos() as u64;
            return RunOutput::from_result(result);
        }

        let sink = OutputSink::new(self.settings.max_output_bytes);
        let cancel = CancelToken::new();
        let timeout = Duration::from_secs(timeout_secs);
        let grace = Duration::from_millis(TIMEOUT_GRACE_MS);

        debug!(timeout_secs, ?mode, "sandbox execution starting");

        let make_job = || VmJob {
            source: source.to_string(),
            mode,
            sink: sink.clone(),
            cancel: cancel.clone(),
            max_snapshots: self.settings.max_snapshots,
            max_changes: self.settings.max_changes,
        };

        let (response_tx, response_rx) = sync_channel::<VmOutcome>(1);
        let work = SlotWork {
            job: make_job(),
            response: response_tx,
        };

        let mut timed_out = false;
        let outcome: Option<VmOutcome> =
            if InterpreterPool::global().dispatch(work, POOL_CHECKOUT_TIMEOUT) {
                match response_rx.recv_timeout(timeout) {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        timed_out = true;
                        cancel.cancel();
                        // One grace window for the worker to notice the flag
                        // and hand back partial results.
                        response_rx.recv_timeout(grace).ok()
                    }
                }
            } else {
                warn!("interpreter pool exhausted; falling back to a fresh interpreter");
                let job = make_job();
                let result = run_with_deadline(
                    move || {
                        let interp = build_interpreter();
                        run_job(&interp, &job)
                    },
                    timeout,
                    grace,
                    cancel.clone(),
                );
                if result.is_none() {
                    timed_out = true;
                }
                result
            };

        let duration_ns = start.elapsed().as_nanos() as u64;

        match outcome {
            Some(outcome) if !timed_out && !outcome.cancelled => {
                let (output, output_truncated) = sink.into_string();
                let (error, error_kind) = match &outcome.failure {
                    Some(failure) => {
                        let (message, kind) = classify_failure(failure);
                        (Some(message), Some(kind))
                    }
                    None => (None, None),
                };
                let success = outcome.failure.is_none();
                if success {
                    info!(duration_ns, "sandbox execution succeeded");
                } else {
                    debug!(duration_ns, error = ?error, "sandbox execution failed");
                }
                RunOutput {
                    result: ExecutionResult {
                        success,
                        output,
                        output_truncated,
                        error,
                        error_kind,
                        variables: outcome.variables,
                        duration_ns,
                        timeout: false,
                    },
                    failure: outcome.failure,
                    snapshots: outcome.snapshots,
                    changes: outcome.changes,
                }
            }
            Some(outcome) => {
                // The worker noticed the cancel flag inside the grace window;
                // partial output and snapshots are still worth returning.
                let (output, output_truncated) = sink.into_string();
                warn!(timeout_secs, "sandbox execution timed out (worker cooperated)");
                RunOutput {
                    result: timeout_result(timeout_secs, output, output_truncated, duration_ns),
                    failure: None,
                    snapshots: outcome.snapshots,
                    changes: outcome.changes,
                }
            }
            None => {
                // The worker survived the interrupt and the grace period. It
                // keeps running detached; it holds only clones of shared state
                // and cannot touch this call's result.
                error!(
                    timeout_secs,
                    security = true,
                    "sandbox worker survived forced termination; abandoning it"
                );
                let (output, output_truncated) = sink.into_string();
                RunOutput {
                    result: timeout_result(timeout_secs, output, output_truncated, duration_ns),
                    failure: None,
                    snapshots: Vec::new(),
                    changes: Vec::new(),
                }
            }
        }
    }

    // ── Trace assembly ───────────────────────────────────────────────────────

    fn assemble_trace(&self, source: &str, run: RunOutput) -> TraceResult {
        let Some(failure) = &run.failure else {
            return TraceResult {
                result: run.result,
                stack_frames: Vec::new(),
                error_line: None,
                execution_context: Vec::new(),
            };
        };

        let mut frames = parse_traceback_frames(source, &failure.traceback);
        // Traceback text lists frames outermost first; callers want them
        // inner-to-outer.
        frames.reverse();

        // Post-mortem, only the module frame's locals are still reachable.
        for frame in &mut frames {
            if frame.function == "<module>" {
                frame.variables = run.result.variables.clone();
            }
        }

        let error_line = frames.first().map(|f| f.line).or_else(|| {
            // Compile-time failures have no traceback; fall back to the
            // reported syntax line.
            extract_line_hint(run.result.error.as_deref().unwrap_or(""))
        });

        let execution_context = error_line
            .map(|line| analyze_failing_line(source, line, &run.result))
            .unwrap_or_default();

        TraceResult {
            result: run.result,
            stack_frames: frames,
            error_line,
            execution_context,
        }
    }
}

struct RunOutput {
    result: ExecutionResult,
    failure: Option<VmFailure>,
    snapshots: Vec<crate::types::Snapshot>,
    changes: Vec<crate::types::Change>,
}

impl RunOutput {
    fn from_result(result: ExecutionResult) -> Self {
        Self {
            result,
            failure: None,
            snapshots: Vec::new(),
            changes: Vec::new(),
        }
    }
}

fn timeout_result(
    timeout_secs: u64,
    output: String,
    output_truncated: bool,
    duration_ns: u64,
) -> ExecutionResult {
    ExecutionResult {
        success: false,
        output,
        output_truncated,
        error: Some(format!("Timeout: execution exceeded {timeout_secs}s limit")),
        error_kind: Some(ErrorKind::Timeout),
        variables: Default::default(),
        duration_ns,
        timeout: true,
    }
}

/// Compose the user-facing message and boundary kind for a VM failure.
fn classify_failure(failure: &VmFailure) -> (String, ErrorKind) {
    let message = if failure.message.starts_with(&failure.kind_name) {
        failure.message.clone()
    } else {
        format!("{}: {}", failure.kind_name, failure.message)
    };
    let kind = match failure.kind_name.as_str() {
        "SyntaxError" | "IndentationError" => ErrorKind::Syntax,
        name => ErrorKind::runtime(name),
    };
    (message, kind)
}

/// Pull `File "...", line N, in NAME` frames out of a formatted traceback,
/// attaching ±3 lines of source context to each.
fn parse_traceback_frames(source: &str, traceback: &str) -> Vec<StackFrame> {
    static FRAME_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = FRAME_PATTERN.get_or_init(|| {
        Regex::new(r#"File "[^"]*", line (\d+), in (\S+)"#).expect("frame pattern is valid")
    });

    let source_lines: Vec<&str> = source.lines().collect();
    let mut frames = Vec::new();

    for captures in pattern.captures_iter(traceback) {
        let line: u32 = captures[1].parse().unwrap_or(0);
        let function = captures[2].to_string();

        let mut context = Vec::new();
        if line > 0 {
            let center = line as usize - 1;
            let lo = center.saturating_sub(3);
            let hi = (center + 3).min(source_lines.len().saturating_sub(1));
            for (offset, text) in source_lines
                .iter()
                .enumerate()
                .take(hi + 1)
                .skip(lo)
                .map(|(i, t)| (i, *t))
            {
                let marker = if offset == center { ">" } else { " " };
                context.push(format!("{marker} {:>4} | {text}", offset + 1));
            }
        }

        frames.push(StackFrame {
            line,
            function,
            context,
            variables: Default::default(),
        });
    }

    frames
}

fn extract_line_hint(message: &str) -> Option<u32> {
    static LINE_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        LINE_PATTERN.get_or_init(|| Regex::new(r"line (\d+)").expect("line pattern is valid"));
    pattern
        .captures(message)
        .and_then(|c| c[1].parse::<u32>().ok())
}

/// Short analytic strings about the failing expression: the line itself plus
/// the serialized value of every variable it references.
fn analyze_failing_line(
    source: &str,
    line: u32,
    result: &ExecutionResult,
) -> Vec<String> {
    let Some(text) = source.lines().nth(line as usize - 1) else {
        return Vec::new();
    };

    let mut context = vec![format!("line {line}: {}", text.trim())];
    let mut seen = std::collections::HashSet::new();

    for token in text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if token.is_empty() || !seen.insert(token.to_string()) {
            continue;
        }
        if let Some(value) = result.variables.get(token) {
            context.push(format!(
                "{token} = {} ({})",
                value.preview, value.type_name
            ));
        }
    }

    context
}
