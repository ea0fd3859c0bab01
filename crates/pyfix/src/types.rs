//! Foundational public types for the pyfix library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`SandboxSettings`] — configuration for a single sandboxed execution
//! - [`ExecutionResult`] / [`TraceResult`] / [`TrackedResult`] — execution outcomes
//! - [`SerializedValue`] — bounded, redacted snapshot of a runtime value
//! - [`ErrorKind`] — the error taxonomy surfaced at the engine boundary
//! - [`PyErrorKind`] — the Python-level error classification used by rule
//!   handlers, the fix cache, and the fix memory
//! - [`FixArtifact`] — the result of a full fix invocation
//! - capability constants: [`RESTRICTED_BUILTINS`], [`APPROVED_MODULES`]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum bytes of captured stdout retained per execution. Bytes written past
/// the cap are discarded, not an error; the result carries a truncation flag.
pub const MAX_OUTPUT_BYTES: usize = 10_000;

/// Maximum length of a serialized variable value, in bytes.
pub const MAX_SERIALIZED_LEN: usize = 200;

/// Default cap on retained variable snapshots per tracker.
pub const MAX_SNAPSHOTS: usize = 50_000;

/// Default cap on retained variable changes per tracker.
pub const MAX_CHANGES: usize = 10_000;

/// Sandbox timeout bounds, in seconds. Requested timeouts are clamped.
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 30;

/// Default sandbox timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Grace window after the cooperative interrupt before a timed-out worker is
/// abandoned, in milliseconds.
pub const TIMEOUT_GRACE_MS: u64 = 500;

/// Upper bound on planner turns (and total tool dispatches) per fix call.
pub const MAX_PLANNER_ITERATIONS: usize = 5;

/// Marker substituted for values whose serialization raised.
pub const UNREPRABLE: &str = "<unreprable>";

/// Marker substituted for values bound to secret-looking names.
pub const REDACTED: &str = "<redacted>";

/// The Python standard library modules user code is permitted to import.
///
/// Network, filesystem, and subprocess modules are deliberately absent; the
/// static restriction scan rejects top-level imports outside this list and the
/// interpreter's import hook denies the rest at runtime.
pub const APPROVED_MODULES: &[&str] = &[
    "math",
    "re",
    "json",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "string",
    "random",
];

/// The builtin names available to sandboxed code, besides `print` (which is
/// rebound to the capture sink) and the exception types in
/// [`ALLOWED_EXCEPTIONS`]. Every other builtin is unbound at execution time.
///
/// This table is fixed at compile time and never mutated; per-execution
/// builtin dictionaries are built from it fresh for each run.
pub const RESTRICTED_BUILTINS: &[&str] = &[
    "abs",
    "bool",
    "dict",
    "enumerate",
    "float",
    "int",
    "len",
    "list",
    "max",
    "min",
    "range",
    "repr",
    "round",
    "set",
    "sorted",
    "str",
    "sum",
    "tuple",
    "zip",
];

/// Exception types sandboxed code may raise and catch.
pub const ALLOWED_EXCEPTIONS: &[&str] = &[
    "ArithmeticError",
    "AttributeError",
    "BaseException",
    "Exception",
    "IndexError",
    "KeyError",
    "LookupError",
    "NameError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
];

/// Configuration that governs a single sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Wall-clock timeout in seconds, clamped to `[MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS]`.
    pub timeout_secs: u64,

    /// Maximum number of bytes retained from stdout. Further bytes are discarded.
    pub max_output_bytes: usize,

    /// Caps forwarded to the variable tracker in tracking mode.
    pub max_snapshots: usize,
    pub max_changes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: MAX_OUTPUT_BYTES,
            max_snapshots: MAX_SNAPSHOTS,
            max_changes: MAX_CHANGES,
        }
    }
}

impl SandboxSettings {
    /// Settings with the given timeout, clamped to the legal range.
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            timeout_secs: timeout_secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
            ..Self::default()
        }
    }
}

/// Error taxonomy surfaced at the engine boundary.
///
/// Serialized with an internally-tagged `"kind"` discriminator so JSON
/// consumers can switch on `error_kind.kind` without a wrapper object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ErrorKind {
    /// The source could not be parsed.
    Syntax,
    /// The source referenced a capability outside the sandbox whitelist.
    Restriction,
    /// A Python exception was raised during execution; `name` is the
    /// exception class name (e.g. `"IndexError"`).
    Runtime { name: String },
    /// Execution exceeded the wall-clock timeout.
    Timeout,
    /// A per-execution resource cap was hit.
    ResourceLimit,
    /// The LLM planner is not configured or did not respond.
    PlannerUnavailable,
    /// The fix cache could not be read or written.
    CacheUnavailable,
    /// The fix memory could not be read or written.
    MemoryUnavailable,
    /// An unrecoverable engine bug. Carries no detail across the boundary.
    Internal,
}

impl ErrorKind {
    pub fn runtime(name: impl Into<String>) -> Self {
        ErrorKind::Runtime { name: name.into() }
    }
}

/// Coarse Python error classification, detected from error text.
///
/// Rule handlers, the fix cache, and the fix memory all key on this; it is the
/// vocabulary the planner's `search_memory` tool speaks as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PyErrorKind {
    SyntaxError,
    IndentationError,
    ModuleNotFound,
    ImportError,
    NameError,
    AttributeError,
    TypeError,
    IndexError,
    KeyError,
    FileNotFound,
    ValueError,
    ZeroDivision,
    Timeout,
    Unknown,
}

impl PyErrorKind {
    /// Classify an error message by matching the fixed list of known kinds.
    ///
    /// `IndentationError` is checked before `SyntaxError` because CPython
    /// reports it as a subtype, and `ModuleNotFoundError` before `ImportError`
    /// for the same reason.
    pub fn detect(error_text: &str) -> Self {
        const TABLE: &[(&str, PyErrorKind)] = &[
            ("IndentationError", PyErrorKind::IndentationError),
            ("SyntaxError", PyErrorKind::SyntaxError),
            ("ModuleNotFoundError", PyErrorKind::ModuleNotFound),
            ("ImportError", PyErrorKind::ImportError),
            ("NameError", PyErrorKind::NameError),
            ("AttributeError", PyErrorKind::AttributeError),
            ("TypeError", PyErrorKind::TypeError),
            ("IndexError", PyErrorKind::IndexError),
            ("KeyError", PyErrorKind::KeyError),
            ("FileNotFoundError", PyErrorKind::FileNotFound),
            ("ValueError", PyErrorKind::ValueError),
            ("ZeroDivisionError", PyErrorKind::ZeroDivision),
            ("Timeout", PyErrorKind::Timeout),
        ];
        for (needle, kind) in TABLE {
            if error_text.contains(needle) {
                return *kind;
            }
        }
        PyErrorKind::Unknown
    }

    /// The canonical Python spelling of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            PyErrorKind::SyntaxError => "SyntaxError",
            PyErrorKind::IndentationError => "IndentationError",
            PyErrorKind::ModuleNotFound => "ModuleNotFoundError",
            PyErrorKind::ImportError => "ImportError",
            PyErrorKind::NameError => "NameError",
            PyErrorKind::AttributeError => "AttributeError",
            PyErrorKind::TypeError => "TypeError",
            PyErrorKind::IndexError => "IndexError",
            PyErrorKind::KeyError => "KeyError",
            PyErrorKind::FileNotFound => "FileNotFoundError",
            PyErrorKind::ValueError => "ValueError",
            PyErrorKind::ZeroDivision => "ZeroDivisionError",
            PyErrorKind::Timeout => "Timeout",
            PyErrorKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The shape-specific portion of a serialized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ValueShape {
    /// int, float, str, bool, None.
    Scalar,
    /// list / tuple: first five element reprs plus the full length.
    Sequence {
        items: Vec<String>,
        length: usize,
        truncated: bool,
    },
    /// dict: first five pairs plus the full length.
    Mapping {
        entries: Vec<(String, String)>,
        length: usize,
        truncated: bool,
    },
    /// set / frozenset: first five element reprs plus the full length.
    Set { items: Vec<String>, length: usize },
    /// Anything else: first ten non-underscore attribute names.
    Object { attributes: Vec<String> },
}

/// A bounded, redacted snapshot of a runtime value.
///
/// `preview` is the canonical ≤ 200-byte form used for change detection: long
/// reprs are truncated with an 8-hex SHA-256 fingerprint suffix, secret-named
/// variables are replaced wholesale by [`REDACTED`], and serialization
/// failures by [`UNREPRABLE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedValue {
    pub type_name: String,
    pub preview: String,
    #[serde(flatten)]
    pub shape: ValueShape,
}

impl SerializedValue {
    pub fn scalar(type_name: impl Into<String>, preview: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            preview: preview.into(),
            shape: ValueShape::Scalar,
        }
    }

    pub fn unreprable() -> Self {
        Self::scalar("unknown", UNREPRABLE)
    }
}

/// The outcome of a sandboxed execution (simple mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether execution completed without raising.
    pub success: bool,

    /// Captured stdout (UTF-8, bounded by [`MAX_OUTPUT_BYTES`]).
    pub output: String,

    /// `true` when output past the cap was discarded.
    pub output_truncated: bool,

    /// Error message; present iff `success == false`.
    pub error: Option<String>,

    /// Error classification; present iff `success == false`.
    pub error_kind: Option<ErrorKind>,

    /// Module-scope variables at the end of execution (or at failure).
    pub variables: BTreeMap<String, SerializedValue>,

    /// Elapsed wall-clock time in nanoseconds.
    pub duration_ns: u64,

    /// `true` iff the execution was aborted by the wall-clock timeout.
    pub timeout: bool,
}

impl ExecutionResult {
    /// An empty successful result, used for empty source.
    pub fn trivial() -> Self {
        Self {
            success: true,
            output: String::new(),
            output_truncated: false,
            error: None,
            error_kind: None,
            variables: BTreeMap::new(),
            duration_ns: 0,
            timeout: false,
        }
    }

    /// A failed result with no output.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            output_truncated: false,
            error: Some(message.into()),
            error_kind: Some(kind),
            variables: BTreeMap::new(),
            duration_ns: 0,
            timeout: false,
        }
    }
}

/// One stack frame captured from a failed traced execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    /// 1-based line number the frame was executing.
    pub line: u32,
    /// Function name, `"<module>"` for module scope.
    pub function: String,
    /// Up to ±3 lines of source context around `line`.
    pub context: Vec<String>,
    /// Serialized frame-local variables. Only the module frame's locals
    /// survive the unwind; function frames carry an empty map.
    pub variables: BTreeMap<String, SerializedValue>,
}

/// The outcome of a traced execution: an [`ExecutionResult`] plus stack
/// context for the failure, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResult {
    pub result: ExecutionResult,
    /// Stack frames ordered inner-to-outer. Empty on success.
    pub stack_frames: Vec<StackFrame>,
    /// 1-based line of the innermost frame at failure.
    pub error_line: Option<u32>,
    /// Short analytic strings about the failing expression.
    pub execution_context: Vec<String>,
}

/// One append-only record of a variable's value after a line executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// 1-based line number just executed.
    pub line: u32,
    pub name: String,
    /// The serialized preview form (bounded, redacted).
    pub value: String,
    pub type_name: String,
    /// Monotonic nanoseconds since the start of the execution.
    pub at_ns: u64,
}

/// Emitted when a tracked variable's serialized form changes between lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub line: u32,
    pub name: String,
    pub old: String,
    pub new: String,
    pub new_type: String,
}

/// The outcome of a line-stepped tracked execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedResult {
    pub result: ExecutionResult,
    /// All snapshots collected, including those gathered before a mid-run
    /// failure.
    pub snapshots: Vec<Snapshot>,
    pub changes: Vec<Change>,
}

/// Which strategy produced a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixMethod {
    Rule,
    Cache,
    Ai,
    Memory,
    Fallback,
}

/// The result of a full fix invocation, returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixArtifact {
    pub success: bool,
    pub original: String,
    pub fixed: Option<String>,
    pub error_kind: PyErrorKind,
    pub method: FixMethod,
    pub cache_hit: bool,
    /// Human-readable descriptions of the edits applied.
    pub changes: Vec<String>,
    pub duration_ns: u64,
    pub explanation: Option<String>,
    /// Manual suggestions, populated on the fallback path.
    pub suggestions: Vec<String>,
}
