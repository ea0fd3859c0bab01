//! RustPython VM integration for the pyfix sandbox.
//!
//! This module owns all RustPython API calls. It:
//! - Creates interpreters with the native stdlib registered and host Python
//!   paths on `sys.path` so approved pure-Python modules resolve.
//! - Builds the restricted execution scope: a fresh globals dict whose
//!   `__builtins__` contains only the enumerated safe names, a `print` bound
//!   to the calling sandbox's [`OutputSink`], and an `__import__` hook that
//!   enforces the approved-module list at runtime.
//! - Runs a [`VmJob`] in whole-program or line-stepped mode and extracts
//!   structured errors and serialized variables.
//!
//! The import hook lives in the *restricted* builtins dict, so it only governs
//! user code; stdlib modules import their own dependencies through the real
//! `builtins.__import__` untouched.
//!
//! The cooperative cancel flag is observed at the two points the VM calls back
//! into Rust: `print` writes and line-step boundaries. A cancelled worker
//! raises `SystemExit`, which user code cannot intercept with a bare
//! `except Exception`.

use std::collections::BTreeMap;
use std::time::Instant;

use rustpython_vm::{
    compiler::Mode, function::FuncArgs, scope::Scope, AsObject, Interpreter, PyObjectRef,
    PyResult, VirtualMachine,
};
use tracing::debug;

use crate::compiler::is_module_approved;
use crate::output::OutputSink;
use crate::serialize::{bounded_repr, element_repr, redact_if_sensitive};
use crate::timeout::CancelToken;
use crate::tracker::VariableTracker;
use crate::types::{
    Change, SerializedValue, Snapshot, ValueShape, ALLOWED_EXCEPTIONS, RESTRICTED_BUILTINS,
};

// ── Job / outcome types ───────────────────────────────────────────────────────

/// How a job's source is driven through the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecMode {
    /// One compile, one run.
    Whole,
    /// Logical line at a time, snapshotting variables after each unit.
    Stepped,
}

/// A unit of work for a VM worker.
pub(crate) struct VmJob {
    pub source: String,
    pub mode: ExecMode,
    pub sink: OutputSink,
    pub cancel: CancelToken,
    pub max_snapshots: usize,
    pub max_changes: usize,
}

/// A structured execution failure, pre-classification.
#[derive(Debug, Clone)]
pub(crate) struct VmFailure {
    /// Python exception class name (`"IndexError"`, `"SyntaxError"`, …).
    pub kind_name: String,
    pub message: String,
    /// Python-formatted traceback text, empty for compile-time failures.
    pub traceback: String,
}

/// Raw result of running a [`VmJob`], before the sandbox shapes it.
pub(crate) struct VmOutcome {
    pub failure: Option<VmFailure>,
    pub variables: BTreeMap<String, SerializedValue>,
    pub snapshots: Vec<Snapshot>,
    pub changes: Vec<Change>,
    /// The worker observed the cancel flag and bailed out early.
    pub cancelled: bool,
}

impl VmOutcome {
    fn empty() -> Self {
        Self {
            failure: None,
            variables: BTreeMap::new(),
            snapshots: Vec::new(),
            changes: Vec::new(),
            cancelled: false,
        }
    }
}

// ── Interpreter lifecycle ─────────────────────────────────────────────────────

/// A configured interpreter owned by one worker thread.
pub(crate) struct PyInterp {
    inner: Interpreter,
}

impl PyInterp {
    /// Execute a closure with access to the VirtualMachine.
    ///
    /// Used by the pool for sys.modules inspection and reset. The closure
    /// must not store references to the VM outside its scope.
    pub(crate) fn with_vm<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&VirtualMachine) -> R,
    {
        self.inner.enter(f)
    }
}

/// Candidate filesystem paths for a host Python standard library.
///
/// RustPython can run pure-Python stdlib modules (json, collections, re, …)
/// from a host installation when they are on `sys.path`. Native modules from
/// `rustpython_stdlib::get_module_inits()` take precedence over any `.so`
/// files found there.
fn python_stdlib_paths() -> Vec<String> {
    let candidates = [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/local/lib/python3.10",
        "/usr/local/lib/python3.9",
        "/usr/lib/python3",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3.10",
    ];
    candidates
        .iter()
        .filter(|p| std::path::Path::new(p).is_dir())
        .map(|p| p.to_string())
        .collect()
}

/// Create a new interpreter with the native stdlib registered.
pub(crate) fn build_interpreter() -> PyInterp {
    let mut settings = rustpython_vm::Settings::default();
    for path in python_stdlib_paths() {
        settings.path_list.push(path);
    }

    let inner = Interpreter::with_init(settings, |vm| {
        // Native (Rust-implemented) stdlib modules: math, _json, zlib, etc.
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
    });

    PyInterp { inner }
}

// ── Job execution ─────────────────────────────────────────────────────────────

/// Run `job` on `interp` and return the raw outcome.
pub(crate) fn run_job(interp: &PyInterp, job: &VmJob) -> VmOutcome {
    interp.inner.enter(|vm| {
        let start = Instant::now();
        let scope = match build_restricted_scope(vm, &job.sink, &job.cancel) {
            Ok(scope) => scope,
            Err(_) => {
                let mut outcome = VmOutcome::empty();
                outcome.failure = Some(VmFailure {
                    kind_name: "RuntimeError".to_string(),
                    message: "failed to prepare the restricted execution scope".to_string(),
                    traceback: String::new(),
                });
                return outcome;
            }
        };

        match job.mode {
            ExecMode::Whole => run_whole(vm, job, scope),
            ExecMode::Stepped => run_stepped(vm, job, scope, start),
        }
    })
}

fn run_whole(vm: &VirtualMachine, job: &VmJob, scope: Scope) -> VmOutcome {
    let mut outcome = VmOutcome::empty();

    let code = match vm.compile(&job.source, Mode::Exec, "<sandbox>".to_owned()) {
        Ok(code) => code,
        Err(err) => {
            outcome.failure = Some(compile_failure(err));
            return outcome;
        }
    };

    match vm.run_code_obj(code, scope.clone()) {
        Ok(_) => {}
        Err(exc) => {
            if job.cancel.is_cancelled() {
                outcome.cancelled = true;
            }
            outcome.failure = Some(runtime_failure(vm, exc));
        }
    }

    outcome.variables = serialize_scope(vm, &scope);
    outcome
}

fn run_stepped(vm: &VirtualMachine, job: &VmJob, scope: Scope, start: Instant) -> VmOutcome {
    let mut outcome = VmOutcome::empty();
    let tracker = VariableTracker::new(job.max_snapshots, job.max_changes);

    for (line, unit) in logical_units(&job.source) {
        if job.cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let code = match vm.compile(&unit, Mode::Exec, "<tracking>".to_owned()) {
            Ok(code) => code,
            Err(err) => {
                outcome.failure = Some(compile_failure(err));
                break;
            }
        };

        if let Err(exc) = vm.run_code_obj(code, scope.clone()) {
            if job.cancel.is_cancelled() {
                outcome.cancelled = true;
            }
            outcome.failure = Some(runtime_failure(vm, exc));
            break;
        }

        let variables: Vec<(String, SerializedValue)> =
            serialize_scope(vm, &scope).into_iter().collect();
        tracker.track(line, &variables, start.elapsed().as_nanos() as u64);
    }

    outcome.variables = serialize_scope(vm, &scope);
    let (snapshots, changes) = tracker.into_parts();
    outcome.snapshots = snapshots;
    outcome.changes = changes;
    outcome
}

/// Split source into `(first_line_number, unit)` pairs, one per top-level
/// logical statement.
///
/// A unit starts at a column-zero line and absorbs its indented block, blank
/// lines, continuation clauses (`elif` / `else` / `except` / `finally`), any
/// lines inside an open bracket pair, backslash continuations, and the
/// statement following a decorator line.
pub(crate) fn logical_units(source: &str) -> Vec<(u32, String)> {
    const CONTINUATIONS: &[&str] = &["elif", "else", "except", "finally"];

    let mut units: Vec<(u32, Vec<&str>)> = Vec::new();
    let mut depth: i32 = 0;
    let mut attach_next = false;

    for (idx, raw) in source.lines().enumerate() {
        let trimmed = raw.trim();
        let indented = raw.starts_with(' ') || raw.starts_with('\t');
        let first_word = trimmed
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .next()
            .unwrap_or("");
        let continues = depth > 0
            || attach_next
            || indented
            || trimmed.is_empty()
            || CONTINUATIONS.contains(&first_word);

        if continues && !units.is_empty() {
            units.last_mut().expect("units is non-empty").1.push(raw);
        } else if trimmed.is_empty() {
            // Leading blank lines belong to no unit.
            continue;
        } else {
            units.push((idx as u32 + 1, vec![raw]));
        }

        attach_next = trimmed.ends_with('\\') || trimmed.starts_with('@');

        for c in raw.chars() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
    }

    units
        .into_iter()
        .map(|(line, lines)| (line, lines.join("\n")))
        .filter(|(_, unit)| !unit.trim().is_empty())
        .collect()
}

// ── Restricted scope construction ─────────────────────────────────────────────

/// Build the sandbox scope: globals whose `__builtins__` is the enumerated
/// safe surface with `print` and `__import__` rebound.
fn build_restricted_scope(
    vm: &VirtualMachine,
    sink: &OutputSink,
    cancel: &CancelToken,
) -> PyResult<Scope> {
    let builtins = vm.ctx.new_dict();

    for name in RESTRICTED_BUILTINS.iter().chain(ALLOWED_EXCEPTIONS.iter()) {
        if let Ok(value) = vm.builtins.get_attr(*name, vm) {
            builtins.set_item(*name, value, vm)?;
        }
    }

    builtins.set_item("print", make_print(vm, sink.clone(), cancel.clone()), vm)?;
    builtins.set_item("__import__", make_import_hook(vm), vm)?;

    let globals = vm.ctx.new_dict();
    globals.set_item("__builtins__", builtins.into(), vm)?;
    globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;

    Ok(Scope::with_builtins(None, globals, vm))
}

/// A `print` that appends to the sandbox's output sink.
///
/// Supports the `sep` / `end` keyword arguments; file redirection is ignored.
/// Observes the cancel flag: a cancelled execution raises `SystemExit` on the
/// next print.
fn make_print(vm: &VirtualMachine, sink: OutputSink, cancel: CancelToken) -> PyObjectRef {
    vm.new_function(
        "print",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            if cancel.is_cancelled() {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.system_exit.to_owned(),
                    "execution cancelled by timeout".to_owned(),
                ));
            }

            let sep = kwarg_str(&args, "sep", vm).unwrap_or_else(|| " ".to_string());
            let end = kwarg_str(&args, "end", vm).unwrap_or_else(|| "\n".to_string());

            let mut rendered: Vec<String> = Vec::with_capacity(args.args.len());
            for arg in &args.args {
                let text = arg
                    .str(vm)
                    .map(|s| s.as_str().to_owned())
                    .unwrap_or_else(|_| "<unprintable>".to_string());
                rendered.push(text);
            }

            let mut line = rendered.join(&sep);
            line.push_str(&end);
            sink.write(line.as_bytes());
            Ok(vm.ctx.none())
        },
    )
    .into()
}

fn kwarg_str(args: &FuncArgs, name: &str, vm: &VirtualMachine) -> Option<String> {
    args.kwargs
        .get(name)
        .and_then(|v| v.str(vm).ok())
        .map(|s| s.as_str().to_owned())
}

/// An `__import__` that enforces the approved-module list, then delegates to
/// the real importer.
fn make_import_hook(vm: &VirtualMachine) -> PyObjectRef {
    vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            if !is_module_approved(&module_name) {
                debug!(module = %module_name, "sandbox import denied");
                return Err(vm.new_import_error(
                    format!("module '{module_name}' is not available in the sandbox"),
                    vm.ctx.new_str(module_name),
                ));
            }

            let original = vm.builtins.get_attr("__import__", vm)?;
            original.call(args, vm)
        },
    )
    .into()
}

// ── Failure extraction ────────────────────────────────────────────────────────

fn compile_failure(err: rustpython_vm::compiler::CompileError) -> VmFailure {
    let (row, col) = err.python_location();
    VmFailure {
        kind_name: "SyntaxError".to_string(),
        message: format!("{err} (line {row}, column {col})"),
        traceback: String::new(),
    }
}

/// Convert a runtime exception into a [`VmFailure`], capturing the formatted
/// traceback via `vm.write_exception` (String implements the VM's `Write`).
fn runtime_failure(
    vm: &VirtualMachine,
    exc: rustpython_vm::builtins::PyBaseExceptionRef,
) -> VmFailure {
    let kind_name = exc.class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "unknown runtime error".to_string());

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);

    VmFailure {
        kind_name,
        message,
        traceback,
    }
}

// ── Variable serialization ────────────────────────────────────────────────────

/// Serialize every non-underscore name in the scope's globals.
fn serialize_scope(vm: &VirtualMachine, scope: &Scope) -> BTreeMap<String, SerializedValue> {
    let mut variables = BTreeMap::new();
    let globals: PyObjectRef = scope.globals.clone().into();

    for key in iterate_object(vm, &globals, usize::MAX) {
        let name = match key.str(vm) {
            Ok(s) => s.as_str().to_owned(),
            Err(_) => continue,
        };
        if name.starts_with('_') {
            continue;
        }
        let value = match vm.call_method(&globals, "get", (vm.ctx.new_str(name.clone()),)) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let mut serialized = serialize_value(vm, &value);
        serialized.preview = redact_if_sensitive(&name, serialized.preview);
        variables.insert(name, serialized);
    }

    variables
}

/// Serialize one runtime value into its bounded form.
///
/// Must never execute user code paths that were disallowed at compile time;
/// any exception raised while inspecting the value degrades the whole entry
/// to the `<unreprable>` marker.
pub(crate) fn serialize_value(vm: &VirtualMachine, value: &PyObjectRef) -> SerializedValue {
    let type_name = value.class().name().to_string();

    let repr = match value.repr(vm) {
        Ok(s) => s.as_str().to_owned(),
        Err(_) => return SerializedValue::unreprable(),
    };
    let preview = bounded_repr(&repr);

    let shape = match type_name.as_str() {
        "int" | "float" | "str" | "bool" | "NoneType" => ValueShape::Scalar,
        "list" | "tuple" => sequence_shape(vm, value),
        "dict" => mapping_shape(vm, value),
        "set" | "frozenset" => set_shape(vm, value),
        _ => object_shape(vm, value),
    };

    SerializedValue {
        type_name,
        preview,
        shape,
    }
}

fn object_len(vm: &VirtualMachine, value: &PyObjectRef) -> usize {
    vm.call_method(value, "__len__", ())
        .ok()
        .and_then(|len| {
            use rustpython_vm::TryFromObject;
            i64::try_from_object(vm, len).ok()
        })
        .map(|len| len.max(0) as usize)
        .unwrap_or(0)
}

fn sequence_shape(vm: &VirtualMachine, value: &PyObjectRef) -> ValueShape {
    let length = object_len(vm, value);
    let items: Vec<String> = iterate_object(vm, value, 5)
        .into_iter()
        .map(|item| short_repr(vm, &item))
        .collect();
    ValueShape::Sequence {
        items,
        length,
        truncated: length > 5,
    }
}

fn mapping_shape(vm: &VirtualMachine, value: &PyObjectRef) -> ValueShape {
    let length = object_len(vm, value);
    let mut entries = Vec::new();
    for key in iterate_object(vm, value, 5) {
        let key_repr = short_repr(vm, &key);
        let value_repr = match vm.call_method(value, "get", (key,)) {
            Ok(v) => short_repr(vm, &v),
            Err(_) => crate::types::UNREPRABLE.to_string(),
        };
        entries.push((key_repr, value_repr));
    }
    ValueShape::Mapping {
        entries,
        length,
        truncated: length > 5,
    }
}

fn set_shape(vm: &VirtualMachine, value: &PyObjectRef) -> ValueShape {
    let length = object_len(vm, value);
    let items: Vec<String> = iterate_object(vm, value, 5)
        .into_iter()
        .map(|item| short_repr(vm, &item))
        .collect();
    ValueShape::Set { items, length }
}

fn object_shape(vm: &VirtualMachine, value: &PyObjectRef) -> ValueShape {
    let mut attributes = Vec::new();
    if let Ok(dir) = vm.call_method(value, "__dir__", ()) {
        for attr in iterate_object(vm, &dir, usize::MAX) {
            if attributes.len() >= 10 {
                break;
            }
            if let Ok(name) = attr.str(vm) {
                let name = name.as_str().to_owned();
                if !name.starts_with('_') {
                    attributes.push(name);
                }
            }
        }
    }
    ValueShape::Object { attributes }
}

fn short_repr(vm: &VirtualMachine, value: &PyObjectRef) -> String {
    value
        .repr(vm)
        .map(|s| element_repr(s.as_str()))
        .unwrap_or_else(|_| crate::types::UNREPRABLE.to_string())
}

/// Collect up to `limit` items from an iterable via the iterator protocol.
fn iterate_object(vm: &VirtualMachine, value: &PyObjectRef, limit: usize) -> Vec<PyObjectRef> {
    let mut items = Vec::new();
    let iter = match vm.call_method(value, "__iter__", ()) {
        Ok(iter) => iter,
        Err(_) => return items,
    };
    while items.len() < limit {
        match vm.call_method(&iter, "__next__", ()) {
            Ok(item) => items.push(item),
            Err(_) => break, // StopIteration or error
        }
    }
    items
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, mode: ExecMode) -> (VmOutcome, OutputSink) {
        let sink = OutputSink::new(10_000);
        let job = VmJob {
            source: source.to_string(),
            mode,
            sink: sink.clone(),
            cancel: CancelToken::new(),
            max_snapshots: 1_000,
            max_changes: 1_000,
        };
        let interp = build_interpreter();
        (run_job(&interp, &job), sink)
    }

    // ── logical_units (no VM required) ───────────────────────────────────────

    #[test]
    fn test_logical_units_simple_lines() {
        let units = logical_units("x = 10\nx = x + 5\nprint(x)\n");
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], (1, "x = 10".to_string()));
        assert_eq!(units[1], (2, "x = x + 5".to_string()));
        assert_eq!(units[2], (3, "print(x)".to_string()));
    }

    #[test]
    fn test_logical_units_groups_blocks() {
        let source = "for i in range(3):\n    x = i\n    y = x * 2\nprint('done')\n";
        let units = logical_units(source);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, 1);
        assert!(units[0].1.contains("y = x * 2"));
        assert_eq!(units[1].0, 4);
    }

    #[test]
    fn test_logical_units_attaches_else_clause() {
        let source = "if x > 0:\n    y = 1\nelse:\n    y = 2\n";
        let units = logical_units(source);
        assert_eq!(units.len(), 1);
        assert!(units[0].1.contains("else:"));
    }

    #[test]
    fn test_logical_units_respects_open_brackets() {
        let source = "x = [\n1,\n2,\n]\ny = 5\n";
        let units = logical_units(source);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, 1);
        assert_eq!(units[1].0, 5);
    }

    #[test]
    fn test_logical_units_keeps_decorator_with_function() {
        let source = "@decorate\ndef f():\n    return 1\nprint(f())\n";
        let units = logical_units(source);
        assert_eq!(units.len(), 2);
        assert!(units[0].1.contains("@decorate"));
        assert!(units[0].1.contains("def f():"));
    }

    #[test]
    fn test_logical_units_honours_backslash_continuation() {
        let source = "x = 1 + \\\n2\ny = 3\n";
        let units = logical_units(source);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, 1);
        assert!(units[0].1.contains('2'));
        assert_eq!(units[1].0, 3);
    }

    #[test]
    fn test_logical_units_skips_leading_blanks() {
        let units = logical_units("\n\nx = 1\n");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].0, 3);
    }

    // ── VM-backed tests (slow: fresh interpreter per test) ───────────────────

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_print_captured() {
        let (outcome, sink) = run("print('hello')", ExecMode::Whole);
        assert!(outcome.failure.is_none(), "{:?}", outcome.failure);
        let (out, _) = sink.into_string();
        assert_eq!(out, "hello\n");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_print_sep_end_kwargs() {
        let (_, sink) = run("print(1, 2, sep='-', end='!')", ExecMode::Whole);
        let (out, _) = sink.into_string();
        assert_eq!(out, "1-2!");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_runtime_failure_classified() {
        let (outcome, _) = run("x = [1, 2, 3]\nprint(x[10])", ExecMode::Whole);
        let failure = outcome.failure.expect("should fail");
        assert_eq!(failure.kind_name, "IndexError");
        assert!(failure.traceback.contains("line 2"), "{}", failure.traceback);
        // Variables at failure still serialized.
        assert!(outcome.variables.contains_key("x"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_unapproved_runtime_import_denied() {
        // The static scan would catch this first in the full pipeline; the
        // hook is the backstop.
        let (outcome, _) = run("import socket", ExecMode::Whole);
        let failure = outcome.failure.expect("should fail");
        assert_eq!(failure.kind_name, "ImportError");
        assert!(failure.message.contains("socket"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_unlisted_builtin_is_unbound() {
        let (outcome, _) = run("open('/etc/passwd')", ExecMode::Whole);
        let failure = outcome.failure.expect("should fail");
        assert_eq!(failure.kind_name, "NameError");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_stepped_execution_tracks_changes() {
        let (outcome, sink) = run("x = 10\nx = x + 5\nprint(x)\n", ExecMode::Stepped);
        assert!(outcome.failure.is_none(), "{:?}", outcome.failure);
        let (out, _) = sink.into_string();
        assert_eq!(out, "15\n");

        let x_changes: Vec<_> = outcome.changes.iter().filter(|c| c.name == "x").collect();
        assert_eq!(x_changes.len(), 1);
        assert_eq!(x_changes[0].old, "10");
        assert_eq!(x_changes[0].new, "15");
        assert_eq!(x_changes[0].line, 2);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_stepped_keeps_partial_snapshots_on_failure() {
        let (outcome, _) = run("x = 1\ny = x / 0\nz = 3\n", ExecMode::Stepped);
        assert!(outcome.failure.is_some());
        assert!(outcome.snapshots.iter().any(|s| s.name == "x"));
        assert!(!outcome.snapshots.iter().any(|s| s.name == "z"));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_sequence_serialization_shape() {
        let (outcome, _) = run("x = [1, 2, 3]", ExecMode::Whole);
        let value = &outcome.variables["x"];
        assert_eq!(value.type_name, "list");
        match &value.shape {
            ValueShape::Sequence {
                items,
                length,
                truncated,
            } => {
                assert_eq!(items.len(), 3);
                assert_eq!(*length, 3);
                assert!(!truncated);
            }
            other => panic!("expected Sequence, got {other:?}"),
        }
    }
}
