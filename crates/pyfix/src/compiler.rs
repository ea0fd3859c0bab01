//! Safe compiler: syntax validation and the static capability scan.
//!
//! Untrusted source passes through two phases before it is allowed anywhere
//! near an interpreter:
//!
//! 1. **Syntactic parse** via `rustpython-parser`. Failures are reported with
//!    a 1-based line/column derived from the parser's byte offset.
//! 2. **Restriction scan** over the token stream: references to disallowed
//!    builtins and introspection attributes are rejected, and every `import`
//!    (top-level or nested) is checked against [`APPROVED_MODULES`]. The scan
//!    works on tokens rather than the AST so an `import` buried inside a
//!    function body is caught the same as a module-level one.
//!
//! The interpreter's import hook re-checks modules at runtime, so the static
//! scan is the fast path, not the only line of defense.
//!
//! Validation results are memoized in an LRU cache keyed by the SHA-256 of the
//! source — the planner loop re-validates candidate fixes often enough that
//! re-parsing identical text is measurable waste.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use lru::LruCache;
use rustpython_parser::{lexer, Mode, Tok};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CompileError;
use crate::types::APPROVED_MODULES;

/// Builtin and attribute names user source may not reference.
///
/// Covers dynamic evaluation, filesystem/process access points, and the
/// introspection attributes that would let code climb out of the restricted
/// builtin surface.
pub const DISALLOWED_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "breakpoint",
    "exit",
    "quit",
    "help",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "__class__",
    "__subclasses__",
    "__bases__",
    "__mro__",
    "__globals__",
    "__code__",
    "__closure__",
    "__dict__",
    "__builtins__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
];

/// Result of a syntax-only validation, shaped for the planner's
/// `validate_syntax` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyntaxReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            line: None,
            column: None,
            message: None,
        }
    }
}

/// A source unit that has passed both compiler phases.
///
/// Opaque to callers; the sandbox hands its source to a worker for bytecode
/// compilation against the restricted builtin environment. Lifetime is
/// bounded by the invoking sandbox call.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub(crate) source: String,
}

impl CompiledUnit {
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// `true` if `module` (possibly dotted) is importable in the sandbox.
///
/// A dotted submodule is approved when its top-level package is, because
/// importing `json.decoder` necessarily loads `json` first.
pub fn is_module_approved(module: &str) -> bool {
    if APPROVED_MODULES.contains(&module) {
        return true;
    }
    match module.split('.').next() {
        Some(parent) => APPROVED_MODULES.contains(&parent),
        None => false,
    }
}

/// Translates untrusted source into a [`CompiledUnit`] under the capability
/// whitelist, or explains why it refuses to.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafeCompiler;

impl SafeCompiler {
    pub fn new() -> Self {
        SafeCompiler
    }

    /// Syntax-only validation. Never executes anything.
    pub fn validate_syntax(&self, source: &str) -> SyntaxReport {
        match self.check(source) {
            Ok(_) => SyntaxReport::ok(),
            Err(CompileError::Syntax {
                message,
                line,
                column,
                ..
            }) => SyntaxReport {
                valid: false,
                line: Some(line),
                column: Some(column),
                message: Some(message),
            },
            // Restriction failures are not syntax failures.
            Err(CompileError::Restriction { .. }) => SyntaxReport::ok(),
        }
    }

    /// Run both phases and return the unit on success.
    pub fn compile(&self, source: &str) -> Result<CompiledUnit, CompileError> {
        self.check(source)?;
        Ok(CompiledUnit {
            source: source.to_string(),
        })
    }

    /// Run both phases without constructing a unit.
    pub fn check(&self, source: &str) -> Result<(), CompileError> {
        let key = source_key(source);
        if let Some(cached) = validation_cache().get(&key) {
            return cached;
        }

        let outcome = self.check_uncached(source);
        validation_cache().insert(key, outcome.clone());
        outcome
    }

    fn check_uncached(&self, source: &str) -> Result<(), CompileError> {
        if let Err(err) = rustpython_parser::parse(source, Mode::Module, "<sandbox>") {
            let offset = err.offset.to_usize().min(source.len());
            let (line, column) = line_and_column(source, offset);
            let snippet = source
                .lines()
                .nth(line.saturating_sub(1) as usize)
                .unwrap_or("")
                .to_string();
            debug!(line, column, "syntax validation failed");
            return Err(CompileError::Syntax {
                message: err.error.to_string(),
                line,
                column,
                snippet,
            });
        }

        scan_restrictions(source)
    }
}

/// Token-level capability scan. Assumes `source` already parsed cleanly.
fn scan_restrictions(source: &str) -> Result<(), CompileError> {
    enum ScanState {
        Normal,
        /// Collecting the dotted module path of an `import a.b.c` statement.
        CollectImport(String),
        /// Collecting the module path of a `from a.b import x` statement.
        CollectFrom(String),
    }

    let mut state = ScanState::Normal;

    for item in lexer::lex(source, Mode::Module) {
        let (tok, _range) = match item {
            Ok(spanned) => spanned,
            // The parse phase succeeded, so a lexical error here should not
            // happen; bail out of the scan rather than mis-flag.
            Err(_) => break,
        };

        state = match state {
            ScanState::Normal => match &tok {
                Tok::Import => ScanState::CollectImport(String::new()),
                Tok::From => ScanState::CollectFrom(String::new()),
                Tok::Name { name } if DISALLOWED_NAMES.contains(&name.as_str()) => {
                    return Err(CompileError::Restriction {
                        reason: format!("reference to '{name}' is not permitted in the sandbox"),
                    });
                }
                _ => ScanState::Normal,
            },
            ScanState::CollectImport(mut path) => match &tok {
                Tok::Name { name } => {
                    path.push_str(name);
                    ScanState::CollectImport(path)
                }
                Tok::Dot => {
                    path.push('.');
                    ScanState::CollectImport(path)
                }
                Tok::Comma => {
                    check_import(&path)?;
                    ScanState::CollectImport(String::new())
                }
                _ => {
                    check_import(&path)?;
                    ScanState::Normal
                }
            },
            ScanState::CollectFrom(mut path) => match &tok {
                Tok::Name { name } => {
                    path.push_str(name);
                    ScanState::CollectFrom(path)
                }
                Tok::Dot => {
                    path.push('.');
                    ScanState::CollectFrom(path)
                }
                Tok::Import => {
                    check_import(&path)?;
                    // The names after `import` are bindings, not modules.
                    ScanState::Normal
                }
                _ => {
                    check_import(&path)?;
                    ScanState::Normal
                }
            },
        };
    }

    // Source ending mid-import ("import json" with no trailing newline).
    match state {
        ScanState::CollectImport(path) | ScanState::CollectFrom(path) => check_import(&path)?,
        ScanState::Normal => {}
    }

    Ok(())
}

fn check_import(path: &str) -> Result<(), CompileError> {
    if path.is_empty() || path.starts_with('.') {
        return Err(CompileError::Restriction {
            reason: "relative imports are not permitted in the sandbox".to_string(),
        });
    }
    if !is_module_approved(path) {
        return Err(CompileError::Restriction {
            reason: format!("import of '{path}' is not permitted in the sandbox"),
        });
    }
    Ok(())
}

fn line_and_column(source: &str, offset: usize) -> (u32, u32) {
    let before = &source[..offset];
    let line = before.matches('\n').count() as u32 + 1;
    let column = (offset - before.rfind('\n').map(|p| p + 1).unwrap_or(0)) as u32 + 1;
    (line, column)
}

// ── Validation cache ──────────────────────────────────────────────────────────

type ValidationKey = [u8; 32];

fn source_key(source: &str) -> ValidationKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

struct ValidationCache {
    inner: Mutex<LruCache<ValidationKey, Result<(), CompileError>>>,
}

impl ValidationCache {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    fn get(&self, key: &ValidationKey) -> Option<Result<(), CompileError>> {
        self.inner
            .lock()
            .expect("ValidationCache mutex poisoned")
            .get(key)
            .cloned()
    }

    fn insert(&self, key: ValidationKey, value: Result<(), CompileError>) {
        self.inner
            .lock()
            .expect("ValidationCache mutex poisoned")
            .put(key, value);
    }
}

/// Process-wide validation cache. Capacity is read once from
/// `PYFIX_VALIDATION_CACHE_SIZE` (default 256; 0 is treated as 1).
fn validation_cache() -> &'static ValidationCache {
    static INSTANCE: OnceLock<ValidationCache> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        let capacity = std::env::var("PYFIX_VALIDATION_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(256);
        ValidationCache::new(capacity)
    })
}
