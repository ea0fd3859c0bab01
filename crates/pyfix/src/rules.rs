//! Deterministic rule handlers — the fast, free tier of the fix pipeline.
//!
//! Each handler targets one family of mechanical Python mistakes:
//! missing colons after block headers, Python-2 `print` statements, keywords
//! split by a stray space, unclosed brackets, and tab/space indentation mixes.
//! A handler advertises the error kinds it covers, confirms a match against
//! the error text, produces a [`Diagnosis`], and applies a textual rewrite.
//!
//! Handler failures are non-fatal by contract: a handler that cannot improve
//! the source returns it unchanged and the orchestrator moves on to the next
//! strategy. The per-kind suggestion tables used by the fallback path also
//! live here, since they encode the same per-error knowledge.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::types::PyErrorKind;

/// What a handler concluded about the error before rewriting anything.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub kind: PyErrorKind,
    pub description: String,
    pub line: Option<u32>,
    pub suggestions: Vec<String>,
}

/// A deterministic repair strategy for one family of errors.
pub trait RuleHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// The coarse error kinds this handler registers under.
    fn kinds(&self) -> &'static [PyErrorKind];

    /// Cheap confirmation against the raw error text.
    fn can_handle(&self, error_text: &str) -> bool;

    fn analyze(&self, error_text: &str, source: &str) -> Diagnosis;

    /// Rewrite `source`; the flag reports whether anything was applied.
    fn apply(&self, source: &str, diagnosis: &Diagnosis) -> (String, bool);
}

/// The outcome of a successful rule application.
#[derive(Debug, Clone)]
pub struct RuleFix {
    pub handler: &'static str,
    pub fixed: String,
    pub diagnosis: Diagnosis,
    pub changes: Vec<String>,
}

/// Dispatch table of handlers, indexed by coarse error kind.
pub struct RuleRegistry {
    handlers: Vec<Box<dyn RuleHandler>>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_default_handlers() -> Self {
        Self {
            handlers: vec![
                Box::new(MissingColonHandler),
                Box::new(LegacyPrintHandler),
                Box::new(SplitKeywordHandler),
                Box::new(UnclosedBracketHandler),
                Box::new(IndentNormalizerHandler),
            ],
        }
    }

    pub fn register(&mut self, handler: Box<dyn RuleHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the first matching handler for `kind`. Returns `None` when no
    /// handler matches or the match was a no-op.
    pub fn attempt(&self, source: &str, error_text: &str, kind: PyErrorKind) -> Option<RuleFix> {
        for handler in &self.handlers {
            if !handler.kinds().contains(&kind) || !handler.can_handle(error_text) {
                continue;
            }
            let diagnosis = handler.analyze(error_text, source);
            let (fixed, applied) = handler.apply(source, &diagnosis);
            if applied && fixed != source {
                debug!(handler = handler.name(), "rule handler applied");
                return Some(RuleFix {
                    handler: handler.name(),
                    changes: vec![format!("{}: {}", handler.name(), diagnosis.description)],
                    fixed,
                    diagnosis,
                });
            }
        }
        None
    }
}

fn extract_line(error_text: &str) -> Option<u32> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"line (\d+)").expect("line pattern is valid"));
    pattern
        .captures(error_text)
        .and_then(|c| c[1].parse::<u32>().ok())
}

// ── Missing colon after a block header ───────────────────────────────────────

struct MissingColonHandler;

fn block_header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\s*)(if|elif|else|for|while|def|class|try|except|finally|with)\b(.*)$")
            .expect("block header pattern is valid")
    })
}

impl RuleHandler for MissingColonHandler {
    fn name(&self) -> &'static str {
        "missing-colon"
    }

    fn kinds(&self) -> &'static [PyErrorKind] {
        &[PyErrorKind::SyntaxError]
    }

    fn can_handle(&self, error_text: &str) -> bool {
        error_text.contains("SyntaxError")
    }

    fn analyze(&self, error_text: &str, _source: &str) -> Diagnosis {
        Diagnosis {
            kind: PyErrorKind::SyntaxError,
            description: "missing colon after a block header".to_string(),
            line: extract_line(error_text),
            suggestions: vec![
                "Block headers (if, for, while, def, class, ...) must end with ':'".to_string(),
            ],
        }
    }

    fn apply(&self, source: &str, _diagnosis: &Diagnosis) -> (String, bool) {
        let mut applied = false;
        let fixed: Vec<String> = source
            .lines()
            .map(|line| {
                let trimmed = line.trim_end();
                if let Some(captures) = block_header_pattern().captures(trimmed) {
                    let rest = &captures[3];
                    // Only lines with no colon anywhere; an inline-body header
                    // like `if x: y` is already well formed.
                    if !trimmed.ends_with(':') && !rest.contains(':') && !rest.contains('#') {
                        applied = true;
                        return format!("{trimmed}:");
                    }
                }
                line.to_string()
            })
            .collect();
        (join_lines(fixed, source), applied)
    }
}

// ── Python-2 print statement ─────────────────────────────────────────────────

struct LegacyPrintHandler;

fn legacy_print_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `print foo` — a print with arguments but no opening parenthesis.
        Regex::new(r"^(\s*)print\s+([^(\s].*)$").expect("legacy print pattern is valid")
    })
}

impl RuleHandler for LegacyPrintHandler {
    fn name(&self) -> &'static str {
        "legacy-print"
    }

    fn kinds(&self) -> &'static [PyErrorKind] {
        &[PyErrorKind::SyntaxError]
    }

    fn can_handle(&self, error_text: &str) -> bool {
        error_text.contains("SyntaxError") || error_text.contains("print")
    }

    fn analyze(&self, error_text: &str, _source: &str) -> Diagnosis {
        Diagnosis {
            kind: PyErrorKind::SyntaxError,
            description: "Python 2 style print statement".to_string(),
            line: extract_line(error_text),
            suggestions: vec!["print is a function in Python 3: print(...)".to_string()],
        }
    }

    fn apply(&self, source: &str, _diagnosis: &Diagnosis) -> (String, bool) {
        let mut applied = false;
        let fixed: Vec<String> = source
            .lines()
            .map(|line| {
                if let Some(captures) = legacy_print_pattern().captures(line) {
                    let indent = &captures[1];
                    let args = captures[2].trim_end();
                    applied = true;
                    format!("{indent}print({args})")
                } else {
                    line.to_string()
                }
            })
            .collect();
        (join_lines(fixed, source), applied)
    }
}

// ── Keywords split by a stray space ──────────────────────────────────────────

struct SplitKeywordHandler;

const SPLIT_KEYWORDS: &[(&str, &str)] = &[
    ("i f ", "if "),
    ("d ef ", "def "),
    ("c lass ", "class "),
    ("f or ", "for "),
    ("wh ile ", "while "),
    ("ret urn ", "return "),
];

impl RuleHandler for SplitKeywordHandler {
    fn name(&self) -> &'static str {
        "split-keyword"
    }

    fn kinds(&self) -> &'static [PyErrorKind] {
        &[PyErrorKind::SyntaxError]
    }

    fn can_handle(&self, error_text: &str) -> bool {
        error_text.contains("SyntaxError")
    }

    fn analyze(&self, error_text: &str, _source: &str) -> Diagnosis {
        Diagnosis {
            kind: PyErrorKind::SyntaxError,
            description: "keyword split by a stray space".to_string(),
            line: extract_line(error_text),
            suggestions: vec!["Check for typos inside keywords (e.g. 'i f' for 'if')".to_string()],
        }
    }

    fn apply(&self, source: &str, _diagnosis: &Diagnosis) -> (String, bool) {
        let mut fixed = source.to_string();
        let mut applied = false;
        for (broken, correct) in SPLIT_KEYWORDS {
            if fixed.contains(broken) {
                fixed = fixed.replace(broken, correct);
                applied = true;
            }
        }
        (fixed, applied)
    }
}

// ── Unclosed brackets at end of source ───────────────────────────────────────

struct UnclosedBracketHandler;

impl RuleHandler for UnclosedBracketHandler {
    fn name(&self) -> &'static str {
        "unclosed-bracket"
    }

    fn kinds(&self) -> &'static [PyErrorKind] {
        &[PyErrorKind::SyntaxError]
    }

    fn can_handle(&self, error_text: &str) -> bool {
        error_text.contains("SyntaxError")
            || error_text.contains("EOF")
            || error_text.contains("never closed")
    }

    fn analyze(&self, error_text: &str, source: &str) -> Diagnosis {
        let missing = missing_closers(source).len();
        Diagnosis {
            kind: PyErrorKind::SyntaxError,
            description: format!("{missing} unclosed bracket(s) at end of input"),
            line: extract_line(error_text),
            suggestions: vec!["Every (, [ and { needs a matching closer".to_string()],
        }
    }

    fn apply(&self, source: &str, _diagnosis: &Diagnosis) -> (String, bool) {
        let closers = missing_closers(source);
        if closers.is_empty() {
            return (source.to_string(), false);
        }
        let mut fixed = source.trim_end().to_string();
        fixed.extend(closers);
        fixed.push('\n');
        (fixed, true)
    }
}

/// The closers needed to balance `source`, innermost first.
fn missing_closers(source: &str) -> Vec<char> {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;

    for c in source.chars() {
        match in_string {
            Some(quote) => {
                if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' => stack.push(')'),
                '[' => stack.push(']'),
                '{' => stack.push('}'),
                ')' | ']' | '}' => {
                    if stack.last() == Some(&c) {
                        stack.pop();
                    }
                }
                _ => {}
            },
        }
    }

    stack.reverse();
    stack
}

// ── Tab/space indentation normalizer ─────────────────────────────────────────

struct IndentNormalizerHandler;

impl RuleHandler for IndentNormalizerHandler {
    fn name(&self) -> &'static str {
        "indent-normalizer"
    }

    fn kinds(&self) -> &'static [PyErrorKind] {
        &[PyErrorKind::IndentationError]
    }

    fn can_handle(&self, error_text: &str) -> bool {
        error_text.contains("IndentationError") || error_text.contains("TabError")
    }

    fn analyze(&self, error_text: &str, _source: &str) -> Diagnosis {
        Diagnosis {
            kind: PyErrorKind::IndentationError,
            description: "tabs normalized to four-space indentation".to_string(),
            line: extract_line(error_text),
            suggestions: vec!["Use 4 spaces per indentation level, never tabs".to_string()],
        }
    }

    fn apply(&self, source: &str, _diagnosis: &Diagnosis) -> (String, bool) {
        if !source.contains('\t') {
            return (source.to_string(), false);
        }
        (source.replace('\t', "    "), true)
    }
}

// ── Per-kind suggestion tables (fallback path) ───────────────────────────────

/// Manual suggestions for an error kind, used when every automated strategy
/// has been exhausted.
pub fn suggestions_for(kind: PyErrorKind) -> Vec<String> {
    let suggestions: &[&str] = match kind {
        PyErrorKind::SyntaxError => &[
            "Check that every block header (if, for, def, ...) ends with ':'",
            "Check for unclosed parentheses, brackets, and quotes",
            "print is a function in Python 3: print(...)",
        ],
        PyErrorKind::IndentationError => &[
            "Use 4 spaces per indentation level, never tabs",
            "Ensure every block after a ':' is indented",
            "Check that 'else'/'except' align with their 'if'/'try'",
        ],
        PyErrorKind::ModuleNotFound | PyErrorKind::ImportError => &[
            "Check the module name for typos",
            "Only a small set of standard library modules is available here",
            "Install missing third-party packages in your own environment",
        ],
        PyErrorKind::NameError => &[
            "Define the variable before using it",
            "Check the variable name for typos",
            "Check whether the name is defined in an inner scope only",
        ],
        PyErrorKind::AttributeError => &[
            "Check the attribute name for typos",
            "Confirm the object is the type you expect (None is a common surprise)",
            "Use hasattr-style checks or a try/except around optional attributes",
        ],
        PyErrorKind::TypeError => &[
            "Check argument types; str and int never mix implicitly",
            "Convert explicitly: int(x), str(x), float(x)",
            "Check the number of arguments in the call",
        ],
        PyErrorKind::IndexError => &[
            "Check the index against len(sequence) before subscripting",
            "Remember indexes start at 0 and end at len - 1",
            "Use negative indexes (x[-1]) for elements from the end",
        ],
        PyErrorKind::KeyError => &[
            "Use dict.get(key) or 'key in dict' before subscripting",
            "Check the key for typos and type mismatches ('1' is not 1)",
        ],
        PyErrorKind::FileNotFound => &[
            "Check the file path for typos",
            "Use absolute paths or verify the working directory",
            "Create the file before reading it",
        ],
        PyErrorKind::ValueError => &[
            "Validate input before conversion: value.isdigit() before int(value)",
            "Strip whitespace: int(value.strip())",
            "Wrap risky conversions in try/except ValueError",
        ],
        PyErrorKind::ZeroDivision => &[
            "Check the divisor for zero before dividing",
            "Guard with 'if divisor:' or try/except ZeroDivisionError",
        ],
        PyErrorKind::Timeout => &[
            "Check loop conditions actually progress toward termination",
            "Reduce input sizes or algorithmic complexity",
        ],
        PyErrorKind::Unknown => &[
            "Read the full error message and traceback carefully",
            "Reduce the code to the smallest failing example",
        ],
    };
    suggestions.iter().map(|s| s.to_string()).collect()
}


/// Re-join rewritten lines, preserving the original trailing newline (or its
/// absence).
fn join_lines(lines: Vec<String>, original: &str) -> String {
    let mut joined = lines.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}
