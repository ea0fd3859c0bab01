//! Operational error taxonomy for the pyfix engine.
//!
//! Compilation outcomes ([`CompileError`]) are data, returned to callers and
//! serialized into tool results; [`EngineError`] covers the infrastructure
//! failures (I/O, planner transport) that degrade to miss/fallback per the
//! engine's failure policy.

use serde::{Deserialize, Serialize};

/// Why a source unit was refused by the safe compiler.
///
/// Serialized with an internally-tagged `"type"` discriminator field so JSON
/// consumers can switch on `error.type` without a wrapper object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompileError {
    /// The source could not be parsed.
    Syntax {
        message: String,
        /// 1-based line number of the error, or 0 if unknown.
        line: u32,
        /// 1-based column number of the error, or 0 if unknown.
        column: u32,
        /// The offending source line, when available.
        snippet: String,
    },
    /// The source referenced a capability outside the sandbox whitelist.
    Restriction { reason: String },
}

impl CompileError {
    /// Render the error the way Python would report it, so downstream
    /// error-kind detection matches on familiar text.
    pub fn python_message(&self) -> String {
        match self {
            CompileError::Syntax { message, line, .. } => {
                format!("SyntaxError: {message} (line {line})")
            }
            CompileError::Restriction { reason } => {
                format!("RestrictionError: {reason}")
            }
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.python_message())
    }
}

impl std::error::Error for CompileError {}

/// Infrastructure failures inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cache store error: {0}")]
    Cache(String),

    #[error("memory store error: {0}")]
    Memory(String),

    #[error("planner unavailable: {0}")]
    PlannerUnavailable(String),

    #[error("planner transport error: {0}")]
    PlannerTransport(String),

    #[error("planner returned a malformed response: {0}")]
    PlannerMalformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine infrastructure operations.
pub type Result<T> = std::result::Result<T, EngineError>;
