// pyfix: automatic Python error-fixing engine with an embedded RustPython sandbox.

pub mod compiler;
pub mod config;
pub mod error;
pub mod fix_cache;
pub mod memory;
pub mod orchestrator;
pub mod output;
pub mod planner;
pub(crate) mod pool;
pub mod rules;
pub mod sandbox;
pub mod serialize;
pub mod timeout;
pub mod tools;
pub mod tracker;
pub mod types;
pub(crate) mod vm;

pub use compiler::{SafeCompiler, SyntaxReport};
pub use config::EngineConfig;
pub use error::{CompileError, EngineError};
pub use fix_cache::{CachedFix, FixCache};
pub use memory::FixMemory;
pub use orchestrator::HybridFixOrchestrator;
pub use sandbox::ExecutionSandbox;
pub use tracker::VariableTracker;
pub use types::{
    ErrorKind, ExecutionResult, FixArtifact, FixMethod, PyErrorKind, SandboxSettings,
    SerializedValue, TraceResult, TrackedResult,
};
