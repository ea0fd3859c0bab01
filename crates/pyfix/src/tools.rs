//! The planner's tool surface.
//!
//! The planner sees exactly three tools — `execute_code`, `validate_syntax`,
//! and `search_memory` — declared with JSON schemas and dispatched here. Tool
//! results are plain JSON values: a dispatch failure becomes a structured
//! `{success: false, error: ...}` payload, never an exception, so the planner
//! can read the failure and adapt.
//!
//! Any tool name outside the declared three answers `Unknown tool`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::memory::FixMemory;
use crate::sandbox::ExecutionSandbox;
use crate::types::{PyErrorKind, TraceResult, DEFAULT_TIMEOUT_SECS};

/// Default number of memory exemplars returned to the planner.
const DEFAULT_SEARCH_K: usize = 3;

/// Quality floor applied to planner-facing memory searches.
const SEARCH_MIN_SUCCESS_RATE: f64 = 0.6;

/// Dispatches planner tool calls to the sandbox, compiler, and memory.
pub struct ToolBroker {
    sandbox: Arc<ExecutionSandbox>,
    memory: Option<Arc<FixMemory>>,
    default_timeout_secs: u64,
}

impl ToolBroker {
    pub fn new(sandbox: Arc<ExecutionSandbox>, memory: Option<Arc<FixMemory>>) -> Self {
        Self {
            sandbox,
            memory,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Tool declarations in OpenAI function-calling shape.
    pub fn declarations() -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "function": {
                    "name": "execute_code",
                    "description": "Execute Python code in an isolated sandbox and return \
                                    stdout, error details, and variable state. Use this to \
                                    reproduce failures and to verify fixes.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "code": { "type": "string", "description": "Python code to execute" },
                            "timeout": { "type": "integer", "description": "Timeout in seconds (1-30, default 5)" }
                        },
                        "required": ["code"]
                    }
                }
            }),
            json!({
                "type": "function",
                "function": {
                    "name": "validate_syntax",
                    "description": "Validate Python syntax without executing. Returns the \
                                    error line and message when invalid.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "code": { "type": "string", "description": "Python code to validate" }
                        },
                        "required": ["code"]
                    }
                }
            }),
            json!({
                "type": "function",
                "function": {
                    "name": "search_memory",
                    "description": "Search past fixes for similar errors. Returns proven \
                                    (original, fixed) pairs for the given error type.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "error_type": { "type": "string", "description": "Error type, e.g. 'IndexError'" },
                            "code": { "type": "string", "description": "Code snippet for similarity matching" },
                            "k": { "type": "integer", "description": "Number of results (default 3)" }
                        },
                        "required": ["error_type"]
                    }
                }
            }),
        ]
    }

    /// Execute one tool call and return its structured result.
    pub fn dispatch(&self, name: &str, arguments: &Value) -> Value {
        debug!(tool = name, "dispatching planner tool call");
        match name {
            "execute_code" => self.execute_code(arguments),
            "validate_syntax" => self.validate_syntax(arguments),
            "search_memory" => self.search_memory(arguments),
            other => {
                warn!(tool = other, "planner requested an unknown tool");
                json!({ "success": false, "error": "Unknown tool" })
            }
        }
    }

    fn execute_code(&self, arguments: &Value) -> Value {
        let Some(code) = arguments.get("code").and_then(Value::as_str) else {
            return json!({ "success": false, "error": "Missing required argument 'code'" });
        };
        let timeout = arguments
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs);

        let trace = self.sandbox.execute_with_trace(code, timeout);
        format_trace_for_planner(&trace)
    }

    fn validate_syntax(&self, arguments: &Value) -> Value {
        let Some(code) = arguments.get("code").and_then(Value::as_str) else {
            return json!({ "success": false, "error": "Missing required argument 'code'" });
        };
        let report = self.sandbox.compiler().validate_syntax(code);
        serde_json::to_value(&report).unwrap_or_else(|_| json!({ "valid": false }))
    }

    fn search_memory(&self, arguments: &Value) -> Value {
        let Some(memory) = &self.memory else {
            return json!({
                "success": false,
                "error": "Memory service not configured",
                "results": [],
                "count": 0,
            });
        };

        let Some(error_type) = arguments.get("error_type").and_then(Value::as_str) else {
            return json!({ "success": false, "error": "Missing required argument 'error_type'" });
        };
        let code = arguments.get("code").and_then(Value::as_str).unwrap_or("");
        let k = arguments
            .get("k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(DEFAULT_SEARCH_K);

        let kind = PyErrorKind::detect(error_type);
        let query = if code.is_empty() { error_type } else { code };
        let hits = memory.search_with_quality(query, kind, k, SEARCH_MIN_SUCCESS_RATE);

        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "id": hit.record.id,
                    "original_code": hit.record.original,
                    "fixed_code": hit.record.fixed,
                    "error_type": hit.record.error_kind,
                    "method": hit.record.method,
                    "similarity": hit.similarity,
                    "success_rate": hit.success_rate,
                })
            })
            .collect();

        json!({
            "success": true,
            "count": results.len(),
            "results": results,
            "message": format!("Found {} similar fixes for {}", results.len(), kind.label()),
        })
    }
}

/// Shape a trace result the way the planner consumes it: flat, with error
/// context only on failure.
fn format_trace_for_planner(trace: &TraceResult) -> Value {
    let mut formatted = json!({
        "success": trace.result.success,
        "stdout": trace.result.output,
        "timeout": trace.result.timeout,
        "duration_ns": trace.result.duration_ns,
    });

    if !trace.result.success {
        formatted["error"] = json!(trace.result.error);
        formatted["error_kind"] = serde_json::to_value(&trace.result.error_kind)
            .unwrap_or(Value::Null);
        formatted["error_line"] = json!(trace.error_line);
        formatted["variable_state"] = serde_json::to_value(&trace.result.variables)
            .unwrap_or_else(|_| json!({}));
        formatted["execution_context"] = json!(trace.execution_context);
    }

    formatted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, ExecutionResult};
    use tempfile::TempDir;

    fn broker_without_memory() -> ToolBroker {
        ToolBroker::new(Arc::new(ExecutionSandbox::new()), None)
    }

    fn broker_with_memory(dir: &TempDir) -> (ToolBroker, Arc<FixMemory>) {
        let memory = Arc::new(FixMemory::open(dir.path().join("memory.json")));
        let broker = ToolBroker::new(Arc::new(ExecutionSandbox::new()), Some(Arc::clone(&memory)));
        (broker, memory)
    }

    #[test]
    fn test_declarations_cover_the_three_tools() {
        let declarations = ToolBroker::declarations();
        let names: Vec<&str> = declarations
            .iter()
            .filter_map(|d| d.pointer("/function/name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["execute_code", "validate_syntax", "search_memory"]);
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let result = broker_without_memory().dispatch("rm_rf", &json!({}));
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "Unknown tool");
    }

    #[test]
    fn test_execute_code_requires_code_argument() {
        let result = broker_without_memory().dispatch("execute_code", &json!({"timeout": 5}));
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap_or("").contains("code"));
    }

    #[test]
    fn test_validate_syntax_reports_invalid() {
        let result = broker_without_memory()
            .dispatch("validate_syntax", &json!({"code": "if True\n    pass"}));
        assert_eq!(result["valid"], false);
        assert_eq!(result["line"], 1);
    }

    #[test]
    fn test_validate_syntax_reports_valid() {
        let result =
            broker_without_memory().dispatch("validate_syntax", &json!({"code": "x = 1"}));
        assert_eq!(result["valid"], true);
    }

    #[test]
    fn test_search_memory_without_service() {
        let result = broker_without_memory()
            .dispatch("search_memory", &json!({"error_type": "IndexError"}));
        assert_eq!(result["success"], false);
        assert_eq!(result["count"], 0);
        assert!(result["error"]
            .as_str()
            .unwrap_or("")
            .contains("not configured"));
    }

    #[test]
    fn test_search_memory_returns_stored_fix() {
        let dir = TempDir::new().expect("tempdir");
        let (broker, memory) = broker_with_memory(&dir);
        memory.store(
            "print(x[10])",
            PyErrorKind::IndexError,
            "print(x[-1])",
            "ai",
            None,
        );

        let result = broker.dispatch(
            "search_memory",
            &json!({"error_type": "IndexError", "code": "print(x[10])"}),
        );
        assert_eq!(result["success"], true);
        assert_eq!(result["count"], 1);
        assert_eq!(result["results"][0]["fixed_code"], "print(x[-1])");
    }

    #[test]
    fn test_search_memory_requires_error_type() {
        let dir = TempDir::new().expect("tempdir");
        let (broker, _memory) = broker_with_memory(&dir);
        let result = broker.dispatch("search_memory", &json!({"code": "x"}));
        assert_eq!(result["success"], false);
    }

    #[test]
    fn test_format_trace_success_omits_error_fields() {
        let trace = TraceResult {
            result: ExecutionResult::trivial(),
            stack_frames: Vec::new(),
            error_line: None,
            execution_context: Vec::new(),
        };
        let formatted = format_trace_for_planner(&trace);
        assert_eq!(formatted["success"], true);
        assert!(formatted.get("error").is_none());
        assert!(formatted.get("variable_state").is_none());
    }

    #[test]
    fn test_format_trace_failure_includes_context() {
        let mut result = ExecutionResult::failure(
            ErrorKind::runtime("IndexError"),
            "IndexError: list index out of range",
        );
        result.variables.insert(
            "x".to_string(),
            crate::types::SerializedValue::scalar("list", "[1, 2, 3]"),
        );
        let trace = TraceResult {
            result,
            stack_frames: Vec::new(),
            error_line: Some(2),
            execution_context: vec!["line 2: print(x[10])".to_string()],
        };
        let formatted = format_trace_for_planner(&trace);
        assert_eq!(formatted["success"], false);
        assert_eq!(formatted["error_line"], 2);
        assert_eq!(formatted["variable_state"]["x"]["preview"], "[1, 2, 3]");
        assert_eq!(formatted["execution_context"][0], "line 2: print(x[10])");
    }
}
