//! The LLM planner client.
//!
//! The orchestrator treats the planner as a black-box reasoning engine: it
//! sends a conversation, gets back either tool calls or a final text, and
//! never sees transport details. [`Planner`] is the seam; [`HttpPlanner`]
//! speaks an OpenAI-compatible chat-completions dialect over a blocking HTTP
//! client, and [`ScriptedPlanner`] replays canned turns for tests and offline
//! runs.
//!
//! Planner failures are never fatal to a fix call — the orchestrator reports
//! them into the conversation or falls through to the fallback strategy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::EngineError;

/// System instruction given to the planner at the start of every fix
/// conversation.
pub const SYSTEM_INSTRUCTION: &str = "\
You are a rigorous Python debugging agent. You repair broken Python code \
step by step:
1. Start by calling validate_syntax on the user's code.
2. If the syntax is invalid, propose a corrected version; never execute code \
with syntax errors.
3. Use execute_code to verify behaviour and to test every fix you propose.
4. When execute_code fails with a runtime error, call search_memory with the \
exact error type to find proven fixes for similar code.
5. Once a fix is verified, reply with the complete corrected code in a fenced \
code block, followed by a short explanation of why the original failed.
Only provide code and explanations; no small talk.";

/// A single message in the planner conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls attached to an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// Which call a tool-result message answers.
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn wire_name(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// One tool invocation requested by the planner.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// What the planner produced for one turn: zero or more tool calls and/or a
/// final text.
#[derive(Debug, Clone, Default)]
pub struct PlannerTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl PlannerTurn {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }
}

/// A black-box reasoning engine driving the fix loop.
pub trait Planner: Send + Sync {
    /// Stable identity string (model name); keyed into the fix cache
    /// sentinel so a model change invalidates cached fixes.
    fn identity(&self) -> &str;

    fn next_turn(&self, conversation: &[ChatMessage]) -> Result<PlannerTurn, EngineError>;
}

/// Extract the candidate fix from a planner's final text: the *last* fenced
/// code block, or `None` when the text has no fence.
pub fn extract_code_block(text: &str) -> Option<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        // Skip the info string ("python", "py", …) up to the first newline.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(end) => {
                blocks.push(body[..end].trim().to_string());
                rest = &body[end + 3..];
            }
            None => break,
        }
    }
    blocks.into_iter().filter(|b| !b.is_empty()).next_back()
}

// ── HTTP implementation ──────────────────────────────────────────────────────

/// Planner over an OpenAI-compatible `chat/completions` endpoint.
pub struct HttpPlanner {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    tools: Vec<Value>,
}

impl HttpPlanner {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        tools: Vec<Value>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::PlannerUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
            tools,
        })
    }

    fn wire_messages(conversation: &[ChatMessage]) -> Vec<Value> {
        conversation
            .iter()
            .map(|message| {
                let mut wire = json!({
                    "role": message.role.wire_name(),
                    "content": message.content,
                });
                if !message.tool_calls.is_empty() {
                    wire["tool_calls"] = Value::Array(
                        message
                            .tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    },
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(call_id) = &message.tool_call_id {
                    wire["tool_call_id"] = Value::String(call_id.clone());
                }
                wire
            })
            .collect()
    }

    fn parse_response(body: Value) -> Result<PlannerTurn, EngineError> {
        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| EngineError::PlannerMalformed("response has no message".into()))?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|t| !t.trim().is_empty());

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EngineError::PlannerMalformed("tool call missing function name".into())
                    })?
                    .to_string();
                let raw_args = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw_args)
                    .unwrap_or_else(|_| Value::String(raw_args.to_string()));
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments,
                });
            }
        }

        Ok(PlannerTurn { text, tool_calls })
    }
}

impl Planner for HttpPlanner {
    fn identity(&self) -> &str {
        &self.model
    }

    fn next_turn(&self, conversation: &[ChatMessage]) -> Result<PlannerTurn, EngineError> {
        let request = json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": Self::wire_messages(conversation),
            "tools": self.tools,
        });

        debug!(model = %self.model, messages = conversation.len(), "planner request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| EngineError::PlannerTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "planner returned an error status");
            return Err(EngineError::PlannerTransport(format!(
                "planner endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .map_err(|e| EngineError::PlannerMalformed(e.to_string()))?;
        Self::parse_response(body)
    }
}

// ── Scripted implementation ──────────────────────────────────────────────────

/// Replays a fixed sequence of turns; for tests and offline operation.
pub struct ScriptedPlanner {
    identity: String,
    turns: Mutex<VecDeque<PlannerTurn>>,
}

impl ScriptedPlanner {
    pub fn new(identity: impl Into<String>, turns: Vec<PlannerTurn>) -> Self {
        Self {
            identity: identity.into(),
            turns: Mutex::new(turns.into()),
        }
    }
}

impl Planner for ScriptedPlanner {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn next_turn(&self, _conversation: &[ChatMessage]) -> Result<PlannerTurn, EngineError> {
        self.turns
            .lock()
            .expect("scripted planner mutex poisoned")
            .pop_front()
            .ok_or_else(|| EngineError::PlannerUnavailable("script exhausted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── code block extraction ────────────────────────────────────────────────

    #[test]
    fn test_extract_simple_block() {
        let text = "Here is the fix:\n```python\nx = 1\nprint(x)\n```\nDone.";
        assert_eq!(extract_code_block(text), Some("x = 1\nprint(x)".to_string()));
    }

    #[test]
    fn test_extract_block_without_language_tag() {
        let text = "```\ny = 2\n```";
        assert_eq!(extract_code_block(text), Some("y = 2".to_string()));
    }

    #[test]
    fn test_extract_takes_last_block() {
        let text = "First try:\n```python\nbad()\n```\nBetter:\n```python\ngood()\n```";
        assert_eq!(extract_code_block(text), Some("good()".to_string()));
    }

    #[test]
    fn test_extract_none_without_fences() {
        assert_eq!(extract_code_block("no code here"), None);
    }

    #[test]
    fn test_extract_ignores_empty_block() {
        assert_eq!(extract_code_block("```python\n```"), None);
    }

    // ── wire shaping ─────────────────────────────────────────────────────────

    #[test]
    fn test_wire_messages_include_tool_plumbing() {
        let conversation = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("fix this"),
            ChatMessage::assistant(
                "",
                vec![ToolCall {
                    id: "call-1".into(),
                    name: "validate_syntax".into(),
                    arguments: json!({"code": "x = 1"}),
                }],
            ),
            ChatMessage::tool_result("call-1", r#"{"valid":true}"#),
        ];
        let wire = HttpPlanner::wire_messages(&conversation);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "validate_syntax");
        // Arguments are JSON-encoded as a string on the wire.
        assert!(wire[2]["tool_calls"][0]["function"]["arguments"].is_string());
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call-1");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-9",
                        "type": "function",
                        "function": {
                            "name": "execute_code",
                            "arguments": "{\"code\": \"print(1)\", \"timeout\": 5}"
                        }
                    }]
                }
            }]
        });
        let turn = HttpPlanner::parse_response(body).expect("parses");
        assert!(turn.text.is_none());
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "execute_code");
        assert_eq!(turn.tool_calls[0].arguments["timeout"], 5);
    }

    #[test]
    fn test_parse_response_with_final_text() {
        let body = json!({
            "choices": [{
                "message": { "content": "```python\nx = 1\n```" }
            }]
        });
        let turn = HttpPlanner::parse_response(body).expect("parses");
        assert_eq!(turn.text.as_deref(), Some("```python\nx = 1\n```"));
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_response_missing_message_is_malformed() {
        let err = HttpPlanner::parse_response(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, EngineError::PlannerMalformed(_)));
    }

    // ── scripted planner ─────────────────────────────────────────────────────

    #[test]
    fn test_scripted_planner_replays_then_errors() {
        let planner = ScriptedPlanner::new(
            "scripted-1",
            vec![PlannerTurn::final_text("```python\nx = 1\n```")],
        );
        assert_eq!(planner.identity(), "scripted-1");

        let turn = planner.next_turn(&[]).expect("first turn scripted");
        assert!(turn.text.is_some());

        let err = planner.next_turn(&[]).unwrap_err();
        assert!(matches!(err, EngineError::PlannerUnavailable(_)));
    }
}
