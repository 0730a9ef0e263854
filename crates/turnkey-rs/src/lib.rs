//! ReAct turn scheduler for tool-using LLM agents.
//!
//! `turnkey-rs` is the execution core of a coding agent. A caller owns one
//! [`Session`](agent::session::Session) per conversation and calls
//! [`run_turn()`](agent::session::Session::run_turn) for each user request.
//! The scheduler repeatedly calls the model, classifies its output, dispatches
//! structured tool calls, compacts history when the context window fills up,
//! and narrates everything as typed [`HistoryEvent`](agent::events::HistoryEvent)s.
//!
//! Every turn converges on exactly one [`TurnStatus`](agent::turn::TurnStatus):
//! `ok`, `error`, `cancelled`, or `prompt_limit`.
//!
//! # Getting started
//!
//! ```ignore
//! use turnkey_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> turnkey_rs::Result<()> {
//!     let api_key = std::env::var("OPENROUTER_KEY").unwrap();
//!     let client = OpenRouterClient::new(api_key, DEFAULT_MODEL)?;
//!
//!     let echo = FnTool::new(
//!         ToolDef::new("echo", "Echo the input", serde_json::json!({
//!             "type": "object",
//!             "properties": {"text": {"type": "string"}},
//!             "required": ["text"]
//!         })),
//!         |args: serde_json::Value| async move { args["text"].as_str().unwrap_or("").to_string() },
//!     );
//!     let tools = ToolSet::new().with(echo);
//!     let config = SessionConfig::new(DEFAULT_MODEL, "You are a coding assistant.");
//!
//!     let mut session = Session::new(
//!         config,
//!         Box::new(client),
//!         Box::new(tools),
//!         Box::new(CharEstimateCounter::new(DEFAULT_MODEL)),
//!     )
//!     .with_sink(Box::new(LoggingSink));
//!
//!     let result = session.run_turn("list files").await?;
//!     println!("{} {}", result.status, result.final_text);
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Drive a conversation:** [`Session`](agent::session::Session) and
//!   [`SessionConfig`](agent::config::SessionConfig). The step loop itself lives
//!   in [`agent::turn`].
//!
//! - **Plug in a model:** implement [`ModelClient`](api::ModelClient), or use
//!   [`OpenRouterClient`](api::openrouter::OpenRouterClient) with SSE streaming
//!   and [`RetryConfig`](api::retry::RetryConfig) backoff.
//!
//! - **Plug in tools:** implement [`Tool`](tools::core::Tool) and register it in a
//!   [`ToolSet`](tools::core::ToolSet), or implement
//!   [`ToolOrchestrator`](tools::orchestrator::ToolOrchestrator) for a custom engine.
//!   Permission modes and approval grants are in [`tools::orchestrator`].
//!
//! - **Observe a session:** register a [`HistorySink`](agent::events::HistorySink)
//!   ([`JsonlSink`](agent::events::JsonlSink), [`MemorySink`](agent::events::MemorySink),
//!   [`LoggingSink`](agent::events::LoggingSink)) and/or implement
//!   [`LifecycleHooks`](agent::hooks::LifecycleHooks).
//!
//! - **Manage context:** [`TokenCounter`](context::tokens::TokenCounter),
//!   [`TokenAccountant`](context::tokens::TokenAccountant) and the
//!   [`compactor`](context::compactor).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Session, turn loop, dispatch, repetition guard, events, hooks, config |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, [`ToolSet`](tools::core::ToolSet) engine, permissions |
//! | [`context`] | Token counting and accounting, history compaction |
//! | [`api`] | Model client contract, OpenRouter adapter, SSE streaming, retry |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Default model for sessions created without an explicit model.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`, for use as [`ToolDef`] parameters.
///
/// # Example
///
/// ```
/// use turnkey_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ListDirArgs {
///     path: String,
/// }
///
/// let schema = json_schema_for::<ListDirArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// An assistant message carrying both narration text and structured calls.
    ///
    /// Empty text is dropped so the message serializes like
    /// [`assistant_tool_calls`](Self::assistant_tool_calls).
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        Self {
            role: MessageRole::Assistant,
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// The message text, or `""` when it has none.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A structured tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    /// Build a function call with raw JSON `arguments`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

/// Token usage statistics as reported by a model provider.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content.as_deref(), Some("hello"));

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn assistant_with_calls_drops_empty_parts() {
        let msg = Message::assistant_with_calls("", vec![ToolCall::new("c1", "ls", "{}")]);
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.as_ref().map(Vec::len), Some(1));

        let msg = Message::assistant_with_calls("done", vec![]);
        assert_eq!(msg.text(), "done");
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn message_serializes_without_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn tool_call_wire_format() {
        let call = ToolCall::new("c1", "list_dir", r#"{"path":"."}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "list_dir");
    }
}
