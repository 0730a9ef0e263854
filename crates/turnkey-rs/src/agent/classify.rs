//! Interpreting one model response.
//!
//! Each step's response is exactly one [`Interpretation`]: structured tool
//! calls, a final answer, a plain-text tool call (a protocol violation, never
//! executed), or nothing at all.

use crate::api::ModelResponse;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static TOOL_CALL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<tool_call>\s*(.*?)\s*(?:</tool_call>|$)").expect("valid regex")
});

static NAME_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:name|tool)"\s*:\s*"([^"]+)""#).expect("valid regex")
});

/// An object that opens with a tool-name key, even if the rest is not valid JSON.
static LEADING_TOOL_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\{\s*"(?:tool|name|function)"\s*:\s*"([^"]+)""#).expect("valid regex")
});

const NAME_KEYS: [&str; 3] = ["tool", "name", "function"];
const ARG_KEYS: [&str; 3] = ["input", "arguments", "parameters"];

/// Placeholder when a plain-text tool call names no tool.
pub const UNKNOWN_TOOL: &str = "unknown";

/// What a model response asks the scheduler to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// One or more structured tool calls (possibly alongside text).
    ToolCalls,
    /// Non-empty free text with no tool calls.
    Final,
    /// Free text that encodes a tool call instead of using the tool channel.
    ProtocolViolation { tool: String },
    Empty,
}

pub fn classify(response: &ModelResponse) -> Interpretation {
    if !response.tool_calls.is_empty() {
        return Interpretation::ToolCalls;
    }
    if let Some(tool) = detect_plain_text_tool_call(&response.text) {
        return Interpretation::ProtocolViolation { tool };
    }
    if response.text.trim().is_empty() {
        Interpretation::Empty
    } else {
        Interpretation::Final
    }
}

/// If `text` is a tool call written as plain text, the tool it names
/// (or [`UNKNOWN_TOOL`]).
pub fn detect_plain_text_tool_call(text: &str) -> Option<String> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            if let Some(tool) = tool_in_value(&value) {
                return Some(tool);
            }
        }
        Err(_) => {
            if let Some(tool) = LEADING_TOOL_OBJECT
                .captures(body)
                .and_then(|caps| caps.get(1))
            {
                return Some(tool.as_str().to_string());
            }
        }
    }

    if let Some(caps) = TOOL_CALL_TAG.captures(body) {
        let inner = caps.get(1).map_or("", |m| m.as_str());
        let tool = serde_json::from_str::<Value>(inner)
            .ok()
            .and_then(|v| tool_in_value(&v))
            .or_else(|| name_field(inner));
        return Some(tool.unwrap_or_else(|| UNKNOWN_TOOL.to_string()));
    }

    if body.contains("\"tool_calls\"") {
        return Some(name_field(body).unwrap_or_else(|| UNKNOWN_TOOL.to_string()));
    }

    None
}

/// The violation text recorded as the assistant message.
pub fn protocol_violation_message(count: u32, tool: &str) -> String {
    format!(
        "Protocol violation #{count}: the model emitted a tool call for '{tool}' as plain text \
         instead of a structured tool call. Plain-text tool calls are never executed."
    )
}

/// Drop a surrounding Markdown code fence (with or without a language tag).
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(newline) => rest.get(newline + 1..).unwrap_or_default(),
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn tool_in_value(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.iter().find_map(tool_in_value),
        Value::Object(map) => {
            if let Some(calls) = map.get("tool_calls") {
                return Some(tool_in_value(calls).unwrap_or_else(|| UNKNOWN_TOOL.to_string()));
            }
            let has_args = ARG_KEYS.iter().any(|k| map.contains_key(*k));
            let name = NAME_KEYS.iter().find_map(|k| match map.get(*k)? {
                Value::String(name) => Some(name.clone()),
                // OpenAI shape: {"function": {"name": ..., "arguments": ...}}
                nested @ Value::Object(_) => tool_in_value(nested),
                _ => None,
            });
            match name {
                Some(name) if has_args || map.get("function").is_some_and(Value::is_object) => {
                    Some(name)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn name_field(text: &str) -> Option<String> {
    NAME_FIELD
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    fn text_response(text: &str) -> ModelResponse {
        ModelResponse {
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn structured_calls_win() {
        let response = ModelResponse {
            text: r#"{"tool":"x","input":{}}"#.into(),
            tool_calls: vec![ToolCall::new("c1", "list_dir", "{}")],
            ..Default::default()
        };
        assert_eq!(classify(&response), Interpretation::ToolCalls);
    }

    #[test]
    fn plain_answers_and_empty() {
        assert_eq!(classify(&text_response("Found 2 files.")), Interpretation::Final);
        assert_eq!(classify(&text_response("  \n")), Interpretation::Empty);
        assert_eq!(
            classify(&text_response(r#"The config is {"debug": true}."#)),
            Interpretation::Final
        );
    }

    #[test]
    fn json_tool_call_as_text() {
        assert_eq!(
            classify(&text_response(r#"{"tool":"x","input":{"path":"."}}"#)),
            Interpretation::ProtocolViolation { tool: "x".into() }
        );
        assert_eq!(
            detect_plain_text_tool_call("```json\n{\"name\": \"grep\", \"arguments\": {}}\n```"),
            Some("grep".into())
        );
        assert_eq!(
            detect_plain_text_tool_call(
                r#"[{"function": {"name": "read_file", "arguments": "{}"}}]"#
            ),
            Some("read_file".into())
        );
    }

    #[test]
    fn truncated_json_still_counts() {
        assert_eq!(
            detect_plain_text_tool_call(r#"{"tool":"x",...}"#),
            Some("x".into())
        );
    }

    #[test]
    fn tags_and_tool_calls_key() {
        assert_eq!(
            detect_plain_text_tool_call("Let me look.\n<tool_call>{\"name\": \"ls\", \"arguments\": {}}</tool_call>"),
            Some("ls".into())
        );
        assert_eq!(
            detect_plain_text_tool_call("<tool_call>garbage"),
            Some(UNKNOWN_TOOL.into())
        );
        assert_eq!(
            detect_plain_text_tool_call(r#"{"tool_calls": [{"id": "1", "function": {"name": "shell", "arguments": "{}"}}]}"#),
            Some("shell".into())
        );
    }

    #[test]
    fn objects_without_arguments_are_not_calls() {
        assert_eq!(detect_plain_text_tool_call(r#"{"name": "Alice", "age": 3}"#), None);
    }

    #[test]
    fn violation_message_names_the_tool() {
        let message = protocol_violation_message(2, "x");
        assert!(message.starts_with("Protocol violation #2:"));
        assert!(message.contains("'x'"));
    }
}
