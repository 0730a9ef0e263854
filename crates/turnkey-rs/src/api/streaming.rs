//! Server-Sent Events (SSE) parsing for streamed chat completions.
//!
//! [`SseDecoder`] turns raw body chunks into [`StreamEvent`]s as they arrive;
//! the `collect_*` helpers fold a finished event list back into a
//! [`ModelResponse`](super::ModelResponse).

use crate::{CallType, FunctionCallData, ToolCall, UsageInfo};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// A single event from an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// An incremental reasoning/thinking delta.
    ReasoningDelta(String),
    /// A tool call chunk (accumulated until complete).
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The provider's finish reason for the choice.
    Finish(String),
    /// The stream is complete.
    Done,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental line decoder for an SSE body.
///
/// Feed raw body bytes with [`push`](Self::push); each call returns the events
/// completed by that chunk. Bytes are held until a full line arrives, so a
/// UTF-8 sequence split across network chunks is decoded intact. Call
/// [`finish`](Self::finish) at end of body to flush a trailing unterminated
/// line and guarantee a final [`StreamEvent::Done`].
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Append a body chunk and return the events it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if self.handle_line(line.trim(), &mut events) {
                break;
            }
        }
        events
    }

    /// Flush any trailing data and close the stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.done {
            let remaining = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&remaining);
            self.handle_line(line.trim(), &mut events);
        }
        if !self.done {
            self.done = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    /// Returns `true` once the terminal `[DONE]` marker is handled.
    fn handle_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> bool {
        if line.is_empty() || line.starts_with(':') {
            return false;
        }
        if line == "data: [DONE]" {
            self.done = true;
            self.buffer.clear();
            events.push(StreamEvent::Done);
            return true;
        }
        if let Some(data) = line.strip_prefix("data:") {
            parse_sse_data(data.trim_start(), events);
        }
        false
    }
}

/// Parse a single SSE `data:` payload into stream events.
pub fn parse_sse_data(data: &str, events: &mut Vec<StreamEvent>) {
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e} (data: {data})");
            return;
        }
    };

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(usage));
    }

    for choice in chunk.choices.unwrap_or_default() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                events.push(StreamEvent::TextDelta(content));
            }
            if let Some(reasoning) = delta.reasoning
                && !reasoning.is_empty()
            {
                events.push(StreamEvent::ReasoningDelta(reasoning));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                events.push(StreamEvent::ToolCallDelta {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name,
                    arguments_delta: arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            trace!("Stream finish_reason: {reason}");
            events.push(StreamEvent::Finish(reason));
        }
    }
}

/// Assemble a complete text string from a sequence of stream events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

/// Assemble complete reasoning from a sequence of stream events.
pub fn collect_reasoning(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ReasoningDelta(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

/// The last usage report in the stream, if any.
pub fn extract_usage(events: &[StreamEvent]) -> Option<UsageInfo> {
    events.iter().rev().find_map(|e| match e {
        StreamEvent::Usage(usage) => Some(usage.clone()),
        _ => None,
    })
}

/// The last finish reason in the stream, if any.
pub fn extract_finish_reason(events: &[StreamEvent]) -> Option<String> {
    events.iter().rev().find_map(|e| match e {
        StreamEvent::Finish(reason) => Some(reason.clone()),
        _ => None,
    })
}

/// Assemble complete tool calls from streamed [`StreamEvent::ToolCallDelta`]s.
///
/// The first delta for an index carries the id and name; later deltas carry
/// argument fragments. Calls that never received an id or name are dropped.
pub fn assemble_tool_calls(events: &[StreamEvent]) -> Vec<ToolCall> {
    let mut calls: BTreeMap<usize, (Option<String>, Option<String>, String)> = BTreeMap::new();

    for event in events {
        if let StreamEvent::ToolCallDelta {
            index,
            id,
            name,
            arguments_delta,
        } = event
        {
            let entry = calls.entry(*index).or_insert((None, None, String::new()));
            if let Some(id) = id {
                entry.0 = Some(id.clone());
            }
            if let Some(name) = name {
                entry.1 = Some(name.clone());
            }
            entry.2.push_str(arguments_delta);
        }
    }

    calls
        .into_values()
        .filter_map(|(id, name, arguments)| {
            Some(ToolCall {
                id: id?,
                call_type: CallType::Function,
                function: FunctionCallData {
                    name: name?,
                    arguments,
                },
            })
        })
        .collect()
}
