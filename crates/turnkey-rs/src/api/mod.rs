//! Model call layer: the [`ModelClient`] contract the scheduler depends on,
//! plus a concrete OpenRouter implementation.
//!
//! - [`openrouter`]: [`OpenRouterClient`](openrouter::OpenRouterClient), an SSE
//!   streaming client for the OpenRouter chat completions API.
//! - [`streaming`]: SSE parser producing [`StreamEvent`](streaming::StreamEvent)s
//!   and helpers to assemble text and tool calls from them.
//! - [`retry`]: exponential backoff for transient failures. Never retries
//!   4xx errors or cancellation.

pub mod openrouter;
pub mod retry;
pub mod streaming;

use crate::{Message, ToolCall, ToolDef, UsageInfo};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub use openrouter::OpenRouterClient;
pub use retry::RetryConfig;

/// Boxed future returned by [`ModelClient::call`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>>;

/// Callback receiving incremental assistant text while a call streams.
pub type PartialTextFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Failure of a model call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The call was aborted through its cancellation token.
    #[error("model call cancelled")]
    Cancelled,
    /// The provider answered with a non-success HTTP status.
    #[error("model API HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Connection, timeout or stream read failure.
    #[error("model request failed: {0}")]
    Transport(String),
    /// The provider answered with something we could not interpret.
    #[error("model response invalid: {0}")]
    Decode(String),
}

impl ModelError {
    /// Whether a retry might succeed (rate limits, server errors, network).
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            ModelError::Transport(_) => true,
            ModelError::Cancelled | ModelError::Decode(_) => false,
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The model finished its answer.
    EndTurn,
    /// The model stopped to have tools executed.
    ToolUse,
    /// The output token limit was hit.
    MaxTokens,
    /// A provider-specific reason.
    Other(String),
    /// No reason was reported.
    #[default]
    None,
}

impl StopReason {
    /// Map a provider `finish_reason` / `stop_reason` string.
    pub fn from_finish_reason(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "tool_calls" | "tool_use" | "function_call" => StopReason::ToolUse,
            "length" | "max_tokens" => StopReason::MaxTokens,
            "" => StopReason::None,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn is_end_turn(&self) -> bool {
        matches!(self, StopReason::EndTurn)
    }
}

/// A model call request: the full history plus the tools the model may call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDef],
    /// Output token cap. `0` leaves it to the provider.
    pub max_tokens: u32,
}

/// Normalized result of one model call.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// Assistant text content (may be empty).
    pub text: String,
    /// Structured tool calls, in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    /// Provider-reported usage, when available.
    pub usage: Option<UsageInfo>,
    /// Reasoning / extended thinking content.
    pub reasoning: Option<String>,
}

/// The language-model transport the scheduler drives.
///
/// Implementations must stop promptly and return [`ModelError::Cancelled`]
/// once `cancel` fires, and may call `on_partial` any number of times with
/// text deltas before resolving.
pub trait ModelClient: Send + Sync {
    fn call<'a>(
        &'a self,
        request: ModelRequest<'a>,
        on_partial: PartialTextFn<'a>,
        cancel: &'a CancellationToken,
    ) -> ModelFuture<'a>;

    /// Model label used for logging and the `session_start` event.
    fn model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(StopReason::from_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::from_finish_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(
            StopReason::from_finish_reason("tool_calls"),
            StopReason::ToolUse
        );
        assert_eq!(
            StopReason::from_finish_reason("length"),
            StopReason::MaxTokens
        );
        assert_eq!(
            StopReason::from_finish_reason("content_filter"),
            StopReason::Other("content_filter".into())
        );
    }

    #[test]
    fn transient_classification() {
        assert!(
            ModelError::Http {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            ModelError::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ModelError::Http {
                status: 401,
                body: String::new()
            }
            .is_transient()
        );
        assert!(ModelError::Transport("connection reset".into()).is_transient());
        assert!(!ModelError::Cancelled.is_transient());
    }
}
