//! [`ModelClient`] implementation for the OpenRouter chat completions API.
//!
//! Requests are always streamed so partial text reaches the caller as it is
//! generated and so a cancelled turn drops the connection mid-response.

use super::retry::{RetryConfig, retry_model_call};
use super::streaming::{
    SseDecoder, StreamEvent, assemble_tool_calls, collect_reasoning, collect_text,
    extract_finish_reason, extract_usage,
};
use super::{
    ModelClient, ModelError, ModelFuture, ModelRequest, ModelResponse, PartialTextFn, StopReason,
};
use crate::{Message, ToolDef};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Streaming chat completion request body.
#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
    #[serde(skip_serializing_if = "is_zero")]
    max_tokens: u32,
    stream: bool,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    referer: String,
    title: String,
    url: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("model", &self.model)
            .field("url", &self.url)
            .finish()
    }
}

impl OpenRouterClient {
    /// Create a client for `model` with default headers and no retries.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .user_agent("turnkey-rs/0.1")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ModelError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            referer: "https://github.com/turnkey-rs/turnkey-rs".into(),
            title: "turnkey-rs".into(),
            url: OPENROUTER_URL.into(),
            retry: RetryConfig::default(),
        })
    }

    /// Override the `HTTP-Referer` and `X-Title` headers.
    pub fn with_headers(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.referer = referer.into();
        self.title = title.into();
        self
    }

    /// Point the client at a different OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// One streamed request, without retries.
    async fn stream_once(
        &self,
        request: ModelRequest<'_>,
        on_partial: PartialTextFn<'_>,
    ) -> Result<ModelResponse, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages: request.messages,
            tools: request.tools,
            max_tokens: request.max_tokens,
            stream: true,
        };
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}",
            self.model,
            request.messages.len(),
            request.tools.len(),
            request.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let mut resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| ModelError::Transport(format!("failed to read streaming chunk: {e}")))?
        {
            let fresh = decoder.push(&chunk);
            forward_text(&fresh, on_partial);
            events.extend(fresh);
            if decoder.is_done() {
                break;
            }
        }
        let tail = decoder.finish();
        forward_text(&tail, on_partial);
        events.extend(tail);

        let response = ModelResponse {
            text: collect_text(&events),
            tool_calls: assemble_tool_calls(&events),
            stop_reason: extract_finish_reason(&events)
                .map(|r| StopReason::from_finish_reason(&r))
                .unwrap_or_default(),
            usage: extract_usage(&events),
            reasoning: Some(collect_reasoning(&events)).filter(|r| !r.is_empty()),
        };

        debug!(
            "LLM response in {:.1}s: {} chars text, {} tool call(s), stop={:?}",
            start.elapsed().as_secs_f64(),
            response.text.len(),
            response.tool_calls.len(),
            response.stop_reason,
        );
        if let Some(ref usage) = response.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }
        Ok(response)
    }
}

fn forward_text(events: &[StreamEvent], on_partial: PartialTextFn<'_>) {
    for event in events {
        if let StreamEvent::TextDelta(delta) = event {
            on_partial(delta);
        }
    }
}

impl ModelClient for OpenRouterClient {
    fn call<'a>(
        &'a self,
        request: ModelRequest<'a>,
        on_partial: PartialTextFn<'a>,
        cancel: &'a CancellationToken,
    ) -> ModelFuture<'a> {
        Box::pin(async move {
            let attempt = retry_model_call(&self.retry, cancel, || {
                self.stream_once(request, on_partial)
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("LLM request aborted by cancellation");
                    Err(ModelError::Cancelled)
                }
                result = attempt => result,
            }
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_empty_tools() {
        let messages = vec![Message::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            tools: &[],
            max_tokens: 0,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["stream"], true);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = OpenRouterClient::new("key", "m")
            .unwrap()
            .with_url("http://127.0.0.1:9/unreachable");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let messages = vec![Message::user("hi")];
        let request = ModelRequest {
            messages: &messages,
            tools: &[],
            max_tokens: 0,
        };
        let result = client.call(request, &|_: &str| {}, &cancel).await;
        assert_eq!(result.unwrap_err(), ModelError::Cancelled);
    }
}
