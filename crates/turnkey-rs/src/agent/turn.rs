//! The turn scheduler: the ReAct step loop behind [`Session::run_turn`].
//!
//! Each step measures the prompt, auto-compacts at most once per turn,
//! enforces the context window, calls the model, classifies the response,
//! and either dispatches tool calls (and loops) or finishes. Every exit path
//! converges on one [`TurnStatus`], a `final` event, and a `turn_end` event.

use crate::agent::classify::{Interpretation, classify, protocol_violation_message};
use crate::agent::dispatch::{Dispatcher, skipped_results};
use crate::agent::events::ContextPhase;
use crate::agent::session::{CancelHandle, Session};
use crate::api::{ModelError, ModelRequest, ModelResponse};
use crate::context::compactor::{CompactReason, CompactResult};
use crate::context::tokens::TokenUsage;
use crate::error::{Error, Result};
use crate::tools::orchestrator::ToolOrchestrator;
use crate::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Final text when the user or policy rejects a tool call.
pub const REJECTION_MESSAGE: &str = "Tool execution was rejected by the user.";

/// Final text when the loop ends without an answer.
pub const NO_ANSWER_MESSAGE: &str = "The agent was unable to produce a final answer.";

// ── Turn types ─────────────────────────────────────────────────────

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    Error,
    Cancelled,
    /// The prompt exceeded the context window.
    PromptLimit,
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnStatus::Ok => write!(f, "ok"),
            TurnStatus::Error => write!(f, "error"),
            TurnStatus::Cancelled => write!(f, "cancelled"),
            TurnStatus::PromptLimit => write!(f, "prompt_limit"),
        }
    }
}

/// One model invocation within a turn.
#[derive(Debug, Clone)]
pub struct Step {
    /// 0-based within the turn.
    pub index: u32,
    /// Assistant text as returned by the model.
    pub text: String,
    pub interpretation: Interpretation,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// Combined tool observations, once dispatched.
    pub observation: Option<String>,
}

/// Outcome of [`Session::run_turn`].
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// 1-based turn index.
    pub turn: u32,
    pub status: TurnStatus,
    pub final_text: String,
    pub error: Option<String>,
    pub steps: Vec<Step>,
    pub usage: TokenUsage,
    pub duration: Duration,
    /// Protocol violations so far in the session.
    pub violation_count: u32,
    pub compactions: Vec<CompactResult>,
}

/// Derive a session title from the first input: first non-empty line,
/// whitespace collapsed, at most `max_chars` characters.
pub fn derive_title(input: &str, max_chars: usize) -> Option<String> {
    let line = input.lines().map(str::trim).find(|l| !l.is_empty())?;
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    let max_chars = max_chars.max(1);
    if collapsed.chars().count() <= max_chars {
        return Some(collapsed);
    }
    let mut title: String = collapsed.chars().take(max_chars - 1).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    Some(title)
}

/// Clears per-turn state on every exit path, including a dropped future.
struct TurnCleanup {
    tools: Arc<dyn ToolOrchestrator>,
    cancel: CancelHandle,
}

impl Drop for TurnCleanup {
    fn drop(&mut self) {
        self.cancel.clear();
        self.tools.clear_once_approvals();
    }
}

/// Terminal state accumulated while the loop runs.
struct Outcome {
    status: TurnStatus,
    final_text: Option<String>,
    error: Option<String>,
}

impl Outcome {
    fn finish(status: TurnStatus, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            status,
            error: (status != TurnStatus::Ok && !text.is_empty()).then(|| text.clone()),
            final_text: Some(text),
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

impl Session {
    /// Run one user turn to completion.
    ///
    /// Every failure inside the turn is reported through
    /// [`TurnResult::status`]; `Err` means the session was already closed.
    pub async fn run_turn(&mut self, input: &str) -> Result<TurnResult> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        if !self.started {
            self.started = true;
            self.emitter.session_start(self.model.model(), self.config.mode);
        }
        let cancel = self.cancel.begin();
        let _cleanup = TurnCleanup {
            tools: Arc::clone(&self.tools),
            cancel: self.cancel.clone(),
        };

        self.turn_count += 1;
        let turn = self.turn_count;
        self.emitter.open_turn(turn);
        let result = self.drive_turn(turn, input, &cancel).await;
        self.emitter.turn_end(&result);
        self.emitter.close_turn();
        self.emitter.flush();
        Ok(result)
    }

    async fn drive_turn(&mut self, turn: u32, input: &str, cancel: &CancellationToken) -> TurnResult {
        let started = Instant::now();
        let window = self.config.context_window;
        let threshold = self.auto_compact_threshold();
        self.accountant.begin_turn();

        self.history.push(Message::user(input));
        self.emitter.turn_start(turn, input);
        let tokens = self.accountant.prompt_tokens(&self.history);
        self.emitter
            .context_usage(ContextPhase::TurnStart, tokens, window, threshold);

        if turn == 1
            && let Some(title) = derive_title(input, self.config.title_max_chars)
        {
            self.emitter.session_title(&title);
            self.title = Some(title);
        }

        let mut steps: Vec<Step> = Vec::new();
        let mut compactions: Vec<CompactResult> = Vec::new();
        let mut compacted = false;
        let mut previous_text = String::new();
        let mut outcome: Option<Outcome> = None;

        for index in 0u32.. {
            self.emitter.open_step(index);

            let mut prompt_tokens = self.accountant.prompt_tokens(&self.history);
            self.emitter
                .context_usage(ContextPhase::StepStart, prompt_tokens, window, threshold);

            if let Some(threshold) = threshold
                && !compacted
                && prompt_tokens >= threshold
            {
                compacted = true;
                info!("Prompt at {prompt_tokens} tokens (threshold {threshold}), compacting");
                compactions.push(self.compact_with(CompactReason::Auto, cancel).await);
                prompt_tokens = self.accountant.prompt_tokens(&self.history);
                self.emitter.context_usage(
                    ContextPhase::PostCompact,
                    prompt_tokens,
                    window,
                    Some(threshold),
                );
            }

            if prompt_tokens > window {
                let text = format!(
                    "Context limit exceeded: {prompt_tokens} prompt tokens exceed the \
                     {window}-token context window."
                );
                warn!("{text}");
                self.history.push(Message::assistant_text(&text));
                self.guard.reset();
                outcome = Some(Outcome::finish(TurnStatus::PromptLimit, text));
                break;
            }

            let response = match self.call_model(cancel).await {
                Ok(response) => response,
                Err(e) if self.cancel.is_cancelling() || cancel.is_cancelled() => {
                    info!("Turn {turn} cancelled during model call ({e})");
                    self.guard.reset();
                    outcome = Some(Outcome {
                        status: TurnStatus::Cancelled,
                        final_text: Some(String::new()),
                        error: None,
                    });
                    break;
                }
                Err(e) => {
                    warn!("Model call failed: {e}");
                    let text = format!("Model call failed: {e}");
                    self.history.push(Message::assistant_text(&text));
                    self.guard.reset();
                    outcome = Some(Outcome::finish(TurnStatus::Error, text));
                    break;
                }
            };

            let interpretation = classify(&response);
            let violation = matches!(interpretation, Interpretation::ProtocolViolation { .. });
            let is_final = interpretation == Interpretation::Final;
            if violation {
                self.violation_count += 1;
            }

            let usage = self.accountant.record_step(
                response.usage.as_ref(),
                &self.history,
                &response.text,
            );
            trace!("Step {index} usage: {usage}");
            steps.push(Step {
                index,
                text: response.text.clone(),
                interpretation: interpretation.clone(),
                tool_calls: response.tool_calls.clone(),
                usage,
                observation: None,
            });
            self.emitter.assistant(
                &response.text,
                !response.tool_calls.is_empty(),
                violation,
                self.violation_count,
            );

            match interpretation {
                Interpretation::ProtocolViolation { tool } => {
                    // Nothing was dispatched, so any streak of identical calls is over.
                    self.guard.reset();
                    let text = protocol_violation_message(self.violation_count, &tool);
                    warn!("{text}");
                    self.history.push(Message::assistant_text(&text));
                    outcome = Some(Outcome::finish(TurnStatus::Error, text));
                    break;
                }
                Interpretation::ToolCalls => {
                    let ModelResponse {
                        text, tool_calls, ..
                    } = response;
                    self.history
                        .push(Message::assistant_with_calls(&text, tool_calls.clone()));

                    if !self.config.permission.tools_enabled() {
                        let count = tool_calls.len();
                        self.history
                            .extend(skipped_results(&tool_calls, "tool execution is disabled"));
                        let message = format!(
                            "Tool execution is disabled for this session; {count} tool call(s) were skipped."
                        );
                        self.history.push(Message::assistant_text(&message));
                        self.guard.reset();
                        outcome = Some(Outcome::finish(TurnStatus::Error, message));
                        break;
                    }

                    let warnings: Vec<String> = tool_calls
                        .iter()
                        .filter_map(|call| {
                            self.guard
                                .observe(&call.function.name, &call.function.arguments)
                        })
                        .collect();

                    let dispatched = Dispatcher {
                        tools: self.tools.as_ref(),
                        emitter: &self.emitter,
                        policy: &self.config.permission,
                        cancel,
                    }
                    .dispatch(&tool_calls)
                    .await;

                    if let Some(step) = steps.last_mut() {
                        step.observation = Some(dispatched.observation);
                    }
                    self.history.extend(dispatched.messages);

                    if dispatched.rejected {
                        info!("Tool call rejected, ending turn {turn}");
                        self.history.push(Message::assistant_text(REJECTION_MESSAGE));
                        outcome = Some(Outcome {
                            status: TurnStatus::Cancelled,
                            final_text: Some(REJECTION_MESSAGE.to_string()),
                            error: None,
                        });
                        break;
                    }
                    for warning in warnings {
                        warn!("Repetition detected: {warning}");
                        self.history.push(Message::system(warning));
                    }

                    previous_text = text;
                    self.emitter.close_step();
                }
                Interpretation::Final | Interpretation::Empty => {
                    self.guard.reset();
                    if !response.text.is_empty() {
                        self.history.push(Message::assistant_text(&response.text));
                    }

                    let end_turn = response.stop_reason.is_end_turn();
                    if end_turn || is_final {
                        // Some models give the answer alongside their last tool
                        // calls and then end the turn with no new text.
                        let text = if end_turn && response.text.trim().is_empty() {
                            previous_text.clone()
                        } else {
                            response.text
                        };
                        if !text.trim().is_empty() {
                            outcome = Some(Outcome::finish(TurnStatus::Ok, text));
                        }
                    } else {
                        debug!(
                            "Step {index} produced no text, no tool calls and no stop signal ({:?})",
                            response.stop_reason
                        );
                    }
                    break;
                }
            }
        }

        self.emitter.close_step();
        let outcome = match outcome {
            Some(outcome) if outcome.final_text.is_some() => outcome,
            _ => Outcome::finish(TurnStatus::Error, NO_ANSWER_MESSAGE),
        };
        let final_text = outcome.final_text.unwrap_or_default();
        self.emitter
            .final_answer(outcome.status, &final_text, self.violation_count);

        let result = TurnResult {
            turn,
            status: outcome.status,
            final_text,
            error: outcome.error,
            steps,
            usage: self.accountant.turn(),
            duration: started.elapsed(),
            violation_count: self.violation_count,
            compactions,
        };
        info!(
            "Turn {turn} finished: {} after {} step(s) in {:.1}s",
            result.status,
            result.steps.len(),
            result.duration.as_secs_f64()
        );
        result
    }

    /// One model call over the full history, raced against cancellation.
    async fn call_model(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<ModelResponse, ModelError> {
        let tools = self.tools.definitions();
        let request = ModelRequest {
            messages: &self.history,
            tools: &tools,
            max_tokens: self.config.max_output_tokens,
        };
        let emitter = &self.emitter;
        let on_partial = |delta: &str| emitter.text_delta(delta);
        debug!(
            "Model request: {} message(s), {} tool(s)",
            self.history.len(),
            tools.len()
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
            response = self.model.call(request, &on_partial, cancel) => response,
        }?;

        debug!(
            "Model response: {} chars, {} tool call(s), stop {:?}",
            response.text.len(),
            response.tool_calls.len(),
            response.stop_reason
        );
        if let Some(reasoning) = &response.reasoning {
            trace!("Model reasoning: {} chars", reasoning.len());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_uses_first_non_empty_line() {
        assert_eq!(
            derive_title("\n\n  fix   the\tbuild  \nmore details", 60).as_deref(),
            Some("fix the build")
        );
        assert_eq!(derive_title("   \n  ", 60), None);
    }

    #[test]
    fn title_is_truncated_with_ellipsis() {
        let title = derive_title("abcdefghij", 5).unwrap();
        assert_eq!(title, "abcd…");
        assert_eq!(title.chars().count(), 5);
        assert_eq!(derive_title("abcde", 5).as_deref(), Some("abcde"));
        assert_eq!(derive_title("abc def", 5).as_deref(), Some("abc…"));
    }

    #[test]
    fn status_display_matches_serde() {
        for status in [
            TurnStatus::Ok,
            TurnStatus::Error,
            TurnStatus::Cancelled,
            TurnStatus::PromptLimit,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.to_string());
        }
    }

    #[test]
    fn finish_sets_error_only_for_failures() {
        let ok = Outcome::finish(TurnStatus::Ok, "done");
        assert_eq!(ok.error, None);
        let failed = Outcome::finish(TurnStatus::Error, "boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
