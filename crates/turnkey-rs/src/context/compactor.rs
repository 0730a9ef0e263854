//! History compaction: replace a long conversation with a model-written summary.
//!
//! A compaction keeps the system message, a token-budgeted tail of the most
//! recent user messages, and one new user message carrying
//! [`SUMMARY_PREFIX`] plus the summary. Prior summaries are never carried over
//! into the retained tail, so summaries do not chain in the visible history.
//!
//! Compaction is fail-open: an empty or failed summary leaves history
//! untouched and is reported as [`CompactStatus::Failed`].

use super::tokens::TokenCounter;
use crate::api::{ModelClient, ModelError, ModelRequest};
use crate::{Message, MessageRole};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Marker that opens every summary message.
pub const SUMMARY_PREFIX: &str = "[Conversation summary] Earlier turns of this conversation were compacted. Summary so far:\n\n";

pub const DEFAULT_THRESHOLD_PERCENT: u8 = 80;
pub const DEFAULT_RETAINED_USER_TOKENS: usize = 20_000;

/// Instructions for the summarization call.
const COMPACTION_PROMPT: &str = "\
You are compacting the history of a coding-agent conversation so the work can continue \
in a smaller context window. Write a plain-language summary of the transcript. Cover:
- The user's goals and any constraints they stated
- What was done so far: tools called, files read or modified, commands run
- Key findings, decisions and error messages (verbatim where short)
- Approaches that failed and why
- What remains to be done next

Rules:
- Only include facts present in the transcript. Do not speculate.
- Preserve file paths, identifiers and commands exactly.
- Do not call tools. Reply with the summary text only.";

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").expect("valid regex")
});
static NEWLINE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Auto-compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Percent of the context window that triggers auto-compaction (1–100).
    pub threshold_percent: u8,
    /// Token budget for the retained tail of user messages.
    pub retained_user_tokens: usize,
    /// Output cap for the summarization call.
    pub max_summary_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            retained_user_tokens: DEFAULT_RETAINED_USER_TOKENS,
            max_summary_tokens: 2048,
        }
    }
}

/// Token count at which auto-compaction fires: `floor(window * percent / 100)`,
/// never below 1. `percent` is clamped to 1–100.
pub fn auto_compact_threshold(context_window: usize, percent: u8) -> usize {
    let percent = usize::from(percent.clamp(1, 100));
    (context_window.saturating_mul(percent) / 100).max(1)
}

/// What triggered a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactReason {
    Auto,
    Manual,
}

/// Outcome class of a compaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactStatus {
    Success,
    Skipped,
    Failed,
}

/// Outcome of one compaction attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactResult {
    pub reason: CompactReason,
    pub status: CompactStatus,
    pub before_tokens: usize,
    pub after_tokens: usize,
    pub threshold: usize,
    /// `(before - after) / before` as a percentage, one decimal place.
    pub reduction_pct: f64,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl CompactResult {
    fn unchanged(
        reason: CompactReason,
        status: CompactStatus,
        tokens: usize,
        threshold: usize,
        error: Option<String>,
    ) -> Self {
        Self {
            reason,
            status,
            before_tokens: tokens,
            after_tokens: tokens,
            threshold,
            reduction_pct: 0.0,
            summary: None,
            error,
        }
    }
}

/// Strip thinking markup, collapse runs of blank lines, trim.
pub fn normalize_summary(raw: &str) -> String {
    let without_thinking = THINK_BLOCK.replace_all(raw, "");
    let collapsed = NEWLINE_RUN.replace_all(&without_thinking, "\n\n");
    collapsed.trim().to_string()
}

/// Whether a message is a summary produced by an earlier compaction.
pub fn is_summary_message(message: &Message) -> bool {
    message.role == MessageRole::User && message.text().starts_with(SUMMARY_PREFIX)
}

/// Build the (system, user) pair for the summarization call.
pub fn build_compaction_request(history: &[Message]) -> (String, String) {
    let mut transcript = String::from("=== TRANSCRIPT ===\n");
    for msg in history.iter().filter(|m| m.role != MessageRole::System) {
        let text = msg.text();
        if !text.is_empty() {
            transcript.push_str(&format!("[{}]: {text}\n\n", msg.role));
        }
        for call in msg.tool_calls.iter().flatten() {
            transcript.push_str(&format!(
                "[{}]: called {}({})\n\n",
                msg.role, call.function.name, call.function.arguments
            ));
        }
    }
    (COMPACTION_PROMPT.to_string(), transcript)
}

/// Truncate `text` to the longest char prefix that fits `budget` tokens.
pub fn truncate_to_tokens(counter: &dyn TokenCounter, text: &str, budget: usize) -> String {
    if counter.count_text(text) <= budget {
        return text.to_string();
    }
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let prefix = |chars: usize| text.get(..boundaries[chars]).unwrap_or_default();

    let (mut lo, mut hi) = (0, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if counter.count_text(prefix(mid)) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    prefix(lo).to_string()
}

/// Pick the newest user messages that fit `budget` tokens, returned in
/// chronological order. The first message that does not fit whole is
/// truncated to the remaining budget and ends the selection. Prior summaries
/// are skipped.
pub fn select_retained_user_messages(
    history: &[Message],
    counter: &dyn TokenCounter,
    budget: usize,
) -> Vec<Message> {
    let mut remaining = budget;
    let mut kept = Vec::new();
    for msg in history
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::User && !is_summary_message(m))
    {
        if remaining == 0 {
            break;
        }
        let tokens = counter.count_text(msg.text());
        if tokens <= remaining {
            remaining -= tokens;
            kept.push(msg.clone());
        } else {
            let truncated = truncate_to_tokens(counter, msg.text(), remaining);
            if !truncated.is_empty() {
                kept.push(Message::user(truncated));
            }
            break;
        }
    }
    kept.reverse();
    kept
}

/// `[system] + retained user messages + summary message`.
pub fn build_compacted_history(
    system: Option<&Message>,
    retained: Vec<Message>,
    summary: &str,
) -> Vec<Message> {
    let mut rebuilt = Vec::with_capacity(retained.len() + 2);
    if let Some(system) = system {
        rebuilt.push(system.clone());
    }
    rebuilt.extend(retained);
    rebuilt.push(Message::user(format!("{SUMMARY_PREFIX}{summary}")));
    rebuilt
}

fn reduction_pct(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    let pct = (before as f64 - after as f64) * 100.0 / before as f64;
    (pct * 10.0).round() / 10.0
}

/// Runs one compaction against a history.
pub struct Compactor<'a> {
    pub model: &'a dyn ModelClient,
    pub counter: &'a dyn TokenCounter,
    pub config: &'a CompactionConfig,
    /// Threshold reported in results (the auto-compact trigger point).
    pub threshold: usize,
}

impl Compactor<'_> {
    /// Compact `history` in place. History is only replaced on success.
    pub async fn compact(
        &self,
        history: &mut Vec<Message>,
        reason: CompactReason,
        cancel: &CancellationToken,
    ) -> CompactResult {
        let before = self.counter.count_messages(history);
        let system = history.first().filter(|m| m.role == MessageRole::System);
        let body_len = history.len() - usize::from(system.is_some());
        if body_len == 0 {
            info!("Compaction ({reason:?}) skipped: no history beyond the system prompt");
            return CompactResult::unchanged(
                reason,
                CompactStatus::Skipped,
                before,
                self.threshold,
                None,
            );
        }

        let (prompt, transcript) = build_compaction_request(history);
        let messages = [Message::system(prompt), Message::user(transcript)];
        let request = ModelRequest {
            messages: &messages,
            tools: &[],
            max_tokens: self.config.max_summary_tokens,
        };
        let response = self.model.call(request, &|_: &str| {}, cancel).await;

        let failed = |error: String| {
            warn!("Compaction ({reason:?}) failed: {error}");
            CompactResult::unchanged(
                reason,
                CompactStatus::Failed,
                before,
                self.threshold,
                Some(error),
            )
        };

        let summary = match response {
            Ok(resp) => normalize_summary(&resp.text),
            Err(ModelError::Cancelled) => return failed("cancelled".into()),
            Err(e) => return failed(e.to_string()),
        };
        if summary.is_empty() {
            return failed("summary was empty".into());
        }

        let retained =
            select_retained_user_messages(history, self.counter, self.config.retained_user_tokens);
        let rebuilt = build_compacted_history(system, retained, &summary);
        let after = self.counter.count_messages(&rebuilt);
        *history = rebuilt;

        let pct = reduction_pct(before, after);
        info!("Compaction ({reason:?}): {before} -> {after} tokens ({pct:.1}% reduction)");
        CompactResult {
            reason,
            status: CompactStatus::Success,
            before_tokens: before,
            after_tokens: after,
            threshold: self.threshold,
            reduction_pct: pct,
            summary: Some(summary),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::api::{ModelFuture, ModelResponse, PartialTextFn};
    use crate::context::tokens::CharEstimateCounter;
    use std::sync::Mutex;

    /// Returns a canned summary and records the request it saw.
    struct SummaryModel {
        reply: Result<String, ModelError>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl SummaryModel {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelClient for SummaryModel {
        fn call<'a>(
            &'a self,
            request: ModelRequest<'a>,
            _on_partial: PartialTextFn<'a>,
            _cancel: &'a CancellationToken,
        ) -> ModelFuture<'a> {
            self.seen.lock().unwrap().push(request.messages.to_vec());
            let reply = self.reply.clone();
            Box::pin(async move {
                reply.map(|text| ModelResponse {
                    text,
                    ..Default::default()
                })
            })
        }

        fn model(&self) -> &str {
            "summary-model"
        }
    }

    fn unit_counter() -> CharEstimateCounter {
        CharEstimateCounter::new("m").with_chars_per_token(1.0)
    }

    #[test]
    fn threshold_floors_and_clamps() {
        assert_eq!(auto_compact_threshold(100_000, 80), 80_000);
        assert_eq!(auto_compact_threshold(999, 80), 799);
        assert_eq!(auto_compact_threshold(1, 50), 1);
        assert_eq!(auto_compact_threshold(10, 0), 1);
        assert_eq!(auto_compact_threshold(1000, 200), 1000);
    }

    #[test]
    fn normalize_strips_thinking_and_blank_runs() {
        let raw = "<think>plan\nstuff</think>\n\nDid A.\n\n\n\nDid B.<THINKING>x</THINKING>  \n";
        assert_eq!(normalize_summary(raw), "Did A.\n\nDid B.");
        assert_eq!(normalize_summary("<thinking>only</thinking>\n"), "");
    }

    #[test]
    fn retained_selection_is_newest_first_then_chronological() {
        let counter = unit_counter();
        let history = vec![
            Message::system("sys"),
            Message::user("aaaa"),
            Message::assistant_text("reply"),
            Message::user("bbbb"),
            Message::user(format!("{SUMMARY_PREFIX}old")),
            Message::user("cccc"),
        ];
        let kept = select_retained_user_messages(&history, &counter, 10);
        let texts: Vec<&str> = kept.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["aa", "bbbb", "cccc"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let counter = unit_counter();
        assert_eq!(truncate_to_tokens(&counter, "héllo wörld", 4), "héll");
        assert_eq!(truncate_to_tokens(&counter, "short", 10), "short");
        assert_eq!(truncate_to_tokens(&counter, "abc", 0), "");
    }

    #[test]
    fn transcript_includes_tool_calls() {
        let history = vec![
            Message::system("sys"),
            Message::user("list files"),
            Message::assistant_tool_calls(vec![ToolCall::new("c1", "list_dir", r#"{"path":"."}"#)]),
            Message::tool_result("c1", "a.txt"),
        ];
        let (_, transcript) = build_compaction_request(&history);
        assert!(transcript.contains("[user]: list files"));
        assert!(transcript.contains(r#"[assistant]: called list_dir({"path":"."})"#));
        assert!(transcript.contains("[tool]: a.txt"));
        assert!(!transcript.contains("sys"));
    }

    #[tokio::test]
    async fn system_only_history_is_skipped() {
        let model = SummaryModel::replying("unused");
        let counter = unit_counter();
        let config = CompactionConfig::default();
        let compactor = Compactor {
            model: &model,
            counter: &counter,
            config: &config,
            threshold: 50,
        };
        let mut history = vec![Message::system("sys")];
        let result = compactor
            .compact(&mut history, CompactReason::Manual, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompactStatus::Skipped);
        assert_eq!(result.before_tokens, result.after_tokens);
        assert_eq!(history.len(), 1);
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_compaction_rebuilds_history() {
        let model = SummaryModel::replying("<think>hm</think>User asked for files; found a.txt.");
        let counter = unit_counter();
        let config = CompactionConfig::default();
        let compactor = Compactor {
            model: &model,
            counter: &counter,
            config: &config,
            threshold: 50,
        };
        let mut history = vec![
            Message::system("sys"),
            Message::user("list files"),
            Message::assistant_text("x".repeat(500)),
            Message::tool_result("c1", "y".repeat(500)),
        ];
        let result = compactor
            .compact(&mut history, CompactReason::Auto, &CancellationToken::new())
            .await;

        assert_eq!(result.status, CompactStatus::Success);
        assert!(result.after_tokens < result.before_tokens);
        assert!(result.reduction_pct > 0.0);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), "sys");
        assert_eq!(history[1].text(), "list files");
        assert!(is_summary_message(&history[2]));
        assert!(history[2].text().ends_with("User asked for files; found a.txt."));
    }

    #[tokio::test]
    async fn empty_summary_fails_and_keeps_history() {
        let model = SummaryModel::replying("<thinking>nothing</thinking>\n\n");
        let counter = unit_counter();
        let config = CompactionConfig::default();
        let compactor = Compactor {
            model: &model,
            counter: &counter,
            config: &config,
            threshold: 50,
        };
        let mut history = vec![Message::system("sys"), Message::user("hello")];
        let result = compactor
            .compact(&mut history, CompactReason::Auto, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompactStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("summary was empty"));
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn model_error_fails() {
        let model = SummaryModel {
            reply: Err(ModelError::Transport("reset".into())),
            seen: Mutex::new(Vec::new()),
        };
        let counter = unit_counter();
        let config = CompactionConfig::default();
        let compactor = Compactor {
            model: &model,
            counter: &counter,
            config: &config,
            threshold: 50,
        };
        let mut history = vec![Message::user("hello")];
        let result = compactor
            .compact(&mut history, CompactReason::Manual, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompactStatus::Failed);
        assert!(result.error.unwrap().contains("reset"));
    }
}
