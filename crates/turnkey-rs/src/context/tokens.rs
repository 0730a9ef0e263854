//! Token counting and usage accounting.
//!
//! [`TokenCounter`] is the injected counting function; [`CharEstimateCounter`]
//! is a tokenizer-free estimate based on characters per token. The
//! [`TokenAccountant`] wraps a counter and keeps per-step, per-turn and
//! per-session [`TokenUsage`] totals.

use crate::{Message, UsageInfo};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message overhead (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Counts tokens for one model.
pub trait TokenCounter: Send + Sync {
    /// Tokens in a plain string.
    fn count_text(&self, text: &str) -> usize;

    /// Tokens in a message list, including tool-call names and arguments.
    fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                let calls: usize = m
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|c| self.count_text(&c.function.name) + self.count_text(&c.function.arguments))
                    .sum();
                MESSAGE_OVERHEAD_TOKENS + self.count_text(m.text()) + calls
            })
            .sum()
    }

    /// The model this counter is calibrated for.
    fn model(&self) -> &str;

    /// Release tokenizer resources. Called once at session close.
    fn dispose(&self) {}
}

/// Character-ratio token estimate.
#[derive(Debug, Clone)]
pub struct CharEstimateCounter {
    model: String,
    chars_per_token: f64,
}

impl CharEstimateCounter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Override the chars-per-token ratio (e.g. calibrated from API usage).
    /// Non-positive ratios are ignored.
    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        if ratio > 0.0 {
            self.chars_per_token = ratio;
        }
        self
    }
}

impl TokenCounter for CharEstimateCounter {
    fn count_text(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Prompt/completion/total token triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

impl std::fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} prompt + {} completion = {} tokens",
            self.prompt_tokens, self.completion_tokens, self.total_tokens
        )
    }
}

/// Running token totals for a session.
pub struct TokenAccountant {
    counter: Box<dyn TokenCounter>,
    last_step: TokenUsage,
    turn: TokenUsage,
    session: TokenUsage,
}

impl std::fmt::Debug for TokenAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAccountant")
            .field("model", &self.counter.model())
            .field("turn", &self.turn)
            .field("session", &self.session)
            .finish()
    }
}

impl TokenAccountant {
    pub fn new(counter: Box<dyn TokenCounter>) -> Self {
        Self {
            counter,
            last_step: TokenUsage::default(),
            turn: TokenUsage::default(),
            session: TokenUsage::default(),
        }
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// Current prompt size of `history`.
    pub fn prompt_tokens(&self, history: &[Message]) -> usize {
        self.counter.count_messages(history)
    }

    /// Reset the per-turn total.
    pub fn begin_turn(&mut self) {
        self.turn = TokenUsage::default();
        self.last_step = TokenUsage::default();
    }

    /// Record one step and fold it into the turn and session totals.
    ///
    /// Each field prefers the model-reported number; missing fields fall back
    /// to the local estimate (`history` for prompt, `completion_text` for
    /// completion). The total is the sum unless the model reported one.
    pub fn record_step(
        &mut self,
        reported: Option<&UsageInfo>,
        history: &[Message],
        completion_text: &str,
    ) -> TokenUsage {
        let reported_prompt = reported.and_then(|u| u.prompt_tokens);
        let reported_completion = reported.and_then(|u| u.completion_tokens);
        let prompt = match reported_prompt {
            Some(n) => n as usize,
            None => self.counter.count_messages(history),
        };
        let completion = match reported_completion {
            Some(n) => n as usize,
            None => self.counter.count_text(completion_text),
        };
        let total = reported
            .and_then(|u| u.total_tokens)
            .map_or(prompt + completion, |n| n as usize);

        let step = TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        };
        self.last_step = step;
        self.turn += step;
        self.session += step;
        step
    }

    pub fn last_step(&self) -> TokenUsage {
        self.last_step
    }

    pub fn turn(&self) -> TokenUsage {
        self.turn
    }

    pub fn session(&self) -> TokenUsage {
        self.session
    }

    pub fn dispose(&self) {
        self.counter.dispose();
    }
}
