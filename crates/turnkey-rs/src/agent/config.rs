//! Configuration types for a [`Session`](super::session::Session).
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Auto-compaction is **enabled by default**; turn it off with
//! [`Toggle::disabled()`].
//!
//! # Examples
//!
//! Builder style:
//!
//! ```ignore
//! let config = SessionConfig::new("anthropic/claude-sonnet-4", "You are a coding assistant.")
//!     .with_context_window(128_000)
//!     .with_permission(PermissionPolicy::new(ToolMode::Unrestricted).with_dangerous("shell"))
//!     .with_retries(3);
//! ```
//!
//! Struct update syntax for module knobs:
//!
//! ```ignore
//! let config = SessionConfig {
//!     auto_compact: Toggle::disabled(),
//!     ..SessionConfig::new("anthropic/claude-sonnet-4", "You are helpful.")
//! };
//! ```

use crate::api::retry::RetryConfig;
use crate::context::compactor::CompactionConfig;
use crate::error::{Error, Result};
use crate::tools::orchestrator::PermissionPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    /// Create an enabled instance with the given inner config.
    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// The inner config, if the module is enabled.
    pub fn active(&self) -> Option<&T> {
        self.enabled.then_some(&self.config)
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

/// Auto-compaction configuration.
pub type AutoCompactConfig = Toggle<CompactionConfig>;

// ── Session config ─────────────────────────────────────────────────

/// Default context window in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Identical consecutive tool calls that trigger a repetition warning.
pub const DEFAULT_REPETITION_THRESHOLD: u32 = 3;

/// Who is driving the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// A human is at the keyboard and can answer approval prompts.
    #[default]
    Interactive,
    /// One-shot, unattended.
    Batch,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Interactive => write!(f, "interactive"),
            SessionMode::Batch => write!(f, "batch"),
        }
    }
}

/// Configuration for a [`Session`](super::session::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).
    pub model: String,
    /// System prompt placed at `history[0]`. Empty means no system message.
    pub system_prompt: String,
    pub mode: SessionMode,
    /// Hard context window in tokens. Prompts above it end the turn.
    pub context_window: usize,
    /// Auto-compaction. Enabled by default at 80% of the window.
    pub auto_compact: AutoCompactConfig,
    /// Identical consecutive tool calls before a warning is injected.
    pub repetition_threshold: u32,
    pub permission: PermissionPolicy,
    /// Retry configuration for transient API failures.
    pub retry: RetryConfig,
    /// Maximum tokens per model response. 0 leaves it to the provider.
    pub max_output_tokens: u32,
    /// Maximum characters in a derived session title.
    pub title_max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            mode: SessionMode::default(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            auto_compact: AutoCompactConfig::default(),
            repetition_threshold: DEFAULT_REPETITION_THRESHOLD,
            permission: PermissionPolicy::default(),
            retry: RetryConfig::default(),
            max_output_tokens: 0,
            title_max_chars: 60,
        }
    }
}

impl SessionConfig {
    /// Create a config with a model and system prompt.
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let percent = self.auto_compact.config.threshold_percent;
        if !(1..=100).contains(&percent) {
            return Err(Error::Config(format!(
                "auto_compact.config.threshold_percent must be between 1 and 100, got {percent}"
            )));
        }
        if self.context_window == 0 {
            return Err(Error::Config("context_window must be positive".into()));
        }
        if self.repetition_threshold == 0 {
            return Err(Error::Config("repetition_threshold must be positive".into()));
        }
        Ok(())
    }

    // ── Builder methods ───────────────────────────────────────────

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the context window size in tokens.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Set the auto-compact threshold as a percent of the context window.
    pub fn with_compact_threshold(mut self, percent: u8) -> Self {
        self.auto_compact.config.threshold_percent = percent;
        self
    }

    pub fn with_auto_compact(mut self, auto_compact: AutoCompactConfig) -> Self {
        self.auto_compact = auto_compact;
        self
    }

    pub fn with_permission(mut self, permission: PermissionPolicy) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_repetition_threshold(mut self, threshold: u32) -> Self {
        self.repetition_threshold = threshold;
        self
    }

    /// Set the maximum number of retries for transient API failures.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_max_output_tokens(mut self, max_tokens: u32) -> Self {
        self.max_output_tokens = max_tokens;
        self
    }

    pub fn with_title_max_chars(mut self, max_chars: usize) -> Self {
        self.title_max_chars = max_chars;
        self
    }
}
