//! Context management: token accounting and history compaction.
//!
//! - [`tokens`]: the [`TokenCounter`] contract, a character-ratio estimator,
//!   and the [`TokenAccountant`] keeping step/turn/session totals.
//! - [`compactor`]: summarizes history into one message when prompt tokens
//!   reach the auto-compact threshold, or on demand.

pub mod compactor;
pub mod tokens;

pub use compactor::{
    CompactReason, CompactResult, CompactStatus, CompactionConfig, Compactor,
    auto_compact_threshold,
};
pub use tokens::{CharEstimateCounter, TokenAccountant, TokenCounter, TokenUsage};
