//! Convenience re-exports for common `turnkey-rs` types.
//!
//! Meant to be glob-imported when embedding a session:
//!
//! ```ignore
//! use turnkey_rs::prelude::*;
//! ```
//!
//! This pulls in what most callers need: the [`Session`] and its config,
//! [`Message`] constructors, the [`ModelClient`] contract with the
//! [`OpenRouterClient`], the [`Tool`] trait and [`ToolSet`], permissions,
//! sinks and hooks. Streaming internals and compaction helpers live in their
//! modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    DEFAULT_MODEL, Error, Message, MessageRole, Result, ToolCall, ToolDef, json_schema_for,
};

// ── Model ───────────────────────────────────────────────────────────
pub use crate::api::{
    ModelClient, ModelError, ModelFuture, ModelRequest, ModelResponse, OpenRouterClient,
    PartialTextFn, RetryConfig, StopReason,
};

// ── Session and turns ───────────────────────────────────────────────
pub use crate::agent::{
    AutoCompactConfig, CancelHandle, ContextPhase, EventPayload, FixedApproval, HistoryEvent,
    HistorySink, JsonlSink, LifecycleHooks, LoggingSink, MemorySink, NoopHooks, Session,
    SessionConfig, SessionMode, Step, Toggle, TurnResult, TurnStatus,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{CharEstimateCounter, TokenCounter, TokenUsage};
pub use crate::context::compactor::{CompactReason, CompactResult, CompactStatus, CompactionConfig};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    ApprovalDecision, ExecutionMode, FnTool, PermissionPolicy, ShellCommandTool, Tool,
    ToolAction, ToolActionResult, ToolFuture, ToolMode, ToolOrchestrator, ToolSet,
    load_shell_tools,
};
