//! Agent runtime: the [`Session`] and its turn scheduler.
//!
//! - [`session::Session`]: one conversation with its history, tools, token totals,
//!   cancellation. Start here.
//! - [`turn`]: the ReAct step loop behind
//!   [`Session::run_turn()`](session::Session::run_turn), plus [`TurnResult`]
//!   and [`TurnStatus`].
//! - [`config::SessionConfig`]: model, context window, auto-compaction,
//!   permissions, retries.
//! - [`dispatch`]: parallel vs. sequential tool dispatch for one step.
//! - [`guard`]: repeated-action detection.
//! - [`classify`]: interpreting a model response, including plain-text tool
//!   calls (protocol violations).
//! - [`events`]: [`HistoryEvent`], sinks, and the [`EventEmitter`].
//! - [`hooks`]: [`LifecycleHooks`] callbacks with no-op defaults.

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod guard;
pub mod hooks;
pub mod session;
pub mod turn;

// Re-export commonly used items at the module level.
pub use classify::Interpretation;
pub use config::{AutoCompactConfig, SessionConfig, SessionMode, Toggle};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use events::{
    ContextPhase, EventEmitter, EventPayload, HistoryEvent, HistorySink, JsonlSink, LoggingSink,
    MemorySink,
};
pub use guard::RepetitionGuard;
pub use hooks::{FixedApproval, LifecycleHooks, NoopHooks};
pub use session::{CancelHandle, Session};
pub use turn::{Step, TurnResult, TurnStatus};
