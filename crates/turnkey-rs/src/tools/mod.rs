//! Tool abstractions and the tool engine.
//!
//! The turn scheduler only depends on the [`ToolOrchestrator`] contract in
//! [`orchestrator`]: advertise definitions, report capabilities, execute
//! actions under a [`PermissionPolicy`], and own approval grants.
//! [`ToolSet`] is the engine shipped with the crate.
//!
//! # Defining tools
//!
//! - **[`FnTool`]**: closure-based, auto-parses arguments. Best for simple tools.
//! - **`impl Tool`**: full struct with manual [`Tool::definition()`] and
//!   [`Tool::execute()`]. Best for tools with state.
//!
//! Mark side-effecting tools with [`Tool::is_mutation()`]; any batch that
//! contains one runs sequentially.

pub mod core;
pub mod orchestrator;
pub mod shell;

// Re-export commonly used items at the module level.
pub use core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, FnTool, Tool, ToolFuture, ToolSet,
    truncate_result, validate_tool_arguments,
};
pub use orchestrator::{
    ApprovalDecision, ApprovalHandler, BatchObserver, BatchOptions, BatchOutcome,
    ExecutionContext, ExecutionMode, FailurePolicy, NoopObserver, PermissionPolicy, ToolAction,
    ToolActionResult, ToolCapabilities, ToolErrorKind, ToolMode, ToolOrchestrator, ToolStatus,
};
pub use shell::{ShellCommandTool, load_shell_tools};
