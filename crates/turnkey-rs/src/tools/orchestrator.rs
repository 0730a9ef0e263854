//! The tool engine contract the dispatch coordinator depends on.
//!
//! A [`ToolOrchestrator`] executes [`ToolAction`]s under a
//! [`PermissionPolicy`], asking an [`ApprovalHandler`] when the policy
//! requires it, and reports each outcome as a [`ToolActionResult`].
//! Approval grants are owned by the engine: "once" grants last until
//! [`clear_once_approvals`](ToolOrchestrator::clear_once_approvals), which the
//! session calls after every turn.

use crate::{ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`ToolOrchestrator::execute_action`].
pub type ToolActionFuture<'a> = Pin<Box<dyn Future<Output = ToolActionResult> + Send + 'a>>;

/// Boxed future returned by [`ToolOrchestrator::execute_actions`].
pub type BatchFuture<'a> = Pin<Box<dyn Future<Output = BatchOutcome> + Send + 'a>>;

// ── Permissions ────────────────────────────────────────────────────

/// Session-wide tool execution mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Tool calls are never executed.
    Disabled,
    /// Every tool call needs approval.
    #[default]
    ApprovalRequired,
    /// Tools run without asking, except dangerous ones.
    Unrestricted,
}

impl std::str::FromStr for ToolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(ToolMode::Disabled),
            "approval_required" | "approval" => Ok(ToolMode::ApprovalRequired),
            "unrestricted" => Ok(ToolMode::Unrestricted),
            other => Err(format!(
                "unknown tool mode '{other}' (expected disabled, approval_required, unrestricted)"
            )),
        }
    }
}

/// Which tools may run and which need a human in the loop.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PermissionPolicy {
    pub mode: ToolMode,
    /// Tools that always need approval, even in `Unrestricted` mode.
    pub dangerous: BTreeSet<String>,
}

impl PermissionPolicy {
    pub fn new(mode: ToolMode) -> Self {
        Self {
            mode,
            dangerous: BTreeSet::new(),
        }
    }

    /// Mark a tool as dangerous (builder pattern).
    pub fn with_dangerous(mut self, tool: impl Into<String>) -> Self {
        self.dangerous.insert(tool.into());
        self
    }

    pub fn tools_enabled(&self) -> bool {
        self.mode != ToolMode::Disabled
    }

    /// Whether executing `tool` needs an approval decision.
    pub fn requires_approval(&self, tool: &str) -> bool {
        match self.mode {
            ToolMode::Disabled => false,
            ToolMode::ApprovalRequired => true,
            ToolMode::Unrestricted => self.dangerous.contains(tool),
        }
    }
}

/// Answer to an approval request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow this tool until the end of the current turn.
    AllowOnce,
    /// Allow this tool for the rest of the session.
    AllowAlways,
    Deny,
}

impl ApprovalDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, ApprovalDecision::Deny)
    }
}

/// Decides whether a pending tool action may run.
pub trait ApprovalHandler: Send + Sync {
    fn request_approval(&self, action: &ToolAction) -> ApprovalDecision;
}

// ── Actions and results ────────────────────────────────────────────

/// One tool invocation requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolAction {
    /// The model's tool-call id.
    pub id: String,
    pub tool: String,
    /// Raw JSON arguments as emitted by the model.
    pub input: String,
}

impl From<&ToolCall> for ToolAction {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            tool: call.function.name.clone(),
            input: call.function.arguments.clone(),
        }
    }
}

/// Scheduling traits a tool declares.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolCapabilities {
    /// Safe to run concurrently with other calls.
    pub parallel: bool,
    /// Changes external state.
    pub mutating: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Why a tool action did not succeed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    Timeout,
    Cancelled,
    Rejected,
    Disabled,
    /// Not executed because an earlier call in a fail-fast batch failed.
    Skipped,
    /// The tool ran and reported an error.
    Failed,
}

/// Outcome of one [`ToolAction`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolActionResult {
    pub action_id: String,
    pub tool_name: String,
    pub observation: String,
    pub status: ToolStatus,
    pub error_kind: Option<ToolErrorKind>,
    pub duration: Duration,
    pub rejected: bool,
}

impl ToolActionResult {
    pub fn success(action: &ToolAction, observation: impl Into<String>, duration: Duration) -> Self {
        Self {
            action_id: action.id.clone(),
            tool_name: action.tool.clone(),
            observation: observation.into(),
            status: ToolStatus::Success,
            error_kind: None,
            duration,
            rejected: false,
        }
    }

    pub fn error(
        action: &ToolAction,
        kind: ToolErrorKind,
        observation: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            action_id: action.id.clone(),
            tool_name: action.tool.clone(),
            observation: observation.into(),
            status: ToolStatus::Error,
            error_kind: Some(kind),
            duration,
            rejected: kind == ToolErrorKind::Rejected,
        }
    }

    /// The user or policy denied the action.
    pub fn rejected(action: &ToolAction) -> Self {
        Self::error(
            action,
            ToolErrorKind::Rejected,
            format!("Tool '{}' was rejected by the user.", action.tool),
            Duration::ZERO,
        )
    }

    /// The action was never attempted.
    pub fn skipped(action: &ToolAction, reason: &str) -> Self {
        Self::error(
            action,
            ToolErrorKind::Skipped,
            format!("Skipped: tool '{}' was not executed ({reason}).", action.tool),
            Duration::ZERO,
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

// ── Batches ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first rejection or failed action.
    FailFast,
    ContinueAll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    pub mode: ExecutionMode,
    pub failure_policy: FailurePolicy,
}

/// Results of a batch, in action order. A fail-fast batch may return fewer
/// results than actions.
#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<ToolActionResult>,
    pub has_rejection: bool,
}

/// Watches a batch as it runs.
///
/// Parallel batches report every action before any result; sequential
/// batches report each action immediately before its own result.
pub trait BatchObserver: Send + Sync {
    fn before_action(&self, _action: &ToolAction, _mode: ExecutionMode) {}
    fn after_action(&self, _result: &ToolActionResult, _mode: ExecutionMode) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Per-call execution context handed to the engine.
#[derive(Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub policy: &'a PermissionPolicy,
    pub approval: &'a dyn ApprovalHandler,
    pub cancel: &'a CancellationToken,
}

// ── Engine contract ────────────────────────────────────────────────

/// A tool execution engine.
pub trait ToolOrchestrator: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDef>;

    /// Registered tool names, sorted.
    fn tool_names(&self) -> Vec<String>;

    /// `None` for unknown tools.
    fn capabilities(&self, tool: &str) -> Option<ToolCapabilities>;

    /// Approve (if needed) and execute one action.
    fn execute_action<'a>(
        &'a self,
        action: &'a ToolAction,
        ctx: ExecutionContext<'a>,
    ) -> ToolActionFuture<'a>;

    /// Execute a batch. The default runs parallel batches with `join_all` and
    /// sequential batches in order, honoring the failure policy.
    fn execute_actions<'a>(
        &'a self,
        actions: &'a [ToolAction],
        options: BatchOptions,
        ctx: ExecutionContext<'a>,
        observer: &'a dyn BatchObserver,
    ) -> BatchFuture<'a> {
        Box::pin(async move {
            let mode = options.mode;
            let results = match mode {
                ExecutionMode::Parallel => {
                    for action in actions {
                        observer.before_action(action, mode);
                    }
                    let results = futures::future::join_all(
                        actions.iter().map(|action| self.execute_action(action, ctx)),
                    )
                    .await;
                    for result in &results {
                        observer.after_action(result, mode);
                    }
                    results
                }
                ExecutionMode::Sequential => {
                    let mut results = Vec::with_capacity(actions.len());
                    for action in actions {
                        observer.before_action(action, mode);
                        let result = self.execute_action(action, ctx).await;
                        observer.after_action(&result, mode);
                        let stop = options.failure_policy == FailurePolicy::FailFast
                            && (result.rejected || !result.is_success());
                        results.push(result);
                        if stop {
                            break;
                        }
                    }
                    results
                }
            };
            let has_rejection = results.iter().any(|r| r.rejected);
            BatchOutcome {
                results,
                has_rejection,
            }
        })
    }

    /// Forget approvals granted with [`ApprovalDecision::AllowOnce`].
    fn clear_once_approvals(&self);

    /// Release engine resources. Called once at session close.
    fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_rules_per_mode() {
        let policy = PermissionPolicy::new(ToolMode::Unrestricted).with_dangerous("shell");
        assert!(policy.requires_approval("shell"));
        assert!(!policy.requires_approval("read_file"));

        let policy = PermissionPolicy::new(ToolMode::ApprovalRequired);
        assert!(policy.requires_approval("read_file"));

        let policy = PermissionPolicy::new(ToolMode::Disabled);
        assert!(!policy.tools_enabled());
        assert!(!policy.requires_approval("read_file"));
    }

    #[test]
    fn tool_mode_parses() {
        assert_eq!("unrestricted".parse::<ToolMode>(), Ok(ToolMode::Unrestricted));
        assert_eq!("approval".parse::<ToolMode>(), Ok(ToolMode::ApprovalRequired));
        assert!("sometimes".parse::<ToolMode>().is_err());
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: PermissionPolicy =
            serde_json::from_str(r#"{"mode": "unrestricted", "dangerous": ["shell"]}"#).unwrap();
        assert_eq!(policy.mode, ToolMode::Unrestricted);
        assert!(policy.dangerous.contains("shell"));

        let policy: PermissionPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.mode, ToolMode::ApprovalRequired);
    }

    #[test]
    fn result_constructors() {
        let action = ToolAction::from(&ToolCall::new("c1", "shell", "{}"));
        let rejected = ToolActionResult::rejected(&action);
        assert!(rejected.rejected);
        assert_eq!(rejected.error_kind, Some(ToolErrorKind::Rejected));

        let skipped = ToolActionResult::skipped(&action, "earlier call failed");
        assert!(!skipped.rejected);
        assert!(skipped.observation.starts_with("Skipped"));

        let ok = ToolActionResult::success(&action, "done", Duration::from_millis(3));
        assert!(ok.is_success());
        assert_eq!(ok.action_id, "c1");
    }
}
