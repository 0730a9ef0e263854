//! Typed lifecycle hooks.
//!
//! [`LifecycleHooks`] has one named method per lifecycle point. Every method
//! has a no-op default, so callers implement only what they observe. The
//! [`EventEmitter`](super::events::EventEmitter) calls the matching method
//! right after writing the corresponding history event.

use crate::agent::events::ContextPhase;
use crate::agent::turn::{TurnResult, TurnStatus};
use crate::context::compactor::CompactResult;
use crate::tools::orchestrator::{ApprovalDecision, ExecutionMode, ToolAction, ToolActionResult};

/// Typed lifecycle callbacks.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl LifecycleHooks for Printer {
///     fn on_text_delta(&self, delta: &str) {
///         print!("{delta}");
///     }
///
///     fn on_approval_request(&self, action: &ToolAction) -> ApprovalDecision {
///         if action.tool == "shell" { ApprovalDecision::Deny } else { ApprovalDecision::AllowOnce }
///     }
/// }
/// ```
pub trait LifecycleHooks: Send + Sync {
    fn on_session_start(&self, _session_id: &str, _model: &str) {}

    fn on_turn_start(&self, _turn: u32, _input: &str) {}

    /// Streaming text from the model as it arrives.
    fn on_text_delta(&self, _delta: &str) {}

    fn on_action(&self, _action: &ToolAction, _mode: ExecutionMode) {}

    fn on_observation(&self, _result: &ToolActionResult, _mode: ExecutionMode) {}

    fn on_final(&self, _status: TurnStatus, _text: &str) {}

    fn on_context_usage(&self, _phase: ContextPhase, _prompt_tokens: usize, _context_window: usize) {}

    fn on_context_compacted(&self, _result: &CompactResult) {}

    fn on_title_generated(&self, _title: &str) {}

    /// Decide whether a tool action may run. Only called when the
    /// permission policy requires approval and no grant covers the tool.
    fn on_approval_request(&self, _action: &ToolAction) -> ApprovalDecision {
        ApprovalDecision::AllowOnce
    }

    fn on_approval_response(&self, _action: &ToolAction, _decision: ApprovalDecision) {}

    fn on_turn_end(&self, _result: &TurnResult) {}
}

/// Hooks that observe nothing and approve every request once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Answers every approval request with a fixed decision.
///
/// Useful for unattended runs: `FixedApproval(ApprovalDecision::Deny)` makes
/// an approval-required session refuse every tool call.
#[derive(Debug, Clone, Copy)]
pub struct FixedApproval(pub ApprovalDecision);

impl LifecycleHooks for FixedApproval {
    fn on_approval_request(&self, _action: &ToolAction) -> ApprovalDecision {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_once() {
        let action = ToolAction {
            id: "c1".into(),
            tool: "list_dir".into(),
            input: "{}".into(),
        };
        assert_eq!(
            NoopHooks.on_approval_request(&action),
            ApprovalDecision::AllowOnce
        );
        assert_eq!(
            FixedApproval(ApprovalDecision::Deny).on_approval_request(&action),
            ApprovalDecision::Deny
        );
    }
}
