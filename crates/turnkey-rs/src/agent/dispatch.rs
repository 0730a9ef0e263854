//! Tool dispatch for one step.
//!
//! The [`Dispatcher`] turns the model's tool calls into [`ToolAction`]s,
//! picks an [`ExecutionMode`], narrates each action and observation through
//! the [`EventEmitter`], and hands back history-ready tool-result messages.
//! It never touches the session history itself.

use crate::Message;
use crate::ToolCall;
use crate::agent::events::{EmitterApproval, EventEmitter};
use crate::tools::orchestrator::{
    BatchObserver, BatchOptions, ExecutionContext, ExecutionMode, FailurePolicy,
    PermissionPolicy, ToolAction, ToolActionResult, ToolOrchestrator,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reason attached to calls cut off by a fail-fast batch.
const SKIPPED_AFTER_FAILURE: &str = "an earlier call in this batch failed or was rejected";

/// Everything one dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub mode: ExecutionMode,
    /// One result per tool call, in call order. Includes synthesized skips.
    pub results: Vec<ToolActionResult>,
    /// One tool-result message per tool call, in call order.
    pub messages: Vec<Message>,
    /// Tool-labeled observations of every result.
    pub observation: String,
    /// Whether any call was rejected.
    pub rejected: bool,
}

/// Parallel only for multi-call batches of parallel-safe, non-mutating tools.
/// Unknown tools count as neither.
pub fn choose_execution_mode(tools: &dyn ToolOrchestrator, actions: &[ToolAction]) -> ExecutionMode {
    if actions.len() < 2 {
        return ExecutionMode::Sequential;
    }
    let all_parallel = actions.iter().all(|action| {
        tools
            .capabilities(&action.tool)
            .is_some_and(|caps| caps.parallel && !caps.mutating)
    });
    if all_parallel {
        ExecutionMode::Parallel
    } else {
        ExecutionMode::Sequential
    }
}

/// Label and join per-call observations.
pub fn combine_observations(results: &[ToolActionResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}] {}", r.tool_name, r.observation))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tool-result messages for calls that were never run (tools disabled).
pub fn skipped_results(calls: &[ToolCall], reason: &str) -> Vec<Message> {
    calls
        .iter()
        .map(|call| {
            let action = ToolAction::from(call);
            Message::tool_result(&call.id, ToolActionResult::skipped(&action, reason).observation)
        })
        .collect()
}

/// Narrates batch progress as `action` and `observation` events.
struct EmitterNarration<'a>(&'a EventEmitter);

impl BatchObserver for EmitterNarration<'_> {
    fn before_action(&self, action: &ToolAction, mode: ExecutionMode) {
        self.0.action(action, mode);
    }

    fn after_action(&self, result: &ToolActionResult, mode: ExecutionMode) {
        self.0.observation(result, mode);
    }
}

/// Dispatches one step's tool calls.
pub struct Dispatcher<'a> {
    pub tools: &'a dyn ToolOrchestrator,
    pub emitter: &'a EventEmitter,
    pub policy: &'a PermissionPolicy,
    pub cancel: &'a CancellationToken,
}

impl Dispatcher<'_> {
    pub async fn dispatch(&self, calls: &[ToolCall]) -> DispatchOutcome {
        let actions: Vec<ToolAction> = calls.iter().map(ToolAction::from).collect();
        let mode = choose_execution_mode(self.tools, &actions);
        debug!("Dispatching {} tool call(s) ({mode})", actions.len());

        let approval = EmitterApproval(self.emitter);
        let ctx = ExecutionContext {
            policy: self.policy,
            approval: &approval,
            cancel: self.cancel,
        };

        // Parallel batches run every call; sequential ones stop at the first
        // failure or rejection and the remainder is reported as skipped.
        let options = BatchOptions {
            mode,
            failure_policy: match mode {
                ExecutionMode::Parallel => FailurePolicy::ContinueAll,
                ExecutionMode::Sequential => FailurePolicy::FailFast,
            },
        };
        let narration = EmitterNarration(self.emitter);
        let mut results = self
            .tools
            .execute_actions(&actions, options, ctx, &narration)
            .await
            .results;
        for action in actions.iter().skip(results.len()) {
            results.push(ToolActionResult::skipped(action, SKIPPED_AFTER_FAILURE));
        }

        let rejected = results.iter().any(|r| r.rejected);
        let messages = results
            .iter()
            .map(|r| Message::tool_result(&r.action_id, &r.observation))
            .collect();
        DispatchOutcome {
            mode,
            observation: combine_observations(&results),
            messages,
            rejected,
            results,
        }
    }
}
