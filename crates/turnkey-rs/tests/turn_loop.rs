//! Integration tests for the turn scheduler.
//!
//! These tests drive a real `Session` with a scripted model client and
//! closure tools, and check statuses, history shape, and the event stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use turnkey_rs::agent::guard::repetition_warning;
use turnkey_rs::agent::turn::{NO_ANSWER_MESSAGE, REJECTION_MESSAGE};
use turnkey_rs::context::compactor::SUMMARY_PREFIX;
use turnkey_rs::prelude::*;

// ── Scripted model ───────────────────────────────────────────────────

enum Reply {
    Respond(ModelResponse),
    Fail(ModelError),
    /// Block until the call is cancelled.
    Hang,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    summary: Option<String>,
    turn_calls: usize,
    compaction_calls: usize,
}

/// Pops one scripted reply per turn call. Summarization calls are answered
/// from `summary` and counted separately.
#[derive(Clone, Default)]
struct ScriptedModel {
    script: Arc<Mutex<Script>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Reply>) -> Self {
        let model = Self::default();
        model.script.lock().unwrap().replies = replies.into();
        model
    }

    fn with_summary(self, summary: &str) -> Self {
        self.script.lock().unwrap().summary = Some(summary.to_string());
        self
    }

    fn turn_calls(&self) -> usize {
        self.script.lock().unwrap().turn_calls
    }

    fn compaction_calls(&self) -> usize {
        self.script.lock().unwrap().compaction_calls
    }
}

fn is_compaction_request(request: &ModelRequest<'_>) -> bool {
    request.tools.is_empty()
        && request
            .messages
            .first()
            .is_some_and(|m| m.text().contains("compacting the history"))
}

impl ModelClient for ScriptedModel {
    fn call<'a>(
        &'a self,
        request: ModelRequest<'a>,
        on_partial: PartialTextFn<'a>,
        cancel: &'a CancellationToken,
    ) -> ModelFuture<'a> {
        let reply = {
            let mut script = self.script.lock().unwrap();
            if is_compaction_request(&request) {
                script.compaction_calls += 1;
                match &script.summary {
                    Some(text) => Reply::Respond(text_response(text)),
                    None => Reply::Fail(ModelError::Decode("no summary scripted".into())),
                }
            } else {
                script.turn_calls += 1;
                script
                    .replies
                    .pop_front()
                    .unwrap_or(Reply::Fail(ModelError::Decode("script exhausted".into())))
            }
        };
        Box::pin(async move {
            match reply {
                Reply::Respond(response) => {
                    if !response.text.is_empty() {
                        on_partial(&response.text);
                    }
                    Ok(response)
                }
                Reply::Fail(e) => Err(e),
                Reply::Hang => {
                    cancel.cancelled().await;
                    Err(ModelError::Cancelled)
                }
            }
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        text: text.to_string(),
        stop_reason: StopReason::EndTurn,
        ..Default::default()
    }
}

fn call_response(text: &str, calls: Vec<ToolCall>) -> ModelResponse {
    ModelResponse {
        text: text.to_string(),
        tool_calls: calls,
        stop_reason: StopReason::ToolUse,
        ..Default::default()
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

/// `list_dir` tool that counts its executions.
fn list_dir(runs: Arc<AtomicUsize>) -> FnTool {
    FnTool::new(
        ToolDef::new(
            "list_dir",
            "List a directory",
            serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        ),
        move |_args: serde_json::Value| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                "a.txt\nb.txt".to_string()
            }
        },
    )
}

struct Fixture {
    session: Session,
    model: ScriptedModel,
    sink: MemorySink,
    runs: Arc<AtomicUsize>,
}

fn fixture(config: SessionConfig, model: ScriptedModel) -> Fixture {
    let runs = Arc::new(AtomicUsize::new(0));
    let sink = MemorySink::new();
    let tools = ToolSet::new().with(list_dir(runs.clone()));
    let session = Session::new(
        config,
        Box::new(model.clone()),
        Box::new(tools),
        Box::new(CharEstimateCounter::new("scripted")),
    )
    .with_sink(Box::new(sink.clone()));
    Fixture {
        session,
        model,
        sink,
        runs,
    }
}

fn unrestricted() -> SessionConfig {
    SessionConfig::new("scripted", "You are a coding assistant.")
        .with_permission(PermissionPolicy::new(ToolMode::Unrestricted))
}

fn roles(history: &[Message]) -> Vec<MessageRole> {
    history.iter().map(|m| m.role).collect()
}

// ── Turn outcomes ────────────────────────────────────────────────────

#[tokio::test]
async fn tool_step_then_final_answer() {
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response(
            "",
            vec![ToolCall::new("c1", "list_dir", r#"{"path": "."}"#)],
        )),
        Reply::Respond(text_response("Found 2 files.")),
    ]);
    let mut h = fixture(unrestricted(), model);

    let result = h.session.run_turn("list files").await.unwrap();

    assert_eq!(result.status, TurnStatus::Ok);
    assert_eq!(result.final_text, "Found 2 files.");
    assert_eq!(result.error, None);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].observation.as_deref(), Some("[list_dir] a.txt\nb.txt"));
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        roles(h.session.history()),
        vec![
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    assert_eq!(h.session.history()[3].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(h.session.title(), Some("list files"));

    let kinds = h.sink.kinds();
    assert_eq!(kinds.first(), Some(&"session_start"));
    assert!(kinds.contains(&"session_title"));
    let action = kinds.iter().position(|k| *k == "action").unwrap();
    let observation = kinds.iter().position(|k| *k == "observation").unwrap();
    assert!(action < observation);
    assert_eq!(&kinds[kinds.len() - 2..], &["final", "turn_end"]);
}

#[tokio::test]
async fn events_carry_turn_and_step_cursor() {
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![ToolCall::new("c1", "list_dir", "{}")])),
        Reply::Respond(text_response("done")),
    ]);
    let mut h = fixture(unrestricted(), model);
    h.session.run_turn("go").await.unwrap();

    let events = h.sink.events();
    let session_start = &events[0];
    assert_eq!(session_start.turn, None);
    let action = events.iter().find(|e| e.payload.kind() == "action").unwrap();
    assert_eq!((action.turn, action.step), (Some(1), Some(0)));
    let final_event = events.iter().find(|e| e.payload.kind() == "final").unwrap();
    assert_eq!(final_event.turn, Some(1));
    assert!(events.iter().all(|e| e.session_id == h.session.id()));
}

#[tokio::test]
async fn prompt_over_window_ends_with_prompt_limit() {
    let config = unrestricted()
        .with_context_window(10)
        .with_auto_compact(Toggle::disabled());
    let mut h = fixture(config, ScriptedModel::new(vec![]));

    let result = h
        .session
        .run_turn("please summarize the entire repository")
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::PromptLimit);
    assert!(result.final_text.contains("context window"));
    assert_eq!(result.error.as_deref(), Some(result.final_text.as_str()));
    assert_eq!(h.model.turn_calls(), 0);
    assert_eq!(h.sink.kinds().last(), Some(&"turn_end"));
}

#[tokio::test]
async fn denied_approval_cancels_the_turn() {
    let config = SessionConfig::new("scripted", "sys")
        .with_permission(PermissionPolicy::new(ToolMode::ApprovalRequired));
    let model = ScriptedModel::new(vec![Reply::Respond(call_response(
        "",
        vec![ToolCall::new("c1", "list_dir", "{}")],
    ))]);
    let mut h = fixture(config, model);
    h.session = h
        .session
        .with_hooks(Box::new(FixedApproval(ApprovalDecision::Deny)));

    let result = h.session.run_turn("list files").await.unwrap();

    assert_eq!(result.status, TurnStatus::Cancelled);
    assert_eq!(result.final_text, REJECTION_MESSAGE);
    assert_eq!(result.error, None);
    assert_eq!(h.runs.load(Ordering::SeqCst), 0);

    let history = h.session.history();
    let last = history.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(last.text(), REJECTION_MESSAGE);
    assert_eq!(history[history.len() - 2].role, MessageRole::Tool);

    let kinds = h.sink.kinds();
    assert!(kinds.contains(&"approval_request"));
    assert!(kinds.contains(&"approval_response"));
}

#[tokio::test]
async fn always_grant_skips_later_prompts() {
    struct CountingApproval(Arc<AtomicUsize>);

    impl LifecycleHooks for CountingApproval {
        fn on_approval_request(&self, _action: &ToolAction) -> ApprovalDecision {
            self.0.fetch_add(1, Ordering::SeqCst);
            ApprovalDecision::AllowAlways
        }
    }

    let asked = Arc::new(AtomicUsize::new(0));
    let config = SessionConfig::new("scripted", "sys")
        .with_permission(PermissionPolicy::new(ToolMode::ApprovalRequired));
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![ToolCall::new("c1", "list_dir", "{}")])),
        Reply::Respond(text_response("one")),
        Reply::Respond(call_response("", vec![ToolCall::new("c2", "list_dir", r#"{"path":"src"}"#)])),
        Reply::Respond(text_response("two")),
    ]);
    let mut h = fixture(config, model);
    h.session = h.session.with_hooks(Box::new(CountingApproval(asked.clone())));

    assert_eq!(h.session.run_turn("first").await.unwrap().status, TurnStatus::Ok);
    assert_eq!(h.session.run_turn("second").await.unwrap().status, TurnStatus::Ok);
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert_eq!(h.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn plain_text_tool_call_is_a_protocol_violation() {
    let model = ScriptedModel::new(vec![
        Reply::Respond(text_response(r#"{"tool": "list_dir", "input": {"path": "."}}"#)),
        Reply::Respond(text_response(
            "<tool_call>{\"name\": \"list_dir\", \"arguments\": {}}</tool_call>",
        )),
    ]);
    let mut h = fixture(unrestricted(), model);

    let first = h.session.run_turn("list files").await.unwrap();
    assert_eq!(first.status, TurnStatus::Error);
    assert_eq!(first.violation_count, 1);
    assert!(first.final_text.contains("'list_dir'"));
    assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.session.history().last().unwrap().text(), first.final_text);

    let second = h.session.run_turn("try again").await.unwrap();
    assert_eq!(second.status, TurnStatus::Error);
    assert_eq!(second.violation_count, 2);
}

#[tokio::test]
async fn disabled_tools_skip_calls_and_error() {
    let config = SessionConfig::new("scripted", "sys")
        .with_permission(PermissionPolicy::new(ToolMode::Disabled));
    let model = ScriptedModel::new(vec![Reply::Respond(call_response(
        "",
        vec![
            ToolCall::new("c1", "list_dir", "{}"),
            ToolCall::new("c2", "list_dir", r#"{"path":"src"}"#),
        ],
    ))]);
    let mut h = fixture(config, model);

    let result = h.session.run_turn("list files").await.unwrap();

    assert_eq!(result.status, TurnStatus::Error);
    assert!(result.final_text.contains("disabled"));
    assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        roles(h.session.history()),
        vec![
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    assert!(!h.sink.kinds().contains(&"action"));
}

#[tokio::test]
async fn model_failure_ends_turn_with_error() {
    let model = ScriptedModel::new(vec![Reply::Fail(ModelError::Http {
        status: 400,
        body: "bad request".into(),
    })]);
    let mut h = fixture(unrestricted(), model);

    let result = h.session.run_turn("hi").await.unwrap();

    assert_eq!(result.status, TurnStatus::Error);
    assert!(result.error.as_deref().unwrap().contains("HTTP 400"));
}

#[tokio::test]
async fn empty_response_without_stop_signal_is_no_answer() {
    let model = ScriptedModel::new(vec![Reply::Respond(ModelResponse::default())]);
    let mut h = fixture(unrestricted(), model);

    let result = h.session.run_turn("hi").await.unwrap();

    assert_eq!(result.status, TurnStatus::Error);
    assert_eq!(result.final_text, NO_ANSWER_MESSAGE);
    assert_eq!(h.session.history().last().unwrap().role, MessageRole::User);
}

#[tokio::test]
async fn empty_end_turn_reuses_text_from_tool_step() {
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response(
            "There are two files.",
            vec![ToolCall::new("c1", "list_dir", "{}")],
        )),
        Reply::Respond(text_response("")),
    ]);
    let mut h = fixture(unrestricted(), model);

    let result = h.session.run_turn("list files").await.unwrap();

    assert_eq!(result.status, TurnStatus::Ok);
    assert_eq!(result.final_text, "There are two files.");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_handle_interrupts_pending_model_call() {
    let model = ScriptedModel::new(vec![Reply::Hang, Reply::Respond(text_response("back"))]);
    let mut h = fixture(unrestricted(), model);
    let handle = h.session.cancel_handle();

    let canceller = tokio::spawn(async move {
        while !handle.cancel() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let result = tokio::time::timeout(Duration::from_secs(5), h.session.run_turn("wait"))
        .await
        .expect("turn should stop once cancelled")
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(result.status, TurnStatus::Cancelled);
    assert_eq!(result.final_text, "");
    assert_eq!(h.sink.kinds().last(), Some(&"turn_end"));
    assert!(!h.session.cancel_current_turn());

    let next = h.session.run_turn("again").await.unwrap();
    assert_eq!(next.status, TurnStatus::Ok);
    assert_eq!(next.final_text, "back");
}

// ── Context management ───────────────────────────────────────────────

#[tokio::test]
async fn auto_compaction_runs_once_per_turn() {
    // 1 token per char, trigger at 50% of 2000 tokens. The retained tail
    // keeps the long input, so both steps stay above the threshold.
    let config = unrestricted()
        .with_context_window(2_000)
        .with_compact_threshold(50);
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![ToolCall::new("c1", "list_dir", "{}")])),
        Reply::Respond(text_response("done")),
    ])
    .with_summary("The user asked for a listing.");
    let runs = Arc::new(AtomicUsize::new(0));
    let sink = MemorySink::new();
    let mut session = Session::new(
        config,
        Box::new(model.clone()),
        Box::new(ToolSet::new().with(list_dir(runs))),
        Box::new(CharEstimateCounter::new("scripted").with_chars_per_token(1.0)),
    )
    .with_sink(Box::new(sink.clone()));

    let input = "x".repeat(1_200);
    let result = session.run_turn(&input).await.unwrap();

    assert_eq!(result.status, TurnStatus::Ok);
    assert_eq!(result.compactions.len(), 1);
    assert_eq!(result.compactions[0].status, CompactStatus::Success);
    assert_eq!(result.compactions[0].reason, CompactReason::Auto);
    assert_eq!(result.compactions[0].threshold, 1_000);
    assert_eq!(model.compaction_calls(), 1);
    assert!(
        session
            .history()
            .iter()
            .any(|m| m.text().starts_with(SUMMARY_PREFIX))
    );
    assert_eq!(session.history()[0].role, MessageRole::System);

    let kinds = sink.kinds();
    let compacted = kinds.iter().position(|k| *k == "context_compacted").unwrap();
    let first_assistant = kinds.iter().position(|k| *k == "assistant").unwrap();
    assert!(compacted < first_assistant);
}

#[tokio::test]
async fn failed_auto_compaction_keeps_going() {
    let config = unrestricted()
        .with_context_window(2_000)
        .with_compact_threshold(50);
    // No summary scripted: the summarization call fails.
    let model = ScriptedModel::new(vec![Reply::Respond(text_response("done"))]);
    let mut session = Session::new(
        config,
        Box::new(model.clone()),
        Box::new(ToolSet::new()),
        Box::new(CharEstimateCounter::new("scripted").with_chars_per_token(1.0)),
    );

    let input = "y".repeat(1_200);
    let result = session.run_turn(&input).await.unwrap();

    assert_eq!(result.status, TurnStatus::Ok);
    assert_eq!(result.compactions[0].status, CompactStatus::Failed);
    assert_eq!(session.history()[1].text(), input);
}

#[tokio::test]
async fn manual_compaction_of_empty_history_is_skipped() {
    let mut h = fixture(unrestricted(), ScriptedModel::new(vec![]).with_summary("s"));

    let result = h.session.compact_history(CompactReason::Manual).await;

    assert_eq!(result.status, CompactStatus::Skipped);
    assert_eq!(h.model.compaction_calls(), 0);
    assert_eq!(h.session.history().len(), 1);
    assert_eq!(h.sink.kinds(), vec!["context_compacted"]);
}

// ── Repetition ───────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_identical_calls_inject_one_warning() {
    let same = || ToolCall::new("c", "list_dir", r#"{"path": "."}"#);
    let reordered = || ToolCall::new("c", "list_dir", r#"{ "path":"." }"#);
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(call_response("", vec![reordered()])),
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(text_response("giving up")),
    ]);
    let mut h = fixture(unrestricted().with_repetition_threshold(2), model);

    let result = h.session.run_turn("loop").await.unwrap();

    assert_eq!(result.status, TurnStatus::Ok);
    let warnings: Vec<&Message> = h
        .session
        .history()
        .iter()
        .skip(1)
        .filter(|m| m.role == MessageRole::System)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].text(), repetition_warning("list_dir", 2));
}

fn system_messages_after_prompt(history: &[Message]) -> usize {
    history
        .iter()
        .skip(1)
        .filter(|m| m.role == MessageRole::System)
        .count()
}

#[tokio::test]
async fn protocol_violation_ends_the_repetition_streak() {
    let same = || ToolCall::new("c", "list_dir", r#"{"path": "."}"#);
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(text_response(r#"{"tool": "list_dir", "input": {"path": "."}}"#)),
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(text_response("done")),
    ]);
    let mut h = fixture(unrestricted().with_repetition_threshold(3), model);

    let first = h.session.run_turn("list").await.unwrap();
    assert_eq!(first.status, TurnStatus::Error);
    let second = h.session.run_turn("list again").await.unwrap();

    assert_eq!(second.status, TurnStatus::Ok);
    assert_eq!(h.runs.load(Ordering::SeqCst), 3);
    assert_eq!(system_messages_after_prompt(h.session.history()), 0);
}

#[tokio::test]
async fn model_failure_ends_the_repetition_streak() {
    let same = || ToolCall::new("c", "list_dir", r#"{"path": "."}"#);
    let model = ScriptedModel::new(vec![
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(call_response("", vec![same()])),
        Reply::Fail(ModelError::Http {
            status: 400,
            body: "bad request".into(),
        }),
        Reply::Respond(call_response("", vec![same()])),
        Reply::Respond(text_response("done")),
    ]);
    let mut h = fixture(unrestricted().with_repetition_threshold(3), model);

    let first = h.session.run_turn("list").await.unwrap();
    assert_eq!(first.status, TurnStatus::Error);
    h.session.run_turn("list again").await.unwrap();

    assert_eq!(system_messages_after_prompt(h.session.history()), 0);
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn closed_session_rejects_turns() {
    let mut h = fixture(unrestricted(), ScriptedModel::new(vec![]));

    h.session.close();
    h.session.close();

    assert!(h.session.is_closed());
    assert!(matches!(
        h.session.run_turn("hi").await,
        Err(Error::SessionClosed)
    ));
    assert_eq!(h.sink.kinds(), vec!["session_end"]);
}

#[tokio::test]
async fn usage_accumulates_across_turns() {
    let model = ScriptedModel::new(vec![
        Reply::Respond(text_response("first")),
        Reply::Respond(text_response("second")),
    ]);
    let mut h = fixture(unrestricted(), model);

    let a = h.session.run_turn("one").await.unwrap();
    let b = h.session.run_turn("two").await.unwrap();

    assert_eq!(h.session.turn_count(), 2);
    assert_eq!(b.turn, 2);
    let total = h.session.usage();
    assert_eq!(
        total.prompt_tokens,
        a.usage.prompt_tokens + b.usage.prompt_tokens
    );
    assert!(b.usage.prompt_tokens > a.usage.prompt_tokens);
}
