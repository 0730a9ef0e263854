//! History events, sinks, and the emitter that fans them out.
//!
//! Every lifecycle moment of a session becomes one immutable
//! [`HistoryEvent`]: a timestamped envelope around a closed
//! [`EventPayload`] sum type. The [`EventEmitter`] stamps events with the
//! open turn/step, writes them to every registered [`HistorySink`], and
//! invokes the matching [`LifecycleHooks`] callback with a typed payload.
//!
//! # Choosing a sink
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`JsonlSink`] | Replayable on-disk log, one JSON object per line |
//! | [`MemorySink`] | Tests and embedders that inspect events in-process |
//! | [`LoggingSink`] | Structured logging via `tracing` |
//! | Custom `impl HistorySink` | Databases, network forwarders |

use crate::MessageRole;
use crate::agent::config::SessionMode;
use crate::agent::hooks::LifecycleHooks;
use crate::agent::turn::{TurnResult, TurnStatus};
use crate::context::compactor::{CompactReason, CompactResult, CompactStatus};
use crate::context::tokens::TokenUsage;
use crate::tools::orchestrator::{
    ApprovalDecision, ApprovalHandler, ExecutionMode, ToolAction, ToolActionResult, ToolErrorKind,
    ToolStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// When a `context_usage` reading was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPhase {
    TurnStart,
    StepStart,
    PostCompact,
}

impl std::fmt::Display for ContextPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextPhase::TurnStart => write!(f, "turn_start"),
            ContextPhase::StepStart => write!(f, "step_start"),
            ContextPhase::PostCompact => write!(f, "post_compact"),
        }
    }
}

/// Kind-specific fields of a [`HistoryEvent`], tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart {
        model: String,
        mode: SessionMode,
    },
    SessionTitle {
        title: String,
    },
    TurnStart {
        input: String,
    },
    ContextUsage {
        phase: ContextPhase,
        prompt_tokens: usize,
        context_window: usize,
        /// Auto-compact trigger point, when auto-compaction is enabled.
        threshold: Option<usize>,
    },
    ContextCompacted {
        reason: CompactReason,
        status: CompactStatus,
        before: usize,
        after: usize,
        threshold: usize,
        reduction_pct: f64,
        error: Option<String>,
    },
    Assistant {
        has_tool_calls: bool,
        protocol_violation: bool,
        violation_count: u32,
    },
    Action {
        action_id: String,
        tool: String,
        input: String,
        mode: ExecutionMode,
    },
    Observation {
        action_id: String,
        tool: String,
        status: ToolStatus,
        error_kind: Option<ToolErrorKind>,
        duration_ms: u64,
        rejected: bool,
        mode: ExecutionMode,
    },
    ApprovalRequest {
        tool: String,
        input: String,
    },
    ApprovalResponse {
        tool: String,
        decision: ApprovalDecision,
    },
    Final {
        status: TurnStatus,
        violation_count: u32,
    },
    TurnEnd {
        status: TurnStatus,
        steps: usize,
        duration_ms: u64,
        usage: TokenUsage,
    },
    SessionEnd {
        turns: u32,
        usage: TokenUsage,
    },
}

impl EventPayload {
    /// The `"type"` tag this payload serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionStart { .. } => "session_start",
            EventPayload::SessionTitle { .. } => "session_title",
            EventPayload::TurnStart { .. } => "turn_start",
            EventPayload::ContextUsage { .. } => "context_usage",
            EventPayload::ContextCompacted { .. } => "context_compacted",
            EventPayload::Assistant { .. } => "assistant",
            EventPayload::Action { .. } => "action",
            EventPayload::Observation { .. } => "observation",
            EventPayload::ApprovalRequest { .. } => "approval_request",
            EventPayload::ApprovalResponse { .. } => "approval_response",
            EventPayload::Final { .. } => "final",
            EventPayload::TurnEnd { .. } => "turn_end",
            EventPayload::SessionEnd { .. } => "session_end",
        }
    }
}

/// One immutable, append-only history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Error type returned by sinks. Sink failures are logged, never fatal.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Append-only destination for [`HistoryEvent`]s.
pub trait HistorySink: Send {
    fn write(&mut self, event: &HistoryEvent) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once at session close. Defaults to a flush.
    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl HistorySink for JsonlSink {
    fn write(&mut self, event: &HistoryEvent) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects events into a shared vector.
///
/// Clones share the same storage, so a test can keep one handle and give the
/// other to a session.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<HistoryEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn events(&self) -> Vec<HistoryEvent> {
        self.lock().clone()
    }

    /// The `"type"` tags written so far, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.lock().iter().map(|e| e.payload.kind()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HistorySink for MemorySink {
    fn write(&mut self, event: &HistoryEvent) -> Result<(), SinkError> {
        self.lock().push(event.clone());
        Ok(())
    }
}

/// Renders events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl HistorySink for LoggingSink {
    fn write(&mut self, event: &HistoryEvent) -> Result<(), SinkError> {
        let turn = event.turn.unwrap_or(0);
        let step = event.step.unwrap_or(0);
        match &event.payload {
            EventPayload::SessionStart { model, mode } => {
                info!("Session {} started ({mode}, model {model})", event.session_id);
            }
            EventPayload::SessionTitle { title } => {
                debug!("Session title: {title}");
            }
            EventPayload::TurnStart { input } => {
                let preview: String = input.chars().take(120).collect();
                info!("[turn {turn}] {preview}");
            }
            EventPayload::ContextUsage {
                phase,
                prompt_tokens,
                context_window,
                threshold,
            } => {
                debug!(
                    "[turn {turn}.{step}] context ({phase}): {prompt_tokens}/{context_window} tokens{}",
                    threshold.map_or(String::new(), |t| format!(", compact at {t}"))
                );
            }
            EventPayload::ContextCompacted {
                reason,
                status,
                before,
                after,
                reduction_pct,
                error,
                ..
            } => match error {
                Some(error) => warn!("Compaction ({reason:?}) {status:?}: {error}"),
                None => info!(
                    "Compaction ({reason:?}) {status:?}: {before} -> {after} tokens ({reduction_pct:.1}%)"
                ),
            },
            EventPayload::Assistant {
                has_tool_calls,
                protocol_violation,
                violation_count,
            } => {
                if *protocol_violation {
                    warn!("[turn {turn}.{step}] protocol violation #{violation_count}");
                } else {
                    let preview: String = event.content.chars().take(200).collect();
                    debug!(
                        "[turn {turn}.{step}] assistant{}: {preview}",
                        if *has_tool_calls { " (tool calls)" } else { "" }
                    );
                }
            }
            EventPayload::Action { tool, mode, .. } => {
                debug!("[turn {turn}.{step}] action {tool} ({mode})");
            }
            EventPayload::Observation {
                tool,
                status,
                duration_ms,
                rejected,
                ..
            } => {
                debug!(
                    "[turn {turn}.{step}] observation {tool}: {status:?} in {duration_ms}ms{}",
                    if *rejected { " (rejected)" } else { "" }
                );
                trace!("Observation {tool}: {} bytes", event.content.len());
            }
            EventPayload::ApprovalRequest { tool, .. } => {
                debug!("Approval requested for {tool}");
            }
            EventPayload::ApprovalResponse { tool, decision } => {
                debug!("Approval for {tool}: {decision:?}");
            }
            EventPayload::Final { status, .. } => {
                debug!("[turn {turn}] final ({status})");
            }
            EventPayload::TurnEnd {
                status,
                steps,
                duration_ms,
                usage,
            } => {
                info!("[turn {turn}] {status} after {steps} step(s), {duration_ms}ms, {usage}");
            }
            EventPayload::SessionEnd { turns, usage } => {
                info!("Session {} closed after {turns} turn(s), {usage}", event.session_id);
            }
        }
        Ok(())
    }
}

// ── Emitter ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    turn: Option<u32>,
    step: Option<u32>,
}

/// Fans lifecycle moments out to sinks and hooks.
///
/// `turn` and `step` on every event come from the emitter's cursor, which the
/// scheduler opens and closes around each turn and step.
pub struct EventEmitter {
    session_id: String,
    sinks: Mutex<Vec<Box<dyn HistorySink>>>,
    hooks: Box<dyn LifecycleHooks>,
    cursor: Mutex<Cursor>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("session_id", &self.session_id)
            .field("sinks", &self.lock_sinks().len())
            .field("cursor", &self.cursor())
            .finish()
    }
}

impl EventEmitter {
    pub fn new(session_id: impl Into<String>, hooks: Box<dyn LifecycleHooks>) -> Self {
        Self {
            session_id: session_id.into(),
            sinks: Mutex::new(Vec::new()),
            hooks,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn HistorySink>) {
        self.lock_sinks().push(sink);
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn LifecycleHooks>) {
        self.hooks = hooks;
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    pub fn hooks(&self) -> &dyn LifecycleHooks {
        self.hooks.as_ref()
    }

    // ── Cursor ──

    pub fn open_turn(&self, turn: u32) {
        *self.lock_cursor() = Cursor {
            turn: Some(turn),
            step: None,
        };
    }

    /// Open a step within the current turn. No-op outside a turn.
    pub fn open_step(&self, step: u32) {
        let mut cursor = self.lock_cursor();
        if cursor.turn.is_some() {
            cursor.step = Some(step);
        }
    }

    /// Close the step, keeping the turn open for turn-level events.
    pub fn close_step(&self) {
        self.lock_cursor().step = None;
    }

    pub fn close_turn(&self) {
        *self.lock_cursor() = Cursor::default();
    }

    /// Current `(turn, step)`.
    pub fn cursor(&self) -> (Option<u32>, Option<u32>) {
        let cursor = *self.lock_cursor();
        (cursor.turn, cursor.step)
    }

    // ── Lifecycle moments ──

    pub fn session_start(&self, model: &str, mode: SessionMode) {
        self.record(
            EventPayload::SessionStart {
                model: model.to_string(),
                mode,
            },
            None,
            String::new(),
        );
        self.hooks.on_session_start(&self.session_id, model);
    }

    pub fn session_title(&self, title: &str) {
        self.record(
            EventPayload::SessionTitle {
                title: title.to_string(),
            },
            None,
            String::new(),
        );
        self.hooks.on_title_generated(title);
    }

    pub fn turn_start(&self, turn: u32, input: &str) {
        self.record(
            EventPayload::TurnStart {
                input: input.to_string(),
            },
            Some(MessageRole::User),
            input.to_string(),
        );
        self.hooks.on_turn_start(turn, input);
    }

    pub fn context_usage(
        &self,
        phase: ContextPhase,
        prompt_tokens: usize,
        context_window: usize,
        threshold: Option<usize>,
    ) {
        self.record(
            EventPayload::ContextUsage {
                phase,
                prompt_tokens,
                context_window,
                threshold,
            },
            None,
            String::new(),
        );
        self.hooks.on_context_usage(phase, prompt_tokens, context_window);
    }

    pub fn context_compacted(&self, result: &CompactResult) {
        self.record(
            EventPayload::ContextCompacted {
                reason: result.reason,
                status: result.status,
                before: result.before_tokens,
                after: result.after_tokens,
                threshold: result.threshold,
                reduction_pct: result.reduction_pct,
                error: result.error.clone(),
            },
            None,
            result.summary.clone().unwrap_or_default(),
        );
        self.hooks.on_context_compacted(result);
    }

    pub fn text_delta(&self, delta: &str) {
        self.hooks.on_text_delta(delta);
    }

    pub fn assistant(
        &self,
        text: &str,
        has_tool_calls: bool,
        protocol_violation: bool,
        violation_count: u32,
    ) {
        self.record(
            EventPayload::Assistant {
                has_tool_calls,
                protocol_violation,
                violation_count,
            },
            Some(MessageRole::Assistant),
            text.to_string(),
        );
    }

    pub fn action(&self, action: &ToolAction, mode: ExecutionMode) {
        self.record(
            EventPayload::Action {
                action_id: action.id.clone(),
                tool: action.tool.clone(),
                input: action.input.clone(),
                mode,
            },
            Some(MessageRole::Assistant),
            String::new(),
        );
        self.hooks.on_action(action, mode);
    }

    pub fn observation(&self, result: &ToolActionResult, mode: ExecutionMode) {
        self.record(
            EventPayload::Observation {
                action_id: result.action_id.clone(),
                tool: result.tool_name.clone(),
                status: result.status,
                error_kind: result.error_kind,
                duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                rejected: result.rejected,
                mode,
            },
            Some(MessageRole::Tool),
            result.observation.clone(),
        );
        self.hooks.on_observation(result, mode);
    }

    /// Ask the hooks for an approval decision, recording request and response.
    pub fn request_approval(&self, action: &ToolAction) -> ApprovalDecision {
        self.record(
            EventPayload::ApprovalRequest {
                tool: action.tool.clone(),
                input: action.input.clone(),
            },
            None,
            String::new(),
        );
        let decision = self.hooks.on_approval_request(action);
        self.record(
            EventPayload::ApprovalResponse {
                tool: action.tool.clone(),
                decision,
            },
            None,
            String::new(),
        );
        self.hooks.on_approval_response(action, decision);
        decision
    }

    pub fn final_answer(&self, status: TurnStatus, text: &str, violation_count: u32) {
        self.record(
            EventPayload::Final {
                status,
                violation_count,
            },
            Some(MessageRole::Assistant),
            text.to_string(),
        );
        self.hooks.on_final(status, text);
    }

    pub fn turn_end(&self, result: &TurnResult) {
        self.record(
            EventPayload::TurnEnd {
                status: result.status,
                steps: result.steps.len(),
                duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                usage: result.usage,
            },
            None,
            result.error.clone().unwrap_or_default(),
        );
        self.hooks.on_turn_end(result);
    }

    pub fn session_end(&self, turns: u32, usage: TokenUsage) {
        self.record(EventPayload::SessionEnd { turns, usage }, None, String::new());
    }

    /// Flush every sink. Failures are logged.
    pub fn flush(&self) {
        for sink in self.lock_sinks().iter_mut() {
            if let Err(e) = sink.flush() {
                warn!("History sink flush failed: {e}");
            }
        }
    }

    /// Close and drop every sink. Failures are logged.
    pub fn close(&self) {
        for mut sink in self.lock_sinks().drain(..) {
            if let Err(e) = sink.close() {
                warn!("History sink close failed: {e}");
            }
        }
    }

    /// Stamp `payload` with the cursor and write it to every sink.
    fn record(&self, payload: EventPayload, role: Option<MessageRole>, content: String) {
        let (turn, step) = self.cursor();
        let event = HistoryEvent {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            turn,
            step,
            role,
            content,
            payload,
        };
        for sink in self.lock_sinks().iter_mut() {
            if let Err(e) = sink.write(&event) {
                warn!("History sink write failed ({}): {e}", event.payload.kind());
            }
        }
    }

    fn lock_sinks(&self) -> MutexGuard<'_, Vec<Box<dyn HistorySink>>> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Routes tool-engine approval requests through the emitter.
pub struct EmitterApproval<'a>(pub &'a EventEmitter);

impl ApprovalHandler for EmitterApproval<'_> {
    fn request_approval(&self, action: &ToolAction) -> ApprovalDecision {
        self.0.request_approval(action)
    }
}
