//! The [`Session`]: one conversation and everything it owns.
//!
//! A session holds the message history, the model client, the tool engine,
//! the token accountant, and the event emitter. Callers drive it one turn at
//! a time with [`run_turn`](Session::run_turn) (implemented in
//! [`turn`](super::turn)), compact on demand with
//! [`compact_history`](Session::compact_history), and finish with
//! [`close`](Session::close).

use crate::Message;
use crate::MessageRole;
use crate::agent::config::{SessionConfig, SessionMode};
use crate::agent::events::{EventEmitter, HistorySink};
use crate::agent::guard::RepetitionGuard;
use crate::agent::hooks::{LifecycleHooks, NoopHooks};
use crate::api::ModelClient;
use crate::context::compactor::{CompactReason, CompactResult, Compactor, auto_compact_threshold};
use crate::context::tokens::{TokenAccountant, TokenCounter, TokenUsage};
use crate::tools::orchestrator::ToolOrchestrator;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Generate a unique session ID.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ses-{ts:x}-{count:04x}")
}

// ── Cancellation ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CancelState {
    token: Mutex<Option<CancellationToken>>,
    cancelling: AtomicBool,
}

/// Cancels the in-flight turn of a [`Session`] from another task.
///
/// ```ignore
/// let handle = session.cancel_handle();
/// tokio::spawn(async move {
///     while tokio::signal::ctrl_c().await.is_ok() {
///         handle.cancel();
///     }
/// });
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancel the in-flight turn. Returns `false` when no turn is running.
    pub fn cancel(&self) -> bool {
        let token = self.lock().clone();
        match token {
            Some(token) => {
                self.state.cancelling.store(true, Ordering::SeqCst);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether [`cancel`](Self::cancel) was called during the current turn.
    pub fn is_cancelling(&self) -> bool {
        self.state.cancelling.load(Ordering::SeqCst)
    }

    /// Install a fresh token for a new turn.
    pub(crate) fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock() = Some(token.clone());
        self.state.cancelling.store(false, Ordering::SeqCst);
        token
    }

    pub(crate) fn clear(&self) {
        *self.lock() = None;
        self.state.cancelling.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.state.token.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Session ────────────────────────────────────────────────────────

/// One conversation.
///
/// Only one turn may run at a time; `run_turn` takes `&mut self`, so the
/// borrow checker enforces it.
pub struct Session {
    pub(crate) id: String,
    pub(crate) config: SessionConfig,
    pub(crate) model: Box<dyn ModelClient>,
    pub(crate) tools: Arc<dyn ToolOrchestrator>,
    pub(crate) accountant: TokenAccountant,
    pub(crate) emitter: EventEmitter,
    pub(crate) history: Vec<Message>,
    pub(crate) title: Option<String>,
    pub(crate) turn_count: u32,
    pub(crate) started: bool,
    pub(crate) closed: bool,
    pub(crate) guard: RepetitionGuard,
    /// Protocol violations across the whole session.
    pub(crate) violation_count: u32,
    pub(crate) cancel: CancelHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.model.model())
            .field("mode", &self.config.mode)
            .field("messages", &self.history.len())
            .field("turns", &self.turn_count)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    /// Create a session. The system prompt (if any) becomes `history[0]`.
    pub fn new(
        config: SessionConfig,
        model: Box<dyn ModelClient>,
        tools: Box<dyn ToolOrchestrator>,
        counter: Box<dyn TokenCounter>,
    ) -> Self {
        let id = generate_session_id();
        let history = if config.system_prompt.is_empty() {
            Vec::new()
        } else {
            vec![Message::system(&config.system_prompt)]
        };
        Self {
            emitter: EventEmitter::new(&id, Box::new(NoopHooks)),
            guard: RepetitionGuard::new(config.repetition_threshold),
            accountant: TokenAccountant::new(counter),
            tools: Arc::from(tools),
            id,
            config,
            model,
            history,
            title: None,
            turn_count: 0,
            started: false,
            closed: false,
            violation_count: 0,
            cancel: CancelHandle::default(),
        }
    }

    /// Register a history sink (builder pattern).
    pub fn with_sink(self, sink: Box<dyn HistorySink>) -> Self {
        self.emitter.add_sink(sink);
        self
    }

    /// Replace the lifecycle hooks (builder pattern).
    pub fn with_hooks(mut self, hooks: Box<dyn LifecycleHooks>) -> Self {
        self.emitter.set_hooks(hooks);
        self
    }

    /// Use a caller-chosen session ID (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.emitter.set_session_id(&self.id);
        self
    }

    // ── Accessors ──

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Title derived from the first turn's input.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Cumulative token usage across all turns.
    pub fn usage(&self) -> TokenUsage {
        self.accountant.session()
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current prompt size of the history.
    pub fn prompt_tokens(&self) -> usize {
        self.accountant.prompt_tokens(&self.history)
    }

    /// Auto-compact trigger point, or `None` when auto-compaction is off.
    pub fn auto_compact_threshold(&self) -> Option<usize> {
        self.config
            .auto_compact
            .active()
            .map(|c| auto_compact_threshold(self.config.context_window, c.threshold_percent))
    }

    // ── Operations ──

    /// Registered tool names, sorted.
    pub fn list_tool_names(&self) -> Vec<String> {
        self.tools.tool_names()
    }

    /// A handle that cancels the in-flight turn from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the in-flight turn. Returns `false` when no turn is running.
    pub fn cancel_current_turn(&self) -> bool {
        self.cancel.cancel()
    }

    /// Summarize the history now.
    ///
    /// Runs under its own cancellation token, so a
    /// [`CancelHandle`] can interrupt it like a turn.
    pub async fn compact_history(&mut self, reason: CompactReason) -> CompactResult {
        let token = self.cancel.begin();
        let result = self.compact_with(reason, &token).await;
        self.cancel.clear();
        result
    }

    /// Run one compaction and record it.
    pub(crate) async fn compact_with(
        &mut self,
        reason: CompactReason,
        cancel: &CancellationToken,
    ) -> CompactResult {
        let compactor = Compactor {
            model: self.model.as_ref(),
            counter: self.accountant.counter(),
            config: &self.config.auto_compact.config,
            threshold: auto_compact_threshold(
                self.config.context_window,
                self.config.auto_compact.config.threshold_percent,
            ),
        };
        let result = compactor.compact(&mut self.history, reason, cancel).await;
        self.emitter.context_compacted(&result);
        result
    }

    /// Flush and close sinks, release approvals, dispose the tool engine and
    /// token counter. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.clear();
        self.emitter.close_turn();
        let usage = self.accountant.session();
        self.emitter.session_end(self.turn_count, usage);
        self.emitter.close();
        self.tools.clear_once_approvals();
        self.tools.dispose();
        self.accountant.dispose();
        info!(
            "Session {} closed after {} turn(s): {usage}",
            self.id, self.turn_count
        );
        debug!(
            "Session {} final history: {} message(s), system prompt {}",
            self.id,
            self.history.len(),
            if self.history.first().is_some_and(|m| m.role == MessageRole::System) {
                "kept"
            } else {
                "absent"
            }
        );
    }
}
