//! Tool abstraction and the default tool engine.
//!
//! The [`Tool`] trait defines what every tool provides: a static API
//! definition (name, description, JSON schema) and an async `execute` method.
//! Tools are collected into a [`ToolSet`], which implements
//! [`ToolOrchestrator`]: permission checks and approval grants, argument
//! validation, timeouts, cancellation, and result truncation.

use super::orchestrator::{
    ApprovalDecision, ExecutionContext, ToolAction, ToolActionFuture, ToolActionResult,
    ToolCapabilities, ToolErrorKind, ToolOrchestrator,
};
use crate::ToolDef;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that the model can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct ListDir { root: PathBuf }
///
/// impl Tool for ListDir {
///     fn definition(&self) -> ToolDef { /* ... */ }
///
///     fn execute(&self, arguments: &str) -> ToolFuture<'_> {
///         let arguments = arguments.to_string();
///         Box::pin(async move {
///             // parse args, list the directory, return one entry per line
///             todo!()
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given raw JSON arguments string.
    ///
    /// Errors are returned as `"Error: ..."` strings rather than panicking;
    /// the engine reports them as failed results and the model sees the text.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    /// The tool's name (convenience, delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name
    }

    /// Whether this tool changes external state. Mutating tools force
    /// sequential execution of any batch they appear in.
    fn is_mutation(&self) -> bool {
        false
    }

    /// Whether this tool may run concurrently with other calls.
    fn supports_parallel(&self) -> bool {
        true
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools dispatched by name, and the default
/// [`ToolOrchestrator`].
///
/// # Example
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_max_result_bytes(15_000)
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(ListDir::new("."))
///     .with_if(allow_writes, WriteFile::new("."));
/// ```
pub struct ToolSet {
    tools: BTreeMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    /// Whether to validate tool arguments against JSON Schema before execution.
    validate_args: bool,
    /// Timeout for tool execution. `None` disables timeouts.
    default_timeout: Option<Duration>,
    /// Tools approved until the end of the current turn.
    once_grants: Mutex<HashSet<String>>,
    /// Tools approved for the rest of the session.
    always_grants: Mutex<HashSet<String>>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .field("validate_args", &self.validate_args)
            .finish()
    }
}

impl ToolSet {
    /// Create an empty tool set.
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: false,
            default_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            once_grants: Mutex::new(HashSet::new()),
            always_grants: Mutex::new(HashSet::new()),
        }
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Enable JSON Schema argument validation before tool execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Set the execution timeout. Pass `None` to disable timeouts.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether `tool` is approved for this turn or the session.
    fn is_granted(&self, tool: &str) -> bool {
        lock(&self.always_grants).contains(tool) || lock(&self.once_grants).contains(tool)
    }

    fn record_grant(&self, tool: &str, decision: ApprovalDecision) {
        match decision {
            ApprovalDecision::AllowOnce => {
                lock(&self.once_grants).insert(tool.to_string());
            }
            ApprovalDecision::AllowAlways => {
                lock(&self.always_grants).insert(tool.to_string());
            }
            ApprovalDecision::Deny => {}
        }
    }

    /// Run an approved action: validation, timeout, cancellation, truncation.
    async fn run_tool(
        &self,
        tool: &dyn Tool,
        action: &ToolAction,
        ctx: ExecutionContext<'_>,
    ) -> ToolActionResult {
        let name = action.tool.as_str();
        let start = Instant::now();

        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool, &action.input)
        {
            return ToolActionResult::error(
                action,
                ToolErrorKind::InvalidArguments,
                error,
                start.elapsed(),
            );
        }

        log_tool_call(name, &action.input);

        let run = async {
            match self.default_timeout {
                Some(limit) => tokio::time::timeout(limit, tool.execute(&action.input))
                    .await
                    .map_err(|_| limit),
                None => Ok(tool.execute(&action.input).await),
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            outcome = run => Some(outcome),
        };
        let elapsed = start.elapsed();

        let output = match outcome {
            None => {
                info!("Tool {name} cancelled after {:.1}s", elapsed.as_secs_f64());
                return ToolActionResult::error(
                    action,
                    ToolErrorKind::Cancelled,
                    format!("Error: tool '{name}' was cancelled."),
                    elapsed,
                );
            }
            Some(Err(limit)) => {
                info!(
                    "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                    elapsed.as_secs_f64(),
                    limit.as_secs_f64(),
                );
                return ToolActionResult::error(
                    action,
                    ToolErrorKind::Timeout,
                    format!(
                        "Error: tool '{name}' timed out after {:.0} seconds. \
                         Consider breaking the task into smaller steps or using \
                         different arguments.",
                        limit.as_secs_f64(),
                    ),
                    elapsed,
                );
            }
            Some(Ok(output)) => output,
        };

        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            elapsed.as_secs_f64() * 1000.0,
            output.len()
        );
        trace!("Tool {name} result preview: {}", preview(&output, 300));

        let output = truncate_result(output, self.max_result_bytes);
        if output.starts_with("Error") {
            ToolActionResult::error(action, ToolErrorKind::Failed, output, elapsed)
        } else {
            ToolActionResult::success(action, output, elapsed)
        }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolOrchestrator for ToolSet {
    fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    fn capabilities(&self, tool: &str) -> Option<ToolCapabilities> {
        self.tools.get(tool).map(|t| ToolCapabilities {
            parallel: t.supports_parallel(),
            mutating: t.is_mutation(),
        })
    }

    fn execute_action<'a>(
        &'a self,
        action: &'a ToolAction,
        ctx: ExecutionContext<'a>,
    ) -> ToolActionFuture<'a> {
        Box::pin(async move {
            let Some(tool) = self.tools.get(&action.tool) else {
                return ToolActionResult::error(
                    action,
                    ToolErrorKind::UnknownTool,
                    format!("Error: unknown tool '{}'", action.tool),
                    Duration::ZERO,
                );
            };

            if !ctx.policy.tools_enabled() {
                return ToolActionResult::error(
                    action,
                    ToolErrorKind::Disabled,
                    format!("Error: tool execution is disabled; '{}' was not run.", action.tool),
                    Duration::ZERO,
                );
            }

            if ctx.policy.requires_approval(&action.tool) && !self.is_granted(&action.tool) {
                let decision = ctx.approval.request_approval(action);
                debug!("Approval for {}: {decision:?}", action.tool);
                if !decision.is_allowed() {
                    return ToolActionResult::rejected(action);
                }
                self.record_grant(&action.tool, decision);
            }

            self.run_tool(tool.as_ref(), action, ctx).await
        })
    }

    fn clear_once_approvals(&self) {
        lock(&self.once_grants).clear();
    }

    fn dispose(&self) {
        lock(&self.once_grants).clear();
        lock(&self.always_grants).clear();
    }
}

/// Lock a grant set, recovering from poisoning (the sets hold no invariants).
fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct ListDirArgs {
///     /// Directory to list.
///     path: String,
/// }
///
/// let tool = FnTool::new(
///     ToolDef::new("list_dir", "List a directory", json_schema_for::<ListDirArgs>()),
///     |args: ListDirArgs| async move { format!("listing {}", args.path) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    mutation: bool,
    parallel: bool,
}

impl FnTool {
    /// Create a new closure-based tool. Arguments are deserialized into `A`;
    /// parse failures are returned to the model as an error string.
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        let erased = move |raw: String| -> Pin<Box<dyn Future<Output = String> + Send>> {
            match serde_json::from_str::<A>(&raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => Box::pin(async move {
                    format!(
                        "Error: invalid tool arguments: {e}. \
                         Please provide valid JSON matching the tool's parameter schema."
                    )
                }),
            }
        };

        Self {
            def,
            handler: Box::new(erased),
            mutation: false,
            parallel: true,
        }
    }

    /// Mark this tool as a mutation (builder pattern).
    pub fn mutation(mut self, is_mutation: bool) -> Self {
        self.mutation = is_mutation;
        self
    }

    /// Declare whether the tool may run in parallel batches (builder pattern).
    pub fn parallel(mut self, supports_parallel: bool) -> Self {
        self.parallel = supports_parallel;
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (self.handler)(arguments.to_string())
    }

    fn is_mutation(&self) -> bool {
        self.mutation
    }

    fn supports_parallel(&self) -> bool {
        self.parallel
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .field("mutation", &self.mutation)
            .field("parallel", &self.parallel)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// Returns `None` if valid, or `Some(error_string)` formatted for the model
/// to self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Option<String> {
    let args_value: serde_json::Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Some(format!(
                "Error: invalid JSON arguments for tool '{}': {e}. \
                 Please provide valid JSON matching the tool's parameter schema.",
                tool.name()
            ));
        }
    };

    let schema = tool.definition().function.parameters;
    // An invalid schema is the tool author's problem; skip validation.
    let validator = jsonschema::validator_for(&schema).ok()?;

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Largest prefix of `s` that is at most `max` bytes and ends on a char boundary.
fn preview(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default()
}

/// Truncate a string to at most `max` bytes, appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() > max {
        format!("{}...\n[truncated: {} bytes total]", preview(&s, max), s.len())
    } else {
        s
    }
}
