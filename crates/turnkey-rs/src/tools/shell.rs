//! Tools defined in a JSON file and executed as shell commands.
//!
//! Each entry is an OpenAI-style tool definition plus an `execute` command
//! template whose `{{param}}` placeholders are filled from the call's
//! arguments:
//!
//! ```json
//! [
//!   {
//!     "type": "function",
//!     "function": {
//!       "name": "list_dir",
//!       "description": "List a directory",
//!       "parameters": {"type": "object", "properties": {"path": {"type": "string"}}}
//!     },
//!     "execute": "ls -1 {{path}}"
//!   }
//! ]
//! ```
//!
//! Optional `"mutating": true` and `"parallel": false` flags feed the
//! dispatcher's execution-mode choice.

use super::core::{Tool, ToolFuture, ToolSet};
use super::orchestrator::ToolOrchestrator;
use crate::error::{Error, Result};
use crate::{FunctionDef, ToolDef, ToolType};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^{}]*\}\}").expect("valid regex"));

static SPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("valid regex"));

fn default_parallel() -> bool {
    true
}

/// One entry of a tools file.
#[derive(Deserialize)]
struct ToolFileEntry {
    #[serde(rename = "type")]
    tool_type: ToolType,
    function: FunctionDef,
    /// Shell command template. Use {{param_name}} for argument substitution.
    execute: String,
    #[serde(default)]
    mutating: bool,
    #[serde(default = "default_parallel")]
    parallel: bool,
}

/// A tool that runs a rendered command with `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommandTool {
    def: ToolDef,
    template: String,
    mutating: bool,
    parallel: bool,
}

impl ShellCommandTool {
    pub fn new(def: ToolDef, template: impl Into<String>) -> Self {
        Self {
            def,
            template: template.into(),
            mutating: false,
            parallel: true,
        }
    }

    /// Mark this tool as a mutation (builder pattern).
    pub fn mutation(mut self, is_mutation: bool) -> Self {
        self.mutating = is_mutation;
        self
    }

    /// Declare whether the tool may run in parallel batches (builder pattern).
    pub fn parallel(mut self, supports_parallel: bool) -> Self {
        self.parallel = supports_parallel;
        self
    }
}

impl Tool for ShellCommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let name = self.def.function.name.clone();
        let cmd = render_command(&self.template, arguments);
        Box::pin(async move {
            debug!("[tool] {name}: {cmd}");

            let output = match tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .kill_on_drop(true)
                .output()
                .await
            {
                Ok(o) => o,
                Err(e) => return format!("Error executing tool '{name}': {e}"),
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                format!(
                    "Error: tool '{name}' exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    output.status
                )
            } else if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n\n[stderr]\n{stderr}")
            }
        })
    }

    fn is_mutation(&self) -> bool {
        self.mutating
    }

    fn supports_parallel(&self) -> bool {
        self.parallel
    }
}

/// Load a tools file into a [`ToolSet`].
pub fn load_shell_tools(path: impl AsRef<Path>) -> Result<ToolSet> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Tool(format!("failed to read tools file '{}': {e}", path.display())))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content).map_err(|e| {
        Error::Tool(format!("failed to parse tools file '{}': {e}", path.display()))
    })?;

    let mut set = ToolSet::new().with_arg_validation(true);
    for entry in entries {
        let name = entry.function.name.clone();
        if set.capabilities(&name).is_some() {
            return Err(Error::Tool(format!("duplicate tool '{name}' in '{}'", path.display())));
        }
        set.register(
            ShellCommandTool::new(
                ToolDef {
                    tool_type: entry.tool_type,
                    function: entry.function,
                },
                entry.execute,
            )
            .mutation(entry.mutating)
            .parallel(entry.parallel),
        );
    }
    Ok(set)
}

/// Substitute `{{param}}` placeholders, drop unfilled ones, and squeeze spaces.
pub fn render_command(template: &str, arguments_json: &str) -> String {
    let args: serde_json::Value = serde_json::from_str(arguments_json)
        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

    let mut cmd = template.to_string();
    if let Some(obj) = args.as_object() {
        for (key, value) in obj {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            cmd = cmd.replace(&placeholder, &replacement);
        }
    }

    let cmd = PLACEHOLDER.replace_all(&cmd, "");
    SPACE_RUN.replace_all(&cmd, " ").trim().to_string()
}
