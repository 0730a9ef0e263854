//! Terminal coding agent driven by the turnkey-rs turn scheduler.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Interactive REPL with shell tools and a history log
//! turnkey --tools tools.json --history session.jsonl
//!
//! # One-shot (batch) mode; exits non-zero unless the turn ends `ok`
//! turnkey --prompt "List the files in src/" --tools tools.json --tool-mode unrestricted
//!
//! # Load settings from a file, override the window
//! turnkey --config turnkey.json --context-window 64000 --compact-threshold 70
//! ```
//!
//! REPL commands: `/compact`, `/tools`, `/quit`. Ctrl-C cancels the running
//! turn.

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use turnkey_rs::prelude::*;

/// Terminal coding agent driven by the turnkey-rs turn scheduler.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "turnkey")]
struct Cli {
    // ── Configuration ──────────────────────────────────────────
    /// JSON file with session settings (see SessionConfig)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model to use
    #[arg(long)]
    model: Option<String>,

    /// System prompt
    #[arg(long)]
    system: Option<String>,

    /// Context window in tokens
    #[arg(long)]
    context_window: Option<usize>,

    /// Percent of the context window that triggers auto-compaction (1-100)
    #[arg(long)]
    compact_threshold: Option<u8>,

    /// Turn off auto-compaction
    #[arg(long)]
    no_auto_compact: bool,

    // ── Tools ──────────────────────────────────────────────────
    /// JSON file with tool definitions and shell command templates
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Tool mode: disabled, approval_required, or unrestricted
    #[arg(long)]
    tool_mode: Option<ToolMode>,

    /// Tool that always needs approval (repeatable)
    #[arg(long = "dangerous")]
    dangerous: Vec<String>,

    // ── Session ────────────────────────────────────────────────
    /// Append every history event to this JSONL file
    #[arg(long)]
    history: Option<PathBuf>,

    /// Run one turn with this input and exit (batch mode)
    #[arg(long)]
    prompt: Option<String>,

    /// More logging (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Terminal hooks: stream text to stdout, ask for approvals on stderr.
struct CliHooks {
    interactive: bool,
}

impl LifecycleHooks for CliHooks {
    fn on_text_delta(&self, delta: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(delta.as_bytes());
        let _ = out.flush();
    }

    fn on_action(&self, action: &ToolAction, _mode: ExecutionMode) {
        eprintln!("\n  [tool] {}({})", action.tool, preview(&action.input, 120));
    }

    fn on_observation(&self, result: &ToolActionResult, _mode: ExecutionMode) {
        let label = match result.error_kind {
            None => "ok".to_string(),
            Some(kind) => format!("{kind:?}").to_lowercase(),
        };
        eprintln!("  [{label}] {}", preview(&result.observation, 200));
    }

    fn on_context_compacted(&self, result: &CompactResult) {
        eprintln!(
            "  [compact] {:?}: {} -> {} tokens",
            result.status, result.before_tokens, result.after_tokens
        );
    }

    fn on_approval_request(&self, action: &ToolAction) -> ApprovalDecision {
        if !self.interactive {
            tracing::warn!("No one to approve '{}' in batch mode; denying", action.tool);
            return ApprovalDecision::Deny;
        }
        let stdin = io::stdin();
        loop {
            eprint!(
                "  Allow {}({})? [y]es / [n]o / [a]lways: ",
                action.tool,
                preview(&action.input, 80)
            );
            let _ = io::stderr().flush();
            let mut answer = String::new();
            match stdin.lock().read_line(&mut answer) {
                Ok(0) | Err(_) => return ApprovalDecision::Deny,
                Ok(_) => {}
            }
            match answer.trim().to_lowercase().as_str() {
                "y" | "yes" => return ApprovalDecision::AllowOnce,
                "a" | "always" => return ApprovalDecision::AllowAlways,
                "n" | "no" => return ApprovalDecision::Deny,
                _ => continue,
            }
        }
    }
}

fn preview(s: &str, max: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let head: String = flat.chars().take(max).collect();
        format!("{head}…")
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn build_config(cli: &Cli) -> turnkey_rs::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(system) = &cli.system {
        config.system_prompt = system.clone();
    }
    if let Some(window) = cli.context_window {
        config = config.with_context_window(window);
    }
    if let Some(percent) = cli.compact_threshold {
        config = config.with_compact_threshold(percent);
    }
    if cli.no_auto_compact {
        config.auto_compact.enabled = false;
    }
    if let Some(mode) = cli.tool_mode {
        config.permission.mode = mode;
    }
    for name in &cli.dangerous {
        config.permission.dangerous.insert(name.clone());
    }
    config.mode = if cli.prompt.is_some() {
        SessionMode::Batch
    } else {
        SessionMode::Interactive
    };
    config.validate()?;
    Ok(config)
}

fn build_session(cli: &Cli, config: SessionConfig) -> turnkey_rs::Result<Session> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| Error::Config("OPENROUTER_KEY environment variable is not set".into()))?;
    let client = OpenRouterClient::new(api_key, &config.model)?
        .with_headers("https://crates.io/crates/turnkey-rs", "turnkey")
        .with_retry(config.retry.clone());

    let tools = match &cli.tools {
        Some(path) => load_shell_tools(path)?,
        None => ToolSet::new(),
    };
    let counter = CharEstimateCounter::new(&config.model);
    let interactive = config.mode == SessionMode::Interactive;

    let mut session = Session::new(config, Box::new(client), Box::new(tools), Box::new(counter))
        .with_hooks(Box::new(CliHooks { interactive }))
        .with_sink(Box::new(LoggingSink));
    if let Some(path) = &cli.history {
        session = session.with_sink(Box::new(JsonlSink::open(path)?));
    }
    Ok(session)
}

fn report(result: &TurnResult) {
    println!();
    match result.status {
        TurnStatus::Ok => {}
        status => eprintln!(
            "  [{status}] {}",
            result.error.as_deref().unwrap_or(&result.final_text)
        ),
    }
    eprintln!(
        "  ({} step(s), {}, {:.1}s)",
        result.steps.len(),
        result.usage,
        result.duration.as_secs_f64()
    );
}

async fn run_batch(session: &mut Session, prompt: &str) -> turnkey_rs::Result<TurnStatus> {
    let result = session.run_turn(prompt).await?;
    report(&result);
    Ok(result.status)
}

async fn run_repl(session: &mut Session) -> turnkey_rs::Result<()> {
    let handle = session.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if handle.cancel() {
                eprintln!("\n  Cancelling...");
            }
        }
    });

    let stdin = io::stdin();
    loop {
        eprint!("> ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/tools" => {
                let names = session.list_tool_names();
                if names.is_empty() {
                    eprintln!("  (no tools)");
                }
                for name in names {
                    eprintln!("  {name}");
                }
            }
            "/compact" => {
                let result = session.compact_history(CompactReason::Manual).await;
                if let Some(error) = &result.error {
                    eprintln!("  compaction {:?}: {error}", result.status);
                }
            }
            input => {
                let result = session.run_turn(input).await?;
                report(&result);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };
    let mut session = match build_session(&cli, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let code = match &cli.prompt {
        Some(prompt) => match run_batch(&mut session, prompt).await {
            Ok(TurnStatus::Ok) => 0,
            Ok(_) => 1,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        None => match run_repl(&mut session).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
    };

    session.close();
    process::exit(code);
}
