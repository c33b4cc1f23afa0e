//! `session-governor` command line.
//!
//! Exit status tells a supervisor what to do next: [`EXIT_DRAINED`] means the
//! queue is empty, [`EXIT_CHECKPOINTED`] means work remains and the next
//! invocation resumes from the checkpoint, [`EXIT_FATAL`] means the session
//! could not run or could not persist its state.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use crate::builders::SessionBuilder;
use crate::config::{GovernorConfig, StopStrategy};
use crate::core::checkpoint::CheckpointManager;
use crate::core::error::AppResult;
use crate::core::orchestrator::{CancelHandle, SessionOutcome, SessionReport};
use crate::infra::checkpoint::FileCheckpointStore;
use crate::infra::executor::ProcessExecutor;
use crate::infra::planner::JsonlPlanner;
use crate::infra::telemetry::SysfsTelemetry;
use crate::util::clock::SystemClock;

/// Queue drained.
pub const EXIT_DRAINED: u8 = 0;
/// Stopped early; resume from the checkpoint.
pub const EXIT_CHECKPOINTED: u8 = 75;
/// Could not run or could not checkpoint.
pub const EXIT_FATAL: u8 = 1;

/// Budget- and hardware-aware runner for overnight work sessions.
#[derive(Parser, Debug)]
#[command(name = "session-governor", version, about)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run (or resume) a session over planner output.
    Run(RunArgs),
    /// Print the stored checkpoint.
    Inspect(InspectArgs),
}

/// Arguments for `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Token hard cap over the window (overrides the config file)
    #[arg(long, env = "SESSION_GOVERNOR_BUDGET")]
    pub budget: Option<u64>,

    /// Rolling window length, e.g. `5h` (overrides the config file)
    #[arg(long, env = "SESSION_GOVERNOR_WINDOW", value_parser = humantime::parse_duration)]
    pub window: Option<Duration>,

    /// Planner output, one JSON work item per line
    #[arg(long)]
    pub items: PathBuf,

    /// Checkpoint file
    #[arg(long, default_value = "session-checkpoint.json")]
    pub checkpoint: PathBuf,

    /// JSON configuration file
    #[arg(long, env = "SESSION_GOVERNOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Session identifier (random when omitted)
    #[arg(long)]
    pub session: Option<String>,

    /// Keep admitting degraded work at the Critical tier instead of stopping
    #[arg(long)]
    pub continue_at_critical: bool,

    /// Sample hardware in the background while the session runs
    #[arg(long)]
    pub background_telemetry: bool,

    /// Executor program and arguments, after `--` (overrides the config file)
    #[arg(last = true)]
    pub executor: Vec<String>,
}

/// Arguments for `inspect`.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Checkpoint file
    #[arg(long, default_value = "session-checkpoint.json")]
    pub checkpoint: PathBuf,

    /// JSON configuration file (for the window used to prune the ledger)
    #[arg(long, env = "SESSION_GOVERNOR_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Run the parsed command and map its result to an exit status.
///
/// # Errors
///
/// Configuration, ingest and checkpoint failures.
pub fn execute(cli: Cli) -> AppResult<ExitCode> {
    match cli.command {
        Command::Run(args) => run(args),
        Command::Inspect(args) => inspect(&args),
    }
}

fn load_config(path: Option<&Path>) -> AppResult<GovernorConfig> {
    let cfg = match path {
        Some(path) => GovernorConfig::load(path).map_err(anyhow::Error::msg)?,
        None => GovernorConfig::default(),
    };
    Ok(cfg)
}

fn run(args: RunArgs) -> AppResult<ExitCode> {
    let mut cfg = load_config(args.config.as_deref()).context("loading configuration")?;
    if let Some(budget) = args.budget {
        cfg.budget.hard_cap = budget;
    }
    if let Some(window) = args.window {
        cfg.budget.window = window;
    }
    if args.continue_at_critical {
        cfg.session.stop_strategy = StopStrategy::Continue;
    }
    if !args.executor.is_empty() {
        cfg.executor_command = Some(args.executor);
    }
    cfg.validate().map_err(anyhow::Error::msg).context("invalid configuration")?;

    let Some(executor) = cfg.executor_command.as_deref().and_then(ProcessExecutor::from_command) else {
        bail!("no executor command: pass one after `--` or set executor_command");
    };
    let items = JsonlPlanner::new(&args.items).load()?;

    let mut builder = SessionBuilder::new(cfg)
        .with_executor(Arc::new(executor))
        .with_checkpoint_store(Arc::new(FileCheckpointStore::new(&args.checkpoint)))
        .with_telemetry(Arc::new(SysfsTelemetry::default()))
        .with_background_telemetry(args.background_telemetry);
    if let Some(id) = args.session {
        builder = builder.with_session_id(id);
    }
    let mut session = builder.build()?;

    session.ingest(items)?;
    if let Some(checkpoint) = session.resume()? {
        info!(from_session = %checkpoint.session_id, "continuing previous session");
    }
    watch_interrupt(session.cancel_handle());

    let report = session.run()?;
    print_report(&report)?;
    Ok(exit_code(&report))
}

fn inspect(args: &InspectArgs) -> AppResult<ExitCode> {
    let cfg = load_config(args.config.as_deref())?;
    let manager = CheckpointManager::new(
        Arc::new(FileCheckpointStore::new(&args.checkpoint)),
        cfg.budget.window,
        cfg.session.checkpoint_retry_backoff,
        Arc::new(SystemClock),
    );
    match manager.load()? {
        Some(checkpoint) => {
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            Ok(ExitCode::from(EXIT_CHECKPOINTED))
        }
        None => {
            println!("no checkpoint at {}", args.checkpoint.display());
            Ok(ExitCode::from(EXIT_DRAINED))
        }
    }
}

/// Exit status for a finished session.
#[must_use]
pub fn exit_code(report: &SessionReport) -> ExitCode {
    match report.outcome {
        SessionOutcome::Drained => ExitCode::from(EXIT_DRAINED),
        SessionOutcome::Checkpointed(_) => ExitCode::from(EXIT_CHECKPOINTED),
    }
}

fn print_report(report: &SessionReport) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Cancel the session at the next item boundary on Ctrl-C.
fn watch_interrupt(cancel: CancelHandle) {
    let spawned = thread::Builder::new()
        .name("interrupt-watch".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "cannot watch for interrupts");
                    return;
                }
            };
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                warn!("interrupt received, stopping after the current item");
                cancel.cancel();
            }
        });
    if let Err(e) = spawned {
        error!(error = %e, "cannot start interrupt watcher");
    }
}
