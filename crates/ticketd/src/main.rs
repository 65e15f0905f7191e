//! ticketd - ticket board orchestrator daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use ticket_core::Config;
use ticketd::agent::{self, ClaudeCli};
use ticketd::board::HttpBoard;
use ticketd::shutdown::{self, DrainOutcome};
use ticketd::{Daemon, RunOptions};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ticketd", about = "Ticket board orchestrator daemon", version)]
struct Cli {
    /// Config file (default: $TICKETD_CONFIG or the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single poll cycle, wait for its jobs, then exit
    #[arg(long)]
    once: bool,

    /// Fetch and log candidates without dispatching jobs
    #[arg(long)]
    dry_run: bool,

    /// Maximum concurrent jobs
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Seconds between poll cycles
    #[arg(long)]
    poll_interval: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load config with precedence CLI > environment > file > defaults.
fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::from_file(&path)?
            } else {
                info!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
        }
    };

    config.apply_env();
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    if let Some(interval) = cli.poll_interval {
        config.poll_interval_sec = interval;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> eyre::Result<ExitCode> {
    let config = load_config(&cli).wrap_err("failed to load configuration")?;
    let (url, token) = config.require_board()?;
    let board = HttpBoard::new(url, token, Duration::from_secs(config.board.timeout_sec))
        .wrap_err("failed to create board client")?;

    if !agent::is_available(&config.agent_bin).await {
        warn!(
            agent_bin = %config.agent_bin.display(),
            "agent binary not found on PATH; jobs will fail until it is installed"
        );
    }
    let agent = ClaudeCli::from_config(&config);

    let options = RunOptions {
        once: cli.once,
        dry_run: cli.dry_run,
    };
    let daemon = Daemon::new(Arc::new(config), Arc::new(board), Arc::new(agent), options);

    tokio::select! {
        () = daemon.run() => {
            info!("poll loop finished");
            return Ok(ExitCode::SUCCESS);
        }
        signal = shutdown::wait_for_signal() => {
            let signal = signal.wrap_err("failed to register signal handlers")?;
            info!("received {}, initiating graceful shutdown", signal);
        }
    }

    daemon.shutdown();
    match daemon.drain().await {
        DrainOutcome::Drained => {
            info!("shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        DrainOutcome::TimedOut { remaining } => {
            error!(
                remaining = remaining.len(),
                "shutdown timed out with jobs still running"
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
