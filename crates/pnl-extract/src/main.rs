//! pnl-extract: PnL extraction and reconciliation CLI for one Polymarket trader.
//!
//! # Usage
//!
//! Run every stage for the configured window:
//! ```sh
//! pnl-extract --config config/pnl.toml run
//! ```
//!
//! Re-run a single stage with a different window:
//! ```sh
//! pnl-extract --start 2026-01-05 --end 2026-01-06 fills
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pnl_core::UnredeemedPolicy;
use pnl_extract::{CancelToken, ConfigOverrides, ExtractConfig, Pipeline, Stage};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// PnL extraction and cross-source reconciliation for a Polymarket trader.
#[derive(Parser, Debug)]
#[command(name = "pnl-extract")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "PNL_CONFIG", default_value = "config/pnl.toml")]
    config: PathBuf,

    /// Tracked trader address (0x...)
    #[arg(long, env = "PNL_USER")]
    user: Option<String>,

    /// Profile handle for the scraped PnL series (defaults to the address)
    #[arg(long)]
    profile: Option<String>,

    /// Window start date (YYYY-MM-DD)
    #[arg(long, short = 's')]
    start: Option<String>,

    /// Window end date, inclusive (YYYY-MM-DD)
    #[arg(long, short = 'e')]
    end: Option<String>,

    /// Data directory for CSV and JSON output
    #[arg(long, env = "PNL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Pricing for closed markets without a redemption (worthless, execution_price)
    #[arg(long)]
    policy: Option<UnredeemedPolicy>,

    /// Absolute reconciliation tolerance in USD
    #[arg(long)]
    tolerance: Option<Decimal>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Ingest the trader's order fills (maker and taker)
    Fills,
    /// Ingest TRADE rows from the REST activity feed
    Trades,
    /// Ingest the trader's redemptions
    Redemptions,
    /// Fetch markets around the window and for traded tokens, and build the asset map
    Markets,
    /// Scrape cumulative PnL snapshots from the profile page
    Snapshots,
    /// Read subgraph PnL at the window's boundary blocks
    Blocks,
    /// Classify fills and estimate per-trade PnL
    Enrich,
    /// Compare computed, scraped and subgraph PnL
    Reconcile,
    /// Run every stage in order
    Run,
}

impl Commands {
    fn stage(self) -> Option<Stage> {
        match self {
            Commands::Fills => Some(Stage::Fills),
            Commands::Trades => Some(Stage::Trades),
            Commands::Redemptions => Some(Stage::Redemptions),
            Commands::Markets => Some(Stage::Markets),
            Commands::Snapshots => Some(Stage::Snapshots),
            Commands::Blocks => Some(Stage::Blocks),
            Commands::Enrich => Some(Stage::Enrich),
            Commands::Reconcile => Some(Stage::Reconcile),
            Commands::Run => None,
        }
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            user: self.user.clone(),
            profile: self.profile.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            data_dir: self.data_dir.clone(),
            log_level: self.log_level.clone(),
            policy: self.policy,
            tolerance: self.tolerance,
        }
    }
}

fn load_config(cli: &Cli) -> Result<ExtractConfig> {
    let mut config = ExtractConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    config.apply_overrides(cli.overrides());
    Ok(config)
}

/// Cancel `token` on the first interrupt; the page in flight still completes.
fn spawn_signal_watcher(token: CancelToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(windows)]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        info!("Finishing the current page, then stopping...");
        token.cancel();
    });
}

async fn run(config: ExtractConfig, command: Commands, cancel: CancelToken) -> Result<()> {
    let pipeline = Pipeline::new(config, cancel)?;
    match command.stage() {
        Some(stage) => pipeline.run_stage(stage).await,
        None => pipeline.run_all().await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("pnl-extract v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::new();
    spawn_signal_watcher(cancel.clone());

    match run(config, cli.command, cancel.clone()).await {
        Ok(()) if cancel.is_cancelled() => {
            warn!("Stopped early; rerun the same command to resume");
            ExitCode::SUCCESS
        }
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
