use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_storage::SqliteStateStore;
use jobwatch_sync::{build_monitor, history_markdown, JitterDelay, LoopControl, MonitorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watch the top-K of a job search listing and notify on change")]
struct Cli {
    /// YAML config file; JOBWATCH_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll until interrupted, or for a fixed number of cycles.
    Run {
        #[arg(long)]
        cycles: Option<usize>,
    },
    /// Run a single cycle and exit.
    Once,
    /// Validate configuration and print the effective settings.
    CheckConfig,
    /// Print recent runs as markdown.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run { cycles: None }) {
        Commands::Run { cycles } => {
            let monitor = build_monitor(config).await?;
            let delays = JitterDelay::from_config(monitor.config());
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received; stopping after the current cycle");
                        on_signal.cancel();
                    }
                    Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
                }
            });

            let control = LoopControl {
                max_cycles: cycles,
                cancel,
            };
            let summary = monitor.run_loop(&delays, &control).await;
            println!(
                "monitor stopped: cycles={} notified={} suppressed={} baseline={} no_change={} skipped={} notify_failed={} errored={}",
                summary.cycles,
                summary.notified,
                summary.suppressed,
                summary.baseline,
                summary.no_change,
                summary.skipped,
                summary.notify_failed,
                summary.failed
            );
        }
        Commands::Once => {
            let monitor = build_monitor(config).await?;
            let outcome = monitor.run_cycle().await;
            println!("cycle complete: outcome={}", outcome.label());
        }
        Commands::CheckConfig => {
            let search_url = config.search_url()?;
            println!("configuration ok");
            println!("search url: {search_url}");
            println!("top_k: {}", config.top_k);
            println!(
                "poll interval: {}s..{}s, cooldown: {}s",
                config.poll_min_secs, config.poll_max_secs, config.cooldown_secs
            );
            println!("state db: {}", config.db_path.display());
            match &config.listing_fixture {
                Some(path) => println!("listing: fixture {}", path.display()),
                None => println!("listing: live page"),
            }
            println!(
                "notifier: {}",
                if config.webhook_url.is_some() { "webhook" } else { "log" }
            );
        }
        Commands::History { limit } => {
            let store = SqliteStateStore::open(&config.db_path)
                .await
                .with_context(|| format!("opening state store {}", config.db_path.display()))?;
            print!("{}", history_markdown(&store, limit).await?);
            println!();
        }
    }

    Ok(())
}
