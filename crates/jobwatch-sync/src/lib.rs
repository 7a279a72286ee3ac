//! Top-K change detection: configuration, window fingerprinting, the notification gate,
//! notifiers and the polling monitor that ties them together.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobwatch_adapters::{FixtureListingSource, HtmlListingSource, ListingSource};
use jobwatch_storage::{HttpClientConfig, HttpFetcher, SqliteStateStore, StateStore, Url};
use tracing::info;

pub mod config;
pub mod gate;
pub mod monitor;
pub mod notify;
pub mod window;

pub use config::{ConfigError, MonitorConfig};
pub use gate::{GateDecision, GateState, NotificationGate};
pub use monitor::{
    Clock, CycleError, CycleOutcome, DelayProvider, FixedDelay, JitterDelay, LoopControl,
    LoopSummary, Monitor, SystemClock,
};
pub use notify::{compose_message, ChangeMessage, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use window::{diff, snapshot, window_signature, WindowDiff, WindowError};

pub const CRATE_NAME: &str = "jobwatch-sync";

/// Wire the production collaborators described by `config` into a [`Monitor`].
pub async fn build_monitor(config: MonitorConfig) -> Result<Monitor> {
    let store = SqliteStateStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening state store {}", config.db_path.display()))?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;

    let search_url = config.search_url()?;
    let source: Arc<dyn ListingSource> = match &config.listing_fixture {
        Some(path) => {
            let base = Url::parse(&config.job_url_base).unwrap_or_else(|_| search_url.clone());
            Arc::new(FixtureListingSource::new(path.clone(), base))
        }
        None => Arc::new(HtmlListingSource::new(http.clone(), search_url.as_str())),
    };

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(http, url.clone())),
        None => Arc::new(LogNotifier),
    };

    info!(
        source = source.source_id(),
        notifier = notifier.name(),
        top_k = config.top_k,
        db = %config.db_path.display(),
        "monitor configured"
    );
    Ok(Monitor::new(config, source, Arc::new(store), notifier))
}

/// Markdown summary of the most recent runs, newest first.
pub async fn history_markdown(store: &dyn StateStore, limit: usize) -> Result<String> {
    // One extra run so the oldest listed entry can still be compared with its predecessor.
    let runs = store
        .recent_runs(limit.max(1) + 1)
        .await
        .context("reading run history")?;

    let mut lines = vec!["# jobwatch run history".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("_no runs recorded yet_".to_string());
        return Ok(lines.join("\n"));
    }

    for (index, run) in runs.iter().take(limit.max(1)).enumerate() {
        let changed = match runs.get(index + 1) {
            Some(older) => older.signature != run.signature,
            None => true,
        };
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- recorded: {}", run.recorded_at.to_rfc3339()));
        lines.push(format!("- signature: `{}`", run.signature));
        lines.push(format!(
            "- window: {}",
            if changed { "changed" } else { "unchanged" }
        ));
        for (rank, job) in run.snapshot.jobs.iter().enumerate() {
            lines.push(format!("  {}. {} ({})", rank + 1, job.title, job.location));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
