//! Outbound notification transports and change-message formatting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::WindowSnapshot;
use jobwatch_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::MonitorConfig;
use crate::window::WindowDiff;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] FetchError),
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(subject, "notification\n{body}");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// POSTs `{"subject": ..., "body": ...}` to a fixed URL. One attempt per send.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: HttpFetcher,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let status = self
            .http
            .post_json(&self.url, &WebhookPayload { subject, body })
            .await?;
        info!(%status, url = %self.url, "webhook delivered");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMessage {
    pub subject: String,
    pub body: String,
}

pub fn compose_message(
    config: &MonitorConfig,
    current: &WindowSnapshot,
    diff: &WindowDiff,
    now: DateTime<Utc>,
) -> ChangeMessage {
    let subject = format!(
        "Top {} changed: {} ({})",
        config.top_k, config.keyword, config.location
    );

    let mut lines = vec![
        format!("Keyword: {}", config.keyword),
        format!("Location: {}", config.location),
        format!("Time (UTC): {}", now.format("%Y-%m-%d %H:%M:%S")),
        String::new(),
    ];
    if !diff.entered.is_empty() {
        lines.push("Entered Top K:".to_string());
        lines.extend(diff.entered.iter().map(|title| format!("  + {title}")));
        lines.push(String::new());
    }
    if !diff.left.is_empty() {
        lines.push("Left Top K:".to_string());
        lines.extend(diff.left.iter().map(|title| format!("  - {title}")));
        lines.push(String::new());
    }
    lines.push("New Top K:".to_string());
    for (index, job) in current.jobs.iter().enumerate() {
        lines.push(format!("{}. {} - {}", index + 1, job.title, job.location));
        lines.push(format!(
            "   Posted: {}",
            job.posted_display().unwrap_or_else(|| "unknown".to_string())
        ));
        lines.push(format!("   {}", job.url));
    }

    ChangeMessage {
        subject,
        body: lines.join("\n"),
    }
}
