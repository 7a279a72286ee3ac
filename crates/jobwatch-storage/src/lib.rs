//! Monitor state persistence, run history and HTTP fetch utilities for jobwatch.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{
    MonitorState, RunHistoryEntry, WindowSnapshot, STATE_KEY_LAST_SENT, STATE_KEY_SIGNATURE,
    STATE_KEY_SNAPSHOT,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "jobwatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored value in {context}: {message}")]
    InvalidValue { context: String, message: String },
}

/// Key-value state plus an append-only run log.
///
/// A single polling loop is the only writer. `set_many` is all-or-nothing, which is
/// what keeps a killed process from leaving a half-written window behind.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<(), StorageError>;

    async fn append_run(&self, entry: &RunHistoryEntry) -> Result<(), StorageError>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunHistoryEntry>, StorageError>;

    /// Read the committed monitor state. Undecodable values are logged and treated as absent.
    async fn load_state(&self) -> Result<MonitorState, StorageError> {
        let last_window_signature = self.get(STATE_KEY_SIGNATURE).await?;

        let last_window_snapshot = match self.get(STATE_KEY_SNAPSHOT).await? {
            Some(text) => match serde_json::from_str::<WindowSnapshot>(&text) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!(error = %err, "discarding undecodable stored window snapshot");
                    None
                }
            },
            None => None,
        };

        let last_notification_sent_at = match self.get(STATE_KEY_LAST_SENT).await? {
            Some(text) => match DateTime::parse_from_rfc3339(&text) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(err) => {
                    warn!(error = %err, value = %text, "discarding undecodable last-sent timestamp");
                    None
                }
            },
            None => None,
        };

        Ok(MonitorState {
            last_window_signature,
            last_window_snapshot,
            last_notification_sent_at,
        })
    }

    /// Replace the stored window (and the last-sent time, when given) in one write.
    async fn commit_window(
        &self,
        snapshot: &WindowSnapshot,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut pairs = vec![
            (STATE_KEY_SIGNATURE, snapshot.signature.clone()),
            (STATE_KEY_SNAPSHOT, serde_json::to_string(snapshot)?),
        ];
        if let Some(ts) = sent_at {
            pairs.push((STATE_KEY_LAST_SENT, ts.to_rfc3339()));
        }
        self.set_many(&pairs).await
    }
}

/// SQLite-backed store: a `state` key-value table and a `runs` log table.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if missing) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A pooled in-memory database lives only as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                ts_utc TEXT NOT NULL,
                signature TEXT NOT NULL,
                snapshot_json TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const UPSERT_STATE: &str =
    "INSERT INTO state (k, v) VALUES (?, ?) ON CONFLICT(k) DO UPDATE SET v = excluded.v";

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT v FROM state WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("v")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(UPSERT_STATE)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in pairs {
            sqlx::query(UPSERT_STATE)
                .bind(*key)
                .bind(value.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_run(&self, entry: &RunHistoryEntry) -> Result<(), StorageError> {
        let snapshot_json = serde_json::to_string(&entry.snapshot)?;
        sqlx::query(
            "INSERT INTO runs (run_id, ts_utc, signature, snapshot_json) VALUES (?, ?, ?, ?)",
        )
        .bind(entry.run_id.to_string())
        .bind(entry.recorded_at.to_rfc3339())
        .bind(entry.signature.as_str())
        .bind(snapshot_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunHistoryEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT run_id, ts_utc, signature, snapshot_json FROM runs ORDER BY seq DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<RunHistoryEntry, StorageError> {
                let run_id: String = row.try_get("run_id")?;
                let ts_utc: String = row.try_get("ts_utc")?;
                let snapshot_json: String = row.try_get("snapshot_json")?;
                let signature: String = row.try_get("signature")?;
                Ok(RunHistoryEntry {
                    run_id: Uuid::parse_str(&run_id).map_err(|e| StorageError::InvalidValue {
                        context: "runs.run_id".into(),
                        message: e.to_string(),
                    })?,
                    recorded_at: DateTime::parse_from_rfc3339(&ts_utc)
                        .map_err(|e| StorageError::InvalidValue {
                            context: "runs.ts_utc".into(),
                            message: e.to_string(),
                        })?
                        .with_timezone(&Utc),
                    signature,
                    snapshot: serde_json::from_str(&snapshot_json)?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: BTreeMap<String, String>,
    runs: Vec<RunHistoryEntry>,
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().await.state.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        for (key, value) in pairs {
            inner.state.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    async fn append_run(&self, entry: &RunHistoryEntry) -> Result<(), StorageError> {
        self.inner.lock().await.runs.push(entry.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunHistoryEntry>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper: retried GETs for listing pages, single-shot JSON POSTs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9"),
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if !(can_retry && classify_status(status) == RetryDisposition::Retryable) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(%status, attempt, "retryable http status");
                }
                Err(err) => {
                    if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// POST a JSON body once. Callers decide whether a failure is retried.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<StatusCode, FetchError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            })
        }
    }
}
