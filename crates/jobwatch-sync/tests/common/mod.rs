#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use jobwatch_adapters::{ListingError, ListingSource};
use jobwatch_core::{RawListingEntry, RunHistoryEntry};
use jobwatch_storage::{MemoryStateStore, StateStore, StorageError};
use jobwatch_sync::{Clock, Notifier, NotifyError};
use serde_json::json;

pub fn raw_entry(id: &str, title: &str) -> RawListingEntry {
    let value = json!({
        "jobId": id,
        "title": title,
        "location": "Redmond, WA",
        "postedText": "1 day ago",
    });
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Listing whose entries are titled `Role {id}`.
pub fn listing(ids: &[&str]) -> Vec<RawListingEntry> {
    ids.iter()
        .map(|id| raw_entry(id, &format!("Role {id}")))
        .collect()
}

/// Replays queued fetch results; an exhausted queue reports an empty listing.
#[derive(Default)]
pub struct ScriptedListingSource {
    queue: Mutex<VecDeque<Result<Vec<RawListingEntry>, ListingError>>>,
}

impl ScriptedListingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, ids: &[&str]) {
        self.queue.lock().unwrap().push_back(Ok(listing(ids)));
    }

    pub fn push_err(&self, err: ListingError) {
        self.queue.lock().unwrap().push_back(Err(err));
    }
}

#[async_trait]
impl ListingSource for ScriptedListingSource {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn fetch_listing(&self) -> Result<Vec<RawListingEntry>, ListingError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ListingError::Empty("script exhausted".into())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        if *self.failing.lock().unwrap() {
            return Err(NotifyError::Transport("connection refused".into()));
        }
        self.sent.lock().unwrap().push(SentMessage {
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// In-memory store whose next `n` state writes fail.
#[derive(Default)]
pub struct FlakyStateStore {
    inner: MemoryStateStore,
    failing_writes: AtomicUsize,
}

impl FlakyStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), StorageError> {
        let armed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            Err(StorageError::InvalidValue {
                context: "state".into(),
                message: "disk I/O error".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.take_failure()?;
        self.inner.set(key, value).await
    }

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<(), StorageError> {
        self.take_failure()?;
        self.inner.set_many(pairs).await
    }

    async fn append_run(&self, entry: &RunHistoryEntry) -> Result<(), StorageError> {
        self.inner.append_run(entry).await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunHistoryEntry>, StorageError> {
        self.inner.recent_runs(limit).await
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
}
