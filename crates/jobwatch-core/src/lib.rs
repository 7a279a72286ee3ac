//! Core domain model for jobwatch: canonical jobs, window snapshots and persisted monitor state.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-core";

/// State-store key holding the signature of the last observed window.
pub const STATE_KEY_SIGNATURE: &str = "last_window_signature";
/// State-store key holding the JSON-serialized last observed window.
pub const STATE_KEY_SNAPSHOT: &str = "last_window_snapshot";
/// State-store key holding the RFC 3339 time of the last sent notification.
pub const STATE_KEY_LAST_SENT: &str = "last_notification_sent_at";

/// One listing entry exactly as the listing source produced it.
pub type RawListingEntry = serde_json::Map<String, serde_json::Value>;

/// Canonical job posting derived from a raw listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub location: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub posted_text: Option<String>,
    pub url: String,
}

impl Job {
    /// Best human-readable posting time: the resolved timestamp, else the raw text.
    pub fn posted_display(&self) -> Option<String> {
        self.posted_at
            .map(|ts| ts.to_rfc3339())
            .or_else(|| self.posted_text.clone())
    }
}

/// The ordered top-K jobs of one cycle plus their order-sensitive signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub jobs: Vec<Job>,
    pub signature: String,
    pub captured_at: DateTime<Utc>,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    /// Ids that appear more than once, in first-seen order.
    pub fn duplicate_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for job in &self.jobs {
            if !seen.insert(job.id.as_str()) && !dups.contains(&job.id.as_str()) {
                dups.push(job.id.as_str());
            }
        }
        dups
    }
}

/// Append-only audit record written once per valid cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub signature: String,
    pub snapshot: WindowSnapshot,
}

/// Process-wide persisted state read at the start of every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorState {
    pub last_window_signature: Option<String>,
    pub last_window_snapshot: Option<WindowSnapshot>,
    pub last_notification_sent_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            title: format!("Title {id}"),
            location: "N/A".to_string(),
            posted_at: None,
            posted_text: None,
            url: format!("https://example.test/job/{id}"),
        }
    }

    #[test]
    fn duplicate_ids_are_reported_once_in_order() {
        let snapshot = WindowSnapshot {
            jobs: vec![job("a"), job("b"), job("a"), job("c"), job("b"), job("a")],
            signature: "sig".into(),
            captured_at: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        };
        assert_eq!(snapshot.duplicate_ids(), vec!["a", "b"]);
        assert_eq!(snapshot.ids().len(), 3);
    }

    #[test]
    fn posted_display_prefers_resolved_timestamp() {
        let mut j = job("1");
        j.posted_text = Some("3 days ago".into());
        assert_eq!(j.posted_display().as_deref(), Some("3 days ago"));
        j.posted_at = Some(Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap());
        assert_eq!(j.posted_display().as_deref(), Some("2024-01-07T00:00:00+00:00"));
    }
}
