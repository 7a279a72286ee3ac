//! Top-K window selection, order-sensitive signatures and entered/left diffs.

use chrono::{DateTime, Utc};
use jobwatch_core::{Job, WindowSnapshot};
use jobwatch_storage::sha256_hex;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window size must be at least 1")]
    ZeroSize,
    #[error("insufficient results: {available} listed, {needed} required")]
    Insufficient { needed: usize, available: usize },
}

/// SHA-256 over the compact JSON array of `[id, title]` pairs, in window order.
///
/// Encoding is `[["id","title"],...]` with no whitespace and non-ASCII left unescaped.
pub fn window_signature(jobs: &[Job]) -> String {
    let mut payload = String::from("[");
    for (index, job) in jobs.iter().enumerate() {
        if index > 0 {
            payload.push(',');
        }
        payload.push('[');
        payload.push_str(&JsonValue::from(job.id.as_str()).to_string());
        payload.push(',');
        payload.push_str(&JsonValue::from(job.title.as_str()).to_string());
        payload.push(']');
    }
    payload.push(']');
    sha256_hex(payload.as_bytes())
}

/// Take exactly the first `k` jobs. Short listings are an error, never padded.
pub fn snapshot(
    jobs: &[Job],
    k: usize,
    captured_at: DateTime<Utc>,
) -> Result<WindowSnapshot, WindowError> {
    if k == 0 {
        return Err(WindowError::ZeroSize);
    }
    if jobs.len() < k {
        return Err(WindowError::Insufficient {
            needed: k,
            available: jobs.len(),
        });
    }
    let window = jobs[..k].to_vec();
    Ok(WindowSnapshot {
        signature: window_signature(&window),
        jobs: window,
        captured_at,
    })
}

/// Titles that entered and left the window, by id membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowDiff {
    pub entered: Vec<String>,
    pub left: Vec<String>,
}

impl WindowDiff {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

pub fn diff(previous: Option<&WindowSnapshot>, current: &WindowSnapshot) -> WindowDiff {
    let Some(previous) = previous else {
        return WindowDiff::default();
    };
    let previous_ids = previous.ids();
    let current_ids = current.ids();
    WindowDiff {
        entered: current
            .jobs
            .iter()
            .filter(|j| !previous_ids.contains(j.id.as_str()))
            .map(|j| j.title.clone())
            .collect(),
        left: previous
            .jobs
            .iter()
            .filter(|j| !current_ids.contains(j.id.as_str()))
            .map(|j| j.title.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(id: &str, title: &str) -> Job {
        Job {
            id: id.to_string(),
            title: title.to_string(),
            location: "Remote".into(),
            posted_at: None,
            posted_text: None,
            url: format!("https://example.test/job/{id}"),
        }
    }

    fn jobs(ids: &[&str]) -> Vec<Job> {
        ids.iter().map(|id| job(id, &format!("Role {id}"))).collect()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn signature_matches_compact_json_encoding() {
        let window = vec![job("1", "Software Engineer"), job("2", "Café \"Lead\"")];
        assert_eq!(
            window_signature(&window),
            "c4f0501a6d746b852b8457bf80d1769db3548bc63124fc56e470e37a154bb373"
        );
    }

    #[test]
    fn entries_beyond_k_do_not_affect_signature() {
        let a = snapshot(&jobs(&["a", "b", "c", "x"]), 3, at()).unwrap();
        let b = snapshot(&jobs(&["a", "b", "c", "y", "z"]), 3, at()).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn reordering_or_retitling_changes_signature() {
        let base = snapshot(&jobs(&["a", "b", "c"]), 3, at()).unwrap();
        let swapped = snapshot(&jobs(&["b", "a", "c"]), 3, at()).unwrap();
        assert_ne!(base.signature, swapped.signature);

        let mut retitled = jobs(&["a", "b", "c"]);
        retitled[2].title = "Role c (Remote)".into();
        let retitled = snapshot(&retitled, 3, at()).unwrap();
        assert_ne!(base.signature, retitled.signature);
    }

    #[test]
    fn location_and_url_do_not_affect_signature() {
        let mut moved = jobs(&["a", "b"]);
        moved[0].location = "Dublin".into();
        moved[1].url = "https://elsewhere.test".into();
        assert_eq!(
            window_signature(&moved),
            window_signature(&jobs(&["a", "b"]))
        );
    }

    #[test]
    fn short_listings_and_zero_k_are_rejected() {
        assert_eq!(
            snapshot(&jobs(&["a", "b"]), 3, at()).unwrap_err(),
            WindowError::Insufficient {
                needed: 3,
                available: 2
            }
        );
        assert_eq!(snapshot(&jobs(&["a"]), 0, at()).unwrap_err(), WindowError::ZeroSize);
    }

    #[test]
    fn diff_without_history_is_empty() {
        let current = snapshot(&jobs(&["a", "b"]), 2, at()).unwrap();
        assert!(diff(None, &current).is_empty());
        assert!(diff(Some(&current), &current).is_empty());
    }

    #[test]
    fn diff_reports_titles_in_window_order() {
        let previous = snapshot(&jobs(&["a", "b", "c", "d"]), 4, at()).unwrap();
        let current = snapshot(&jobs(&["e", "b", "f", "a"]), 4, at()).unwrap();
        let d = diff(Some(&previous), &current);
        assert_eq!(d.entered, vec!["Role e", "Role f"]);
        assert_eq!(d.left, vec!["Role c", "Role d"]);
    }

    #[test]
    fn reorder_only_changes_have_empty_diff() {
        let previous = snapshot(&jobs(&["a", "b"]), 2, at()).unwrap();
        let current = snapshot(&jobs(&["b", "a"]), 2, at()).unwrap();
        assert_ne!(previous.signature, current.signature);
        assert!(diff(Some(&previous), &current).is_empty());
    }
}
