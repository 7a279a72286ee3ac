//! Listing source contracts, HTML listing parsing and raw-entry normalization.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use jobwatch_core::{Job, RawListingEntry};
use jobwatch_storage::{FetchError, HttpFetcher, Url};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const DEFAULT_JOB_URL_BASE: &str = "https://apply.careers.microsoft.com/careers/job";

const ID_KEYS: &[&str] = &["jobId", "id", "reqId", "requisitionId"];
const TITLE_KEYS: &[&str] = &["title", "name"];
const LOCATION_KEYS: &[&str] = &["location", "primaryLocation"];
const URL_KEYS: &[&str] = &["jobUrl", "url", "postingUrl"];
const POSTED_TEXT_KEYS: &[&str] = &["posted_text", "postedText"];
const DATE_KEYS: &[&str] = &["postingDate", "postedDate", "startDate", "datePosted"];

/// Epoch values above this are milliseconds, below it seconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 10_000_000_000.0;
/// Average Gregorian month.
pub const SECONDS_PER_MONTH: i64 = 2_629_746;

static RELATIVE_AGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s+(minute|hour|day|week|month)s?\s+ago")
        .expect("relative age pattern is valid")
});

static JOB_HREF_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/job/([0-9]+)/").expect("job href pattern is valid"));

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn first_truthy_text(raw: &RawListingEntry, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .find(|v| truthy(v))
        .map(value_text)
}

/// Stable identifier for a raw entry.
///
/// Candidate id keys win in order. Without any of them the id is synthesized from the
/// title and posting date, which is unstable whenever either field drifts between polls.
pub fn stable_id(raw: &RawListingEntry) -> String {
    let native = ID_KEYS.iter().filter_map(|k| raw.get(*k)).find_map(|v| match v {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        other => Some(value_text(other)),
    });
    if let Some(id) = native {
        return id;
    }

    let title = raw.get("title").map(value_text).unwrap_or_default();
    let posted = raw.get("postingDate").map(value_text).unwrap_or_default();
    format!("fallback::{title}::{posted}")
}

/// Resolve when a posting went live, trying absolute dates, epoch numbers, then
/// relative text such as "3 days ago". Unknown recency is `None`, never an error.
pub fn resolve_posted_at(raw: &RawListingEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for key in DATE_KEYS {
        let Some(value) = raw.get(*key).filter(|v| truthy(v)) else {
            continue;
        };
        let resolved = match value {
            JsonValue::String(s) => parse_iso8601(s).or_else(|| {
                s.trim().parse::<f64>().ok().and_then(from_epoch)
            }),
            JsonValue::Number(n) => n.as_f64().and_then(from_epoch),
            _ => None,
        };
        if resolved.is_some() {
            return resolved;
        }
        debug!(key, value = %value, "unparseable posting date");
    }

    POSTED_TEXT_KEYS
        .iter()
        .filter_map(|k| raw.get(*k).and_then(JsonValue::as_str))
        .find_map(|text| parse_relative_age(text, now))
}

pub fn parse_iso8601(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let normalized = match text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => text.to_string(),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(&normalized, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    // Offset-less values are taken as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value > EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

pub fn parse_relative_age(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RELATIVE_AGE.captures(text)?;
    let qty: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit_secs = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 604_800,
        "month" => SECONDS_PER_MONTH,
        _ => return None,
    };
    let delta = TimeDelta::try_seconds(qty.checked_mul(unit_secs)?)?;
    now.checked_sub_signed(delta)
}

/// Maps raw listing entries onto canonical [`Job`] records.
#[derive(Debug, Clone)]
pub struct Normalizer {
    job_url_base: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_URL_BASE)
    }
}

impl Normalizer {
    pub fn new(job_url_base: impl Into<String>) -> Self {
        Self {
            job_url_base: job_url_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Never fails: every field resolves, falling back to a literal default.
    pub fn normalize(&self, raw: &RawListingEntry, observed_at: DateTime<Utc>) -> Job {
        let id = stable_id(raw);
        let url = first_truthy_text(raw, URL_KEYS)
            .unwrap_or_else(|| format!("{}/{}", self.job_url_base, id));
        Job {
            title: first_truthy_text(raw, TITLE_KEYS).unwrap_or_else(|| "Untitled".to_string()),
            location: first_truthy_text(raw, LOCATION_KEYS).unwrap_or_else(|| "N/A".to_string()),
            posted_at: resolve_posted_at(raw, observed_at),
            posted_text: POSTED_TEXT_KEYS
                .iter()
                .filter_map(|k| raw.get(*k).and_then(JsonValue::as_str))
                .next()
                .map(ToString::to_string),
            url,
            id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing listing: {0}")]
    Parse(String),
    #[error("no job entries found in {0}")]
    Empty(String),
}

/// Produces the ordered raw listing for one poll.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// An empty listing is reported as [`ListingError::Empty`], never as `Ok(vec![])`.
    async fn fetch_listing(&self) -> Result<Vec<RawListingEntry>, ListingError>;
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn joined_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `span`/`div` below `card` whose class mentions one of `markers`.
fn marked_text(card: ElementRef<'_>, markers: &[&str]) -> Option<String> {
    let marked = card
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|el| {
            matches!(el.value().name(), "span" | "div")
                && el.value().attr("class").is_some_and(|class| {
                    let class = class.to_ascii_lowercase();
                    markers.iter().any(|m| class.contains(m))
                })
        })?;
    text_or_none(joined_text(marked))
}

fn job_id_from_href(href: &str) -> Option<&str> {
    JOB_HREF_ID
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Extract job cards from a rendered search page, in document order.
///
/// Every link whose href contains `/job/` is a card. Links repeating an already seen id
/// are dropped. Relative hrefs resolve against `base`.
pub fn parse_listing_html(html: &str, base: &Url) -> Result<Vec<RawListingEntry>, ListingError> {
    let document = Html::parse_document(html);
    let links = Selector::parse("a[href]").map_err(|e| ListingError::Parse(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for link in document.select(&links) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if !href.contains("/job/") {
            continue;
        }
        let id = job_id_from_href(href).unwrap_or(href).to_string();
        if !seen.insert(id.clone()) {
            continue;
        }

        let card = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| matches!(el.value().name(), "article" | "li" | "div"));
        let location = card.and_then(|c| marked_text(c, &["location"]));
        let posted_text = card.and_then(|c| marked_text(c, &["posted", "date"]));
        let url = base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string());

        let mut entry = RawListingEntry::new();
        entry.insert("id".into(), JsonValue::String(id));
        entry.insert(
            "title".into(),
            JsonValue::String(text_or_none(joined_text(link)).unwrap_or_else(|| "Untitled".into())),
        );
        entry.insert(
            "location".into(),
            JsonValue::String(location.unwrap_or_else(|| "N/A".into())),
        );
        entry.insert(
            "posted_text".into(),
            posted_text.map(JsonValue::String).unwrap_or(JsonValue::Null),
        );
        entry.insert("url".into(), JsonValue::String(url));
        entries.push(entry);
    }
    Ok(entries)
}

/// Live search page fetched over HTTP. Pages that need script execution to render their
/// cards will come back empty and surface as [`ListingError::Empty`].
#[derive(Debug, Clone)]
pub struct HtmlListingSource {
    http: HttpFetcher,
    search_url: String,
}

impl HtmlListingSource {
    pub fn new(http: HttpFetcher, search_url: impl Into<String>) -> Self {
        Self {
            http,
            search_url: search_url.into(),
        }
    }
}

#[async_trait]
impl ListingSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        "html"
    }

    async fn fetch_listing(&self) -> Result<Vec<RawListingEntry>, ListingError> {
        let resp = self
            .http
            .fetch_bytes(&self.search_url)
            .await
            .map_err(|source| ListingError::Fetch {
                url: self.search_url.clone(),
                source,
            })?;
        let base = Url::parse(&resp.final_url).map_err(|e| ListingError::Parse(e.to_string()))?;
        let html = String::from_utf8_lossy(&resp.body);
        let entries = parse_listing_html(&html, &base)?;
        if entries.is_empty() {
            return Err(ListingError::Empty(self.search_url.clone()));
        }
        Ok(entries)
    }
}

/// Listing read from a local file: a JSON array of objects, or a saved HTML page.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    path: PathBuf,
    base: Url,
}

impl FixtureListingSource {
    pub fn new(path: impl Into<PathBuf>, base: Url) -> Self {
        Self {
            path: path.into(),
            base,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_html(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_listing(&self) -> Result<Vec<RawListingEntry>, ListingError> {
        let text = fs::read_to_string(&self.path).map_err(|source| ListingError::Io {
            path: self.path.clone(),
            source,
        })?;
        let entries = if self.is_html() {
            parse_listing_html(&text, &self.base)?
        } else {
            serde_json::from_str::<Vec<RawListingEntry>>(&text).map_err(|e| {
                ListingError::Parse(format!("{}: {e}", self.path.display()))
            })?
        };
        if entries.is_empty() {
            return Err(ListingError::Empty(self.path.display().to_string()));
        }
        Ok(entries)
    }
}
