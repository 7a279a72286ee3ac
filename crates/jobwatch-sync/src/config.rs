//! Monitor configuration: defaults, optional YAML file, `JOBWATCH_*` environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use jobwatch_adapters::DEFAULT_JOB_URL_BASE;
use jobwatch_storage::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error in '{path}': {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable settings for one monitor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub keyword: String,
    pub location: String,
    pub search_base: String,
    /// Full search URL; takes precedence over `search_base` + keyword/location.
    pub search_url: Option<String>,
    pub top_k: usize,
    pub poll_min_secs: u64,
    pub poll_max_secs: u64,
    pub cooldown_secs: u64,
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub job_url_base: String,
    pub webhook_url: Option<String>,
    /// Local JSON/HTML listing used in place of the live page.
    pub listing_fixture: Option<PathBuf>,
    pub notify_on_first_run: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            keyword: "software engineer".to_string(),
            location: "United States".to_string(),
            search_base: "https://jobs.careers.microsoft.com/global/en/search".to_string(),
            search_url: None,
            top_k: 5,
            poll_min_secs: 120,
            poll_max_secs: 180,
            cooldown_secs: 600,
            db_path: PathBuf::from("jobwatch_state.sqlite"),
            user_agent: "Mozilla/5.0 (jobwatch/0.1)".to_string(),
            http_timeout_secs: 60,
            job_url_base: DEFAULT_JOB_URL_BASE.to_string(),
            webhook_url: None,
            listing_fixture: None,
            notify_on_first_run: false,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl MonitorConfig {
    /// Defaults, overlaid by `path` when given, overlaid by the process environment,
    /// then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `JOBWATCH_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("JOBWATCH_KEYWORD") {
            self.keyword = v;
        }
        if let Some(v) = lookup("JOBWATCH_LOCATION") {
            self.location = v;
        }
        if let Some(v) = lookup("JOBWATCH_SEARCH_BASE") {
            self.search_base = v;
        }
        if let Some(v) = lookup("JOBWATCH_SEARCH_URL") {
            self.search_url = non_empty(v);
        }
        if let Some(v) = lookup("JOBWATCH_TOP_K") {
            self.top_k = parse_env("JOBWATCH_TOP_K", &v)?;
        }
        if let Some(v) = lookup("JOBWATCH_POLL_MIN_SECONDS") {
            self.poll_min_secs = parse_env("JOBWATCH_POLL_MIN_SECONDS", &v)?;
        }
        if let Some(v) = lookup("JOBWATCH_POLL_MAX_SECONDS") {
            self.poll_max_secs = parse_env("JOBWATCH_POLL_MAX_SECONDS", &v)?;
        }
        if let Some(v) = lookup("JOBWATCH_COOLDOWN_SECONDS") {
            self.cooldown_secs = parse_env("JOBWATCH_COOLDOWN_SECONDS", &v)?;
        }
        if let Some(v) = lookup("JOBWATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("JOBWATCH_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("JOBWATCH_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_env("JOBWATCH_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("JOBWATCH_JOB_URL_BASE") {
            self.job_url_base = v;
        }
        if let Some(v) = lookup("JOBWATCH_WEBHOOK_URL") {
            self.webhook_url = non_empty(v);
        }
        if let Some(v) = lookup("JOBWATCH_LISTING_FIXTURE") {
            self.listing_fixture = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = lookup("JOBWATCH_NOTIFY_ON_FIRST_RUN") {
            self.notify_on_first_run = parse_flag("JOBWATCH_NOTIFY_ON_FIRST_RUN", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k < 1 {
            return Err(ConfigError::Invalid("top_k must be >= 1".into()));
        }
        if self.poll_min_secs == 0 || self.poll_max_secs == 0 {
            return Err(ConfigError::Invalid("poll interval bounds must be positive".into()));
        }
        if self.poll_min_secs > self.poll_max_secs {
            return Err(ConfigError::Invalid(format!(
                "poll_min_secs ({}) cannot exceed poll_max_secs ({})",
                self.poll_min_secs, self.poll_max_secs
            )));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http_timeout_secs must be positive".into()));
        }
        if let Some(url) = &self.webhook_url {
            Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                key: "webhook_url".into(),
                value: url.clone(),
                reason: e.to_string(),
            })?;
        }
        self.search_url()?;
        Ok(())
    }

    /// The page to poll, sorted newest first.
    pub fn search_url(&self) -> Result<Url, ConfigError> {
        if let Some(custom) = &self.search_url {
            return Url::parse(custom).map_err(|e| ConfigError::InvalidValue {
                key: "search_url".into(),
                value: custom.clone(),
                reason: e.to_string(),
            });
        }
        let mut url = Url::parse(&self.search_base).map_err(|e| ConfigError::InvalidValue {
            key: "search_base".into(),
            value: self.search_base.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("keywords", &self.keyword)
            .append_pair("location", &self.location)
            .append_pair("sortBy", "DT_DESC");
        Ok(url)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        MonitorConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn search_url_is_form_encoded_and_sorted_by_date() {
        let config = MonitorConfig {
            keyword: "data & ml".into(),
            location: "New York".into(),
            search_base: "https://jobs.example.test/search".into(),
            ..MonitorConfig::default()
        };
        assert_eq!(
            config.search_url().unwrap().as_str(),
            "https://jobs.example.test/search?keywords=data+%26+ml&location=New+York&sortBy=DT_DESC"
        );

        let config = MonitorConfig {
            search_url: Some("https://apply.example.test/q?x=1".into()),
            ..config
        };
        assert_eq!(config.search_url().unwrap().as_str(), "https://apply.example.test/q?x=1");
    }

    #[test]
    fn env_overrides_replace_defaults() {
        let mut config = MonitorConfig::default();
        config
            .apply_env(env(&[
                ("JOBWATCH_TOP_K", "3"),
                ("JOBWATCH_COOLDOWN_SECONDS", "0"),
                ("JOBWATCH_KEYWORD", "rust"),
                ("JOBWATCH_WEBHOOK_URL", ""),
                ("JOBWATCH_NOTIFY_ON_FIRST_RUN", "yes"),
            ]))
            .expect("apply env");
        assert_eq!(config.top_k, 3);
        assert_eq!(config.cooldown(), Duration::ZERO);
        assert_eq!(config.keyword, "rust");
        assert_eq!(config.webhook_url, None);
        assert!(config.notify_on_first_run);
    }

    #[test]
    fn unparseable_env_values_fail_fast() {
        let mut config = MonitorConfig::default();
        let err = config
            .apply_env(env(&[("JOBWATCH_TOP_K", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "JOBWATCH_TOP_K"));
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let zero_k = MonitorConfig {
            top_k: 0,
            ..MonitorConfig::default()
        };
        assert!(zero_k.validate().is_err());

        let inverted = MonitorConfig {
            poll_min_secs: 300,
            poll_max_secs: 200,
            ..MonitorConfig::default()
        };
        assert!(inverted.validate().is_err());

        let zero_interval = MonitorConfig {
            poll_min_secs: 0,
            ..MonitorConfig::default()
        };
        assert!(zero_interval.validate().is_err());

        let bad_webhook = MonitorConfig {
            webhook_url: Some("not a url".into()),
            ..MonitorConfig::default()
        };
        assert!(bad_webhook.validate().is_err());
    }

    #[test]
    fn yaml_file_overlays_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobwatch.yaml");
        std::fs::write(
            &path,
            "keyword: platform engineer\ntop_k: 10\npoll_min_secs: 30\npoll_max_secs: 45\n",
        )
        .expect("write");

        let config = MonitorConfig::from_yaml_file(&path).expect("load");
        assert_eq!(config.keyword, "platform engineer");
        assert_eq!(config.top_k, 10);
        assert_eq!(config.poll_min_secs, 30);
        assert_eq!(config.cooldown_secs, 600);
    }

    #[test]
    fn yaml_unknown_keys_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobwatch.yaml");
        std::fs::write(&path, "topk: 3\n").expect("write");
        assert!(matches!(
            MonitorConfig::from_yaml_file(&path),
            Err(ConfigError::Yaml { .. })
        ));
    }
}
