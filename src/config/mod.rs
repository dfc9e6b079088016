use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::fetch::FETCH_CONCURRENCY_LIMIT;

pub mod loader;
pub mod registry;
pub mod validator;

pub use loader::{load_settings, load_source_descriptor, load_sources, SourceDescriptor};
pub use registry::SourceRegistry;

/// One step of a dot-notation data path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of the value(s) inside a response body, e.g. `main.temp` or `items.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl DataPath {
    pub fn root() -> Self {
        Self {
            raw: String::new(),
            segments: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "$" {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() {
                return Err(AppError::Config(format!(
                    "data path `{trimmed}` contains an empty segment"
                )));
            }
            let segment = if part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse::<usize>()
                    .map(PathSegment::Index)
                    .unwrap_or_else(|_| PathSegment::Key(part.to_string()))
            } else {
                PathSegment::Key(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl FromStr for DataPath {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        DataPath::parse(s)
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("$")
        } else {
            f.write_str(&self.raw)
        }
    }
}

/// A registered data origin. Immutable once built; re-registration replaces the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub name: String,
    pub url_template: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub data_path: DataPath,
    pub unit: String,
    pub timestamp_field: String,
    pub value_field: String,
    pub rate_group: String,
    pub timeout: Option<Duration>,
}

impl Source {
    /// Minimal source with default field names; the rate group is derived from the URL host.
    pub fn new(name: &str, url_template: &str, data_path: &str, unit: &str) -> Result<Self> {
        let data_path = DataPath::parse(data_path)?;
        Ok(Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            data_path,
            unit: unit.to_string(),
            timestamp_field: default_timestamp_field(),
            value_field: default_value_field(),
            rate_group: rate_group_for(url_template, name),
            timeout: None,
        })
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_rate_group(mut self, group: &str) -> Self {
        self.rate_group = group.to_string();
        self
    }
}

/// Upstream grouping used by the rate limiter: the URL host, or the source name when the
/// template has no parseable host.
pub fn rate_group_for(url_template: &str, fallback: &str) -> String {
    reqwest::Url::parse(url_template)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_lowercase()))
        .unwrap_or_else(|| fallback.to_string())
}

pub(crate) fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

pub(crate) fn default_value_field() -> String {
    "value".to_string()
}

/// Tunables for the fetch pipeline. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub min_request_interval_ms: u64,
    pub rate_group_intervals_ms: HashMap<String, u64>,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ratio: f64,
    pub request_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
    pub failure_cooldown_secs: u64,
    pub validation_sample_size: usize,
    pub max_backups: Option<usize>,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub history_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_request_interval_ms: 2_000,
            rate_group_intervals_ms: HashMap::new(),
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            jitter_ratio: 0.25,
            request_timeout_secs: 30,
            max_concurrent_fetches: FETCH_CONCURRENCY_LIMIT,
            failure_cooldown_secs: 30,
            validation_sample_size: 10,
            max_backups: None,
            cache_ttl_secs: 0,
            cache_capacity: 128,
            history_limit: 100,
        }
    }
}

impl PipelineSettings {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub pipeline: PipelineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            pipeline: PipelineSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dot_paths_with_indices() {
        let path = DataPath::parse("list.0.main.temp").expect("valid path");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("list".to_string()),
                PathSegment::Index(0),
                PathSegment::Key("main".to_string()),
                PathSegment::Key("temp".to_string()),
            ]
        );
        assert_eq!(path.to_string(), "list.0.main.temp");
    }

    #[test]
    fn empty_path_is_root() {
        assert!(DataPath::parse("").unwrap().is_root());
        assert!(DataPath::parse(" $ ").unwrap().is_root());
        assert_eq!(DataPath::root().to_string(), "$");
    }

    #[test]
    fn rejects_empty_segments() {
        let err = DataPath::parse("main..temp").expect_err("should fail");
        assert!(err.to_string().contains("empty segment"), "{err}");
    }

    #[test]
    fn rate_group_defaults_to_host() {
        let source = Source::new(
            "weather_tokyo",
            "https://API.example.com/weather?q={city}",
            "main.temp",
            "celsius",
        )
        .unwrap();
        assert_eq!(source.rate_group, "api.example.com");

        assert_eq!(rate_group_for("{base}/quotes", "quotes"), "quotes");
    }

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"pipeline": {"max_attempts": 5}}"#).expect("parse");
        assert_eq!(settings.pipeline.max_attempts, 5);
        assert_eq!(settings.pipeline.max_concurrent_fetches, FETCH_CONCURRENCY_LIMIT);
        assert_eq!(settings.pipeline.cache_capacity, 128);
        assert_eq!(settings.pipeline.min_request_interval_ms, 2_000);
        assert_eq!(settings.data_dir, PathBuf::from("data"));
        assert!(settings.pipeline.cache_ttl().is_none());
    }
}
