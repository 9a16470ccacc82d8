use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
/// Library configuration, either built programmatically or loaded from TOML.
pub struct Config {
    pub jira: JiraConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub ambiguity: AmbiguityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default)]
    pub api_version: ApiVersion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ApiVersion {
    #[default]
    #[serde(rename = "v2")]
    V2,
    #[serde(rename = "v3")]
    V3,
}

impl ApiVersion {
    /// Path segment used when building `/rest/api/<segment>/...` URLs.
    pub fn path_segment(self) -> &'static str {
        match self {
            ApiVersion::V2 => "2",
            ApiVersion::V3 => "3",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// SQLite path for the durable cache. `None` keeps everything in memory,
    /// which disables bulk manifests.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_manifest_ttl_secs")]
    pub manifest_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            ttl_secs: default_cache_ttl_secs(),
            manifest_ttl_secs: default_manifest_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_bulk_request_secs")]
    pub bulk_request_secs: u64,
    /// Seconds without new completions before a bulk job counts as stuck.
    /// Zero disables stuck detection.
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,
    #[serde(default = "default_progress_polling_secs")]
    pub progress_polling_secs: u64,
    /// When false, marker labels are never injected and never cleaned up.
    #[serde(default = "default_cleanup_markers")]
    pub cleanup_markers: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            bulk_request_secs: default_bulk_request_secs(),
            progress_timeout_secs: default_progress_timeout_secs(),
            progress_polling_secs: default_progress_polling_secs(),
            cleanup_markers: default_cleanup_markers(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AmbiguityConfig {
    #[serde(default)]
    pub user: UserAmbiguityPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Raises the stderr verbosity floor to include debug lines.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Interval of the periodic counters line on stderr. `None` disables
    /// the logger thread.
    #[serde(default)]
    pub log_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAmbiguityPolicy {
    /// Multiple user matches raise an ambiguity error.
    #[default]
    Strict,
    /// Multiple user matches are ranked: exact email first, then exact
    /// display name; a remaining tie raises.
    Score,
}

impl Config {
    /// Minimal programmatic construction with every section defaulted.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            jira: JiraConfig {
                base_url: base_url.into(),
                token: token.into(),
                api_version: ApiVersion::V2,
            },
            cache: CacheConfig::default(),
            timeout: TimeoutConfig::default(),
            ambiguity: AmbiguityConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jira.base_url.trim().is_empty() {
            return Err(Error::configuration("jira.base_url must not be empty"));
        }
        if self.jira.token.trim().is_empty() {
            return Err(Error::configuration("jira.token must not be empty"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::configuration("cache.ttl_secs must be > 0"));
        }
        if self.cache.manifest_ttl_secs == 0 {
            return Err(Error::configuration("cache.manifest_ttl_secs must be > 0"));
        }
        if self.timeout.request_secs == 0 {
            return Err(Error::configuration("timeout.request_secs must be > 0"));
        }
        if self.timeout.bulk_request_secs == 0 {
            return Err(Error::configuration("timeout.bulk_request_secs must be > 0"));
        }
        if self.timeout.progress_polling_secs == 0 {
            return Err(Error::configuration(
                "timeout.progress_polling_secs must be > 0",
            ));
        }
        if self.metrics.log_interval_secs == Some(0) {
            return Err(Error::configuration(
                "metrics.log_interval_secs must be > 0 when set",
            ));
        }
        Ok(())
    }
}

pub fn load_from(path: &std::path::Path) -> Result<Config> {
    let path: PathBuf = path.to_path_buf();
    let raw = std::fs::read_to_string(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            Error::configuration(format!(
                "failed to read config file at {}: {}",
                path.display(),
                source
            ))
        }
    })?;

    let cfg = toml::from_str::<Config>(&raw).map_err(|source| {
        Error::configuration(format!(
            "failed to parse TOML config at {}: {}",
            path.display(),
            source
        ))
    })?;
    cfg.validate()?;
    Ok(cfg)
}

const fn default_cache_ttl_secs() -> u64 {
    900
}

const fn default_manifest_ttl_secs() -> u64 {
    86_400
}

const fn default_request_secs() -> u64 {
    10
}

const fn default_bulk_request_secs() -> u64 {
    30
}

const fn default_progress_timeout_secs() -> u64 {
    120
}

const fn default_progress_polling_secs() -> u64 {
    2
}

const fn default_cleanup_markers() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let raw = r#"
            [jira]
            base_url = "https://jira.example.com"
            token = "pat-token"
        "#;

        let cfg: Config = toml::from_str(raw).expect("toml should parse");
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.jira.api_version, ApiVersion::V2);
        assert_eq!(cfg.cache.ttl_secs, 900);
        assert_eq!(cfg.cache.manifest_ttl_secs, 86_400);
        assert_eq!(cfg.timeout.request_secs, 10);
        assert_eq!(cfg.timeout.bulk_request_secs, 30);
        assert_eq!(cfg.timeout.progress_timeout_secs, 120);
        assert_eq!(cfg.timeout.progress_polling_secs, 2);
        assert!(cfg.timeout.cleanup_markers);
        assert_eq!(cfg.ambiguity.user, UserAmbiguityPolicy::Strict);
        assert!(!cfg.logging.debug);
        assert_eq!(cfg.metrics.log_interval_secs, None);
    }

    #[test]
    fn validate_rejects_empty_required_fields() {
        let cfg = Config::new("", "token");
        let err = cfg.validate().expect_err("empty base_url should fail");
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let cfg = Config::new("https://jira.example.com", "  ");
        let err = cfg.validate().expect_err("blank token should fail");
        assert!(err.to_string().contains("jira.token"));
    }

    #[test]
    fn validate_rejects_zero_intervals_but_allows_zero_progress_timeout() {
        let mut cfg = Config::new("https://jira.example.com", "t");
        cfg.timeout.progress_polling_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("https://jira.example.com", "t");
        cfg.timeout.progress_timeout_secs = 0;
        cfg.validate()
            .expect("zero progress timeout disables stuck detection");

        let mut cfg = Config::new("https://jira.example.com", "t");
        cfg.metrics.log_interval_secs = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn full_toml_round_trips_every_section() {
        let raw = r#"
            [jira]
            base_url = "https://jira.example.com"
            token = "pat"
            api_version = "v3"

            [cache]
            db_path = "/tmp/jml-cache.db"
            ttl_secs = 60
            manifest_ttl_secs = 3600

            [timeout]
            request_secs = 5
            bulk_request_secs = 20
            progress_timeout_secs = 30
            progress_polling_secs = 1
            cleanup_markers = false

            [ambiguity]
            user = "score"

            [logging]
            debug = true

            [metrics]
            log_interval_secs = 30
        "#;

        let cfg: Config = toml::from_str(raw).expect("toml should parse");
        cfg.validate().expect("should validate");
        assert_eq!(cfg.jira.api_version.path_segment(), "3");
        assert_eq!(cfg.cache.db_path.as_deref(), Some("/tmp/jml-cache.db"));
        assert_eq!(cfg.ambiguity.user, UserAmbiguityPolicy::Score);
        assert!(!cfg.timeout.cleanup_markers);
        assert!(cfg.logging.debug);
        assert_eq!(cfg.metrics.log_interval_secs, Some(30));
    }
}
