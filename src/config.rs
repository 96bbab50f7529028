use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::fetch::{api, scrape, RetryPolicy};
use crate::metrics::{Bucketing, MetricsOptions};
use crate::model::RepoId;

pub const CONFIG_FILE: &str = ".pr-ledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from `.pr-ledger.toml`.
///
/// Everything except `user` and the acquisition targets has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GitHub login whose contributions are collected.
    pub user: String,
    /// Organizations (or user accounts) expanded into all their repositories.
    pub organizations: Vec<String>,
    /// Extra repositories as `owner/name`.
    pub repositories: Vec<String>,
    /// Repositories skipped even when an organization lists them.
    pub exclude_repositories: Vec<String>,
    #[serde(deserialize_with = "instant")]
    pub since: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "instant")]
    pub until: Option<DateTime<Utc>>,
    /// Repository jobs running at once.
    pub concurrency: usize,
    /// API requests allowed per rolling window.
    pub rate_limit_ceiling: u32,
    pub rate_limit_window_secs: u64,
    pub request_timeout_secs: u64,
    pub bucketing: Bucketing,
    /// Reporting timezone as minutes east of UTC.
    pub timezone_offset_minutes: i32,
    pub store_path: PathBuf,
    pub retry: RetryConfig,
    pub scrape: ScrapeConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: String::new(),
            organizations: Vec::new(),
            repositories: Vec::new(),
            exclude_repositories: Vec::new(),
            since: None,
            until: None,
            concurrency: 4,
            rate_limit_ceiling: 5000,
            rate_limit_window_secs: 3600,
            request_timeout_secs: 30,
            bucketing: Bucketing::Week,
            timezone_offset_minutes: 0,
            store_path: PathBuf::from(".pr-ledger/ledger.json"),
            retry: RetryConfig::default(),
            scrape: ScrapeConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub enabled: bool,
    /// Search and conversation pages loaded at once.
    pub concurrency: usize,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub base_url: String,
    /// `user_session` cookie value. If None, falls back to GITHUB_SESSION.
    pub session: Option<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 2,
            requests_per_minute: 30,
            burst: 5,
            base_url: scrape::DEFAULT_BASE_URL.to_string(),
            session: None,
        }
    }
}

impl std::fmt::Debug for ScrapeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeConfig")
            .field("enabled", &self.enabled)
            .field("concurrency", &self.concurrency)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("burst", &self.burst)
            .field("base_url", &self.base_url)
            .field("session", &self.session.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// GitHub API token. If None, falls back to GITHUB_TOKEN.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: api::DEFAULT_BASE_URL.to_string(),
            token: None,
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

fn instant<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|v| {
            parse_instant(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid date or timestamp: {v}")))
        })
        .transpose()
}

impl Config {
    /// Load configuration from `.pr-ledger.toml` in the current directory.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };

        if config.user.is_empty() {
            if let Ok(user) = std::env::var("GITHUB_USER") {
                config.user = user;
            }
        }

        Ok(config)
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings that cannot drive an acquisition run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));

        if self.user.trim().is_empty() {
            return invalid("user is required (or set GITHUB_USER)");
        }
        if self.organizations.is_empty() && self.repositories.is_empty() {
            return invalid("at least one organization or repository is required");
        }
        for name in self.repositories.iter().chain(&self.exclude_repositories) {
            RepoId::parse(name).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return invalid("since must not be after until");
            }
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.rate_limit_ceiling == 0 || self.rate_limit_window_secs == 0 {
            return invalid("rate limit ceiling and window must be positive");
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.utc_offset().is_none() {
            return invalid("timezone_offset_minutes must be within one day of UTC");
        }
        if self.scrape.enabled && (self.scrape.concurrency == 0 || self.scrape.requests_per_minute == 0) {
            return invalid("scrape concurrency and requests_per_minute must be positive");
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.timezone_offset_minutes.checked_mul(60)?)
    }

    pub fn metrics_options(&self) -> MetricsOptions {
        MetricsOptions {
            bucketing: self.bucketing,
            utc_offset: self.utc_offset().unwrap_or(MetricsOptions::default().utc_offset),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}
