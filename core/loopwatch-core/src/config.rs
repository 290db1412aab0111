//! Watcher configuration.
//!
//! Loaded from `~/.loopwatch/config.toml` when present, then overridden by
//! `LOOPWATCH_*` environment variables. A missing file is not an error.
//!
//! ```toml
//! base_url = "http://127.0.0.1:3000"
//! poll_interval_ms = 2000
//!
//! [stream]
//! retry_interval_ms = 3000
//! max_retries = 5
//! buffer_capacity = 500
//! backoff = "fixed"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Result, WatchError};
use crate::stream::{BackoffStrategy, ReconnectPolicy};

pub const BASE_URL_ENV: &str = "LOOPWATCH_BASE_URL";
pub const POLL_INTERVAL_ENV: &str = "LOOPWATCH_POLL_INTERVAL_MS";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub stream: StreamConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            poll_interval_ms: 2000,
            request_timeout_ms: None,
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub buffer_capacity: usize,
    pub backoff: BackoffKind,
    pub max_retry_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3000,
            max_retries: 5,
            buffer_capacity: 500,
            backoff: BackoffKind::Fixed,
            max_retry_interval_ms: 30_000,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let strategy = match self.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed,
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                max_interval: Duration::from_millis(self.max_retry_interval_ms),
            },
        };
        ReconnectPolicy {
            interval: Duration::from_millis(self.retry_interval_ms),
            max_retries: self.max_retries,
            strategy,
        }
    }
}

/// What the live stream is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamScope {
    Loop(String),
    Session(String),
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(WatchError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stream.retry_interval_ms == 0 {
            return Err(WatchError::InvalidConfig(
                "stream.retry_interval_ms must be greater than zero".to_string(),
            ));
        }
        let base = self.base()?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(WatchError::InvalidConfig(format!(
                "base_url must be http or https, got {}",
                base.scheme()
            )));
        }
        Ok(())
    }

    pub fn base(&self) -> Result<Url> {
        Url::parse(&self.base_url).map_err(|source| WatchError::InvalidUrl {
            url: self.base_url.clone(),
            source,
        })
    }

    /// `{base}/api/loops/{id}/stream` or `{base}/api/sessions/{id}/tail`.
    pub fn stream_url(&self, scope: &StreamScope) -> Result<Url> {
        match scope {
            StreamScope::Loop(id) => self.endpoint(&["api", "loops", id.as_str(), "stream"]),
            StreamScope::Session(id) => self.endpoint(&["api", "sessions", id.as_str(), "tail"]),
        }
    }

    /// `{base}/api/loops/{id}/runs`.
    pub fn snapshot_url(&self, loop_id: &str) -> Result<Url> {
        self.endpoint(&["api", "loops", loop_id, "runs"])
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base()?;
        url.path_segments_mut()
            .map_err(|_| {
                WatchError::InvalidConfig(format!("base_url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Applies `LOOPWATCH_*` overrides using `lookup` as the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.base_url = value.trim().to_string();
        }
        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(err) => {
                    tracing::warn!(value = %value, error = %err, "Ignoring invalid poll interval override")
                }
            }
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".loopwatch").join("config.toml"))
}

/// Loads and validates the watcher configuration.
///
/// `path` defaults to [`default_config_path`]; a missing file yields the
/// defaults. Environment overrides are applied before validation.
pub fn load_config(path: Option<PathBuf>) -> Result<WatchConfig> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

pub fn load_config_with_env<F>(path: Option<PathBuf>, lookup: F) -> Result<WatchConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path.or_else(default_config_path) {
        Some(path) if path.exists() => read_config_file(path)?,
        _ => WatchConfig::default(),
    };
    config.apply_env_overrides(lookup);
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: PathBuf) -> Result<WatchConfig> {
    let content = fs_err::read_to_string(&path).map_err(|source| WatchError::ConfigRead {
        path: path.clone(),
        source,
    })?;
    toml::from_str::<WatchConfig>(&content).map_err(|err| WatchError::ConfigMalformed {
        path,
        details: err.to_string(),
    })
}
