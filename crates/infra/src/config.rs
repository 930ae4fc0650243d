//! Process configuration loaded from `TASKHUB_*` environment variables.
//!
//! Load once at startup, then build the queue, cache and repositories from
//! it and pass them around as handles.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskhub_observability::{LogConfig, LogFormat};

use crate::jobs::JobQueueConfig;
use crate::retry::RetryConfig;

pub const WORKERS: &str = "TASKHUB_WORKERS";
pub const MAX_PENDING: &str = "TASKHUB_MAX_PENDING";
pub const POLL_INTERVAL_MS: &str = "TASKHUB_POLL_INTERVAL_MS";
pub const RETRY_MAX_ATTEMPTS: &str = "TASKHUB_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_MS: &str = "TASKHUB_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "TASKHUB_RETRY_MAX_DELAY_MS";
pub const RETRY_EXPONENTIAL_BASE: &str = "TASKHUB_RETRY_EXPONENTIAL_BASE";
pub const RETRY_JITTER: &str = "TASKHUB_RETRY_JITTER";
pub const CACHE_DEFAULT_TTL_SECS: &str = "TASKHUB_CACHE_DEFAULT_TTL_SECS";
pub const LOG_LEVEL: &str = "TASKHUB_LOG_LEVEL";
pub const LOG_FORMAT: &str = "TASKHUB_LOG_FORMAT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for cached repository reads; `None` keeps entries until invalidated.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: JobQueueConfig,
    /// Retry policy for repository operations on transient store failures
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from the process environment, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source, then validate. Unset
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let vars = Vars(&lookup);

        if let Some(workers) = vars.parse::<usize>(WORKERS)? {
            config.queue.workers = workers;
        }
        if let Some(max_pending) = vars.parse::<usize>(MAX_PENDING)? {
            // 0 disables admission control
            config.queue.max_pending = (max_pending > 0).then_some(max_pending);
        }
        if let Some(ms) = vars.parse::<u64>(POLL_INTERVAL_MS)? {
            config.queue.poll_interval = Duration::from_millis(ms);
        }

        if let Some(max_attempts) = vars.parse::<u32>(RETRY_MAX_ATTEMPTS)? {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(ms) = vars.parse::<u64>(RETRY_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>(RETRY_MAX_DELAY_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(base) = vars.parse::<f64>(RETRY_EXPONENTIAL_BASE)? {
            config.retry.exponential_base = base;
        }
        if let Some(jitter) = vars.flag(RETRY_JITTER)? {
            config.retry.jitter = jitter;
        }
        // Jobs back off with the same parameters as repository operations.
        config.queue.retry = config.retry.clone();

        if let Some(secs) = vars.parse::<u64>(CACHE_DEFAULT_TTL_SECS)? {
            config.cache.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(level) = vars.get(LOG_LEVEL) {
            config.log.level = level;
        }
        if let Some(format) = vars.parse::<LogFormat>(LOG_FORMAT)? {
            config.log.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.workers < 1 {
            return Err(ConfigError::invalid(
                WORKERS,
                self.queue.workers.to_string(),
                "at least one worker is required",
            ));
        }
        self.retry
            .validate()
            .map_err(|err| ConfigError::invalid("retry", format!("{:?}", self.retry), err.to_string()))?;
        self.queue
            .retry
            .validate()
            .map_err(|err| ConfigError::invalid("queue.retry", format!("{:?}", self.queue.retry), err.to_string()))?;
        Ok(())
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| raw.parse::<T>().map_err(|err| ConfigError::invalid(key, raw.clone(), err.to_string())))
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
        }
    }
}
