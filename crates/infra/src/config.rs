//! Configuration loading and representation.
//!
//! Every setting has a default and can be overridden through environment
//! variables. Parsing goes through a lookup function so tests can feed a map
//! instead of mutating the process environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::executor::JobExecutorConfig;
use crate::jobs::reaper::ReaperConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("missing required setting {0}")]
    Missing(String),
}

/// Enqueue-time limits and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Lowest accepted priority (inclusive).
    pub priority_min: i32,
    /// Highest accepted priority (inclusive).
    pub priority_max: i32,
    /// `max_attempts` used when the caller does not set one.
    pub default_max_attempts: u32,
    /// Backoff base used when the caller does not set one.
    pub default_retry_backoff_seconds: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_min: -100,
            priority_max: 100,
            default_max_attempts: 3,
            default_retry_backoff_seconds: 30,
        }
    }
}

impl QueueConfig {
    pub fn priority_range(&self) -> std::ops::RangeInclusive<i32> {
        self.priority_min..=self.priority_max
    }
}

/// Which job store backs the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Job store connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

/// All settings for a queue process.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub queue: QueueConfig,
    pub executor: JobExecutorConfig,
    pub reaper: ReaperConfig,
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from a fixed map (tests, embedded use).
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            priority_min: parse_or(&lookup, "KITQUEUE_PRIORITY_MIN", queue_defaults.priority_min)?,
            priority_max: parse_or(&lookup, "KITQUEUE_PRIORITY_MAX", queue_defaults.priority_max)?,
            default_max_attempts: parse_or(
                &lookup,
                "KITQUEUE_DEFAULT_MAX_ATTEMPTS",
                queue_defaults.default_max_attempts,
            )?,
            default_retry_backoff_seconds: parse_or(
                &lookup,
                "KITQUEUE_DEFAULT_BACKOFF_SECONDS",
                queue_defaults.default_retry_backoff_seconds,
            )?,
        };
        if queue.priority_min > queue.priority_max {
            return Err(ConfigError::Invalid {
                key: "KITQUEUE_PRIORITY_MIN".to_string(),
                value: queue.priority_min.to_string(),
            });
        }
        if queue.default_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "KITQUEUE_DEFAULT_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
            });
        }

        let mut executor = JobExecutorConfig::default();
        if let Some(worker_id) = lookup("KITQUEUE_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            executor.worker_id = worker_id.trim().to_string();
        }
        if let Some(types) = lookup("KITQUEUE_JOB_TYPES") {
            let types: Vec<String> = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            executor.job_types = if types.is_empty() { None } else { Some(types) };
        }
        executor.lease_duration = Duration::from_secs(positive(
            &lookup,
            "KITQUEUE_LEASE_SECONDS",
            executor.lease_duration.as_secs(),
        )?);
        executor.poll_interval = Duration::from_millis(positive(
            &lookup,
            "KITQUEUE_POLL_INTERVAL_MS",
            executor.poll_interval.as_millis() as u64,
        )?);
        executor.concurrency =
            positive(&lookup, "KITQUEUE_CONCURRENCY", executor.concurrency as u64)? as usize;

        let mut reaper = ReaperConfig::default();
        reaper.interval = Duration::from_secs(positive(
            &lookup,
            "KITQUEUE_REAPER_INTERVAL_SECONDS",
            reaper.interval.as_secs(),
        )?);
        reaper.batch_size =
            positive(&lookup, "KITQUEUE_REAPER_BATCH", reaper.batch_size as u64)? as usize;

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        let kind = match lookup("KITQUEUE_STORE").as_deref().map(str::trim) {
            Some("postgres") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "KITQUEUE_STORE".to_string(),
                    value: other.to_string(),
                });
            }
            None if database_url.is_some() => StoreKind::Postgres,
            None => StoreKind::Memory,
        };
        if kind == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }
        let store = StoreConfig {
            kind,
            database_url,
            max_connections: positive(
                &lookup,
                "KITQUEUE_DB_MAX_CONNECTIONS",
                StoreConfig::default().max_connections as u64,
            )? as u32,
        };

        Ok(Self {
            queue,
            executor,
            reaper,
            store,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn positive<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(value)
}
