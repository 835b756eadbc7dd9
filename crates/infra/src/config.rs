//! Engine configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | required for Postgres |
//! | `BGMIGRATE_WORKERS` | `4` |
//! | `BGMIGRATE_DB_MAX_CONNECTIONS` | workers + 2 |
//! | `BGMIGRATE_POLL_INTERVAL_MS` | `100` |
//! | `BGMIGRATE_MAX_ATTEMPTS` | `5` |
//! | `BGMIGRATE_BASE_DELAY_MS` | `500` |
//! | `BGMIGRATE_MAX_DELAY_MS` | `60000` |
//! | `BGMIGRATE_LEASE_SECS` | `300` |
//! | `BGMIGRATE_DRAIN_DELAYS` | `wait` (or `immediate`) |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{DelayPolicy, DrainConfig, RetryPolicy, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub workers: usize,
    pub max_connections: u32,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub lease: Duration,
    pub drain_delays: DelayPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workers: 4,
            max_connections: 6,
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            lease: Duration::from_secs(300),
            drain_delays: DelayPolicy::Wait,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let workers: usize = parse_or(&get, "BGMIGRATE_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(invalid("BGMIGRATE_WORKERS", "0", "must be at least 1"));
        }
        let fallback_connections = u32::try_from(workers + 2).unwrap_or(u32::MAX);
        let max_connections = parse_or(&get, "BGMIGRATE_DB_MAX_CONNECTIONS", fallback_connections)?;

        let poll_interval = millis_or(&get, "BGMIGRATE_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let max_attempts: u32 = parse_or(&get, "BGMIGRATE_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("BGMIGRATE_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let base_delay = millis_or(&get, "BGMIGRATE_BASE_DELAY_MS", defaults.retry.base_delay)?;
        let max_delay = millis_or(&get, "BGMIGRATE_MAX_DELAY_MS", defaults.retry.max_delay)?;
        if max_delay < base_delay {
            return Err(invalid(
                "BGMIGRATE_MAX_DELAY_MS",
                &max_delay.as_millis().to_string(),
                "must not be below BGMIGRATE_BASE_DELAY_MS",
            ));
        }
        let lease_secs: u64 = parse_or(&get, "BGMIGRATE_LEASE_SECS", defaults.lease.as_secs())?;
        if lease_secs == 0 {
            return Err(invalid("BGMIGRATE_LEASE_SECS", "0", "must be at least 1"));
        }
        let lease = Duration::from_secs(lease_secs);

        let drain_delays = match get("BGMIGRATE_DRAIN_DELAYS") {
            None => defaults.drain_delays,
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "wait" => DelayPolicy::Wait,
                "immediate" => DelayPolicy::Immediate,
                _ => {
                    return Err(invalid(
                        "BGMIGRATE_DRAIN_DELAYS",
                        &v,
                        "expected `wait` or `immediate`",
                    ));
                }
            },
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            workers,
            max_connections,
            poll_interval,
            retry: RetryPolicy {
                max_attempts,
                base_delay,
                max_delay,
                ..defaults.retry
            },
            lease,
            drain_delays,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(self.poll_interval)
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_delay_policy(self.drain_delays)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let fallback = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, key, fallback).map(Duration::from_millis)
}
