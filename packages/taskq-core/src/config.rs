//! Runtime configuration loaded from environment variables.
//!
//! Mirrors `packages/server/src/config.rs::Config::from_env`: `dotenvy`
//! loads a `.env` file if present, required values fail fast via
//! `anyhow::Context`, everything else falls back to the spec's defaults
//! (§6.2).

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler_poll_delay: Duration,
    pub scheduler_lease_duration: Duration,
    pub consumer_max_concurrency: usize,
    pub consumer_poll_delay: Duration,
    pub consumer_ping_delay: Duration,
    pub dead_task_timeout: Duration,
    pub task_retention: u64,
    pub task_record_ttl: Duration,
    /// When set, the networked (Redis-compatible) backend is used instead of
    /// the in-process one.
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler_poll_delay: Duration::from_secs(5),
            scheduler_lease_duration: Duration::from_secs(60),
            consumer_max_concurrency: 50,
            consumer_poll_delay: Duration::from_millis(100),
            consumer_ping_delay: Duration::from_secs(1),
            dead_task_timeout: Duration::from_secs(5 * 60),
            task_retention: 50,
            task_record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            redis_url: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to the
    /// spec's documented defaults for anything unset. Loads a `.env` file
    /// first if present (development convenience, mirroring the teacher's
    /// `Config::from_env`).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        let defaults = Self::default();

        Ok(Self {
            scheduler_poll_delay: env_duration_secs("TASKQ_SCHEDULER_POLL_DELAY_SECS", defaults.scheduler_poll_delay)?,
            scheduler_lease_duration: env_duration_secs(
                "TASKQ_SCHEDULER_LEASE_DURATION_SECS",
                defaults.scheduler_lease_duration,
            )?,
            consumer_max_concurrency: env_usize("TASKQ_CONSUMER_MAX_CONCURRENCY", defaults.consumer_max_concurrency)?,
            consumer_poll_delay: env_duration_millis(
                "TASKQ_CONSUMER_POLL_DELAY_MS",
                defaults.consumer_poll_delay,
            )?,
            consumer_ping_delay: env_duration_millis("TASKQ_CONSUMER_PING_DELAY_MS", defaults.consumer_ping_delay)?,
            dead_task_timeout: env_duration_secs("TASKQ_DEAD_TASK_TIMEOUT_SECS", defaults.dead_task_timeout)?,
            task_retention: env_u64("TASKQ_TASK_RETENTION", defaults.task_retention)?,
            task_record_ttl: env_duration_secs("TASKQ_TASK_RECORD_TTL_SECS", defaults.task_record_ttl)?,
            redis_url: env::var("TASKQ_REDIS_URL").ok(),
        })
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => Ok(Duration::from_secs(
            raw.parse().with_context(|| format!("{key} must be a valid number of seconds"))?,
        )),
        Err(_) => Ok(default),
    }
}

fn env_duration_millis(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => Ok(Duration::from_millis(
            raw.parse().with_context(|| format!("{key} must be a valid number of milliseconds"))?,
        )),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("{key} must be a positive integer")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("{key} must be a positive integer")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_spec_values() {
        let config = Config::default();
        assert_eq!(config.scheduler_poll_delay, Duration::from_secs(5));
        assert_eq!(config.scheduler_lease_duration, Duration::from_secs(60));
        assert_eq!(config.consumer_max_concurrency, 50);
        assert_eq!(config.consumer_poll_delay, Duration::from_millis(100));
        assert_eq!(config.consumer_ping_delay, Duration::from_secs(1));
        assert_eq!(config.dead_task_timeout, Duration::from_secs(5 * 60));
        assert_eq!(config.task_retention, 50);
        assert_eq!(config.task_record_ttl, Duration::from_secs(7 * 24 * 60 * 60));
    }
}
