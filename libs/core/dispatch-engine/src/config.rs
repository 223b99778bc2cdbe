//! Engine configuration (spec §6.3).
//!
//! Builder pattern mirrors the teacher's `WorkerConfig`; `from_env` follows
//! the same `FromEnv`-with-typed-defaults convention `core_config` uses
//! elsewhere in this codebase, kept self-contained here rather than
//! depending on that crate, the same way `stream-worker` itself never
//! pulled in `core_config`.

use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub rate_limit_per_sec: f64,
    pub retry_delays_ms: Vec<u64>,
    pub dlq_threshold: u32,
    pub processing_timeout: Duration,
    pub max_queue_size: Option<usize>,
    pub heartbeat_interval: Duration,
    pub unhealthy_after: Duration,
    pub missed_heartbeat_limit: u32,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_rate_limit(mut self, per_sec: f64) -> Self {
        self.rate_limit_per_sec = per_sec;
        self
    }

    pub fn with_retry_delays_ms(mut self, delays: Vec<u64>) -> Self {
        self.retry_delays_ms = delays;
        self
    }

    pub fn with_dlq_threshold(mut self, threshold: u32) -> Self {
        self.dlq_threshold = threshold;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_max_queue_size(mut self, size: Option<usize>) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_unhealthy_after(mut self, duration: Duration) -> Self {
        self.unhealthy_after = duration;
        self
    }

    pub fn with_missed_heartbeat_limit(mut self, limit: u32) -> Self {
        self.missed_heartbeat_limit = limit;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let retry_delays_ms = match env::var("ENGINE_RETRY_DELAYS_MS") {
            Ok(raw) => parse_delay_list(&raw)?,
            Err(_) => vec![1000, 5000, 15000],
        };

        let max_queue_size = match env::var("ENGINE_MAX_QUEUE_SIZE") {
            Ok(raw) => Some(parse_env("ENGINE_MAX_QUEUE_SIZE", &raw)?),
            Err(_) => None,
        };

        Ok(Self {
            max_concurrent: env_or_default("ENGINE_MAX_CONCURRENT", 100)?,
            rate_limit_per_sec: env_or_default("ENGINE_RATE_LIMIT", 10.0)?,
            retry_delays_ms,
            dlq_threshold: env_or_default("ENGINE_DLQ_THRESHOLD", 3)?,
            processing_timeout: Duration::from_millis(env_or_default(
                "ENGINE_PROCESSING_TIMEOUT_MS",
                30_000,
            )?),
            max_queue_size,
            heartbeat_interval: Duration::from_secs(env_or_default(
                "ENGINE_HEARTBEAT_INTERVAL_SECS",
                30,
            )?),
            unhealthy_after: Duration::from_secs(env_or_default("ENGINE_UNHEALTHY_AFTER_SECS", 60)?),
            missed_heartbeat_limit: env_or_default("ENGINE_MISSED_HEARTBEATS", 3)?,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            rate_limit_per_sec: 10.0,
            retry_delays_ms: vec![1000, 5000, 15000],
            dlq_threshold: 3,
            processing_timeout: Duration::from_secs(30),
            max_queue_size: None,
            heartbeat_interval: Duration::from_secs(30),
            unhealthy_after: Duration::from_secs(60),
            missed_heartbeat_limit: 3,
        }
    }
}

fn env_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_env(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn parse_delay_list(raw: &str) -> Result<Vec<u64>, ConfigError> {
    raw.split(',')
        .map(|s| {
            s.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::ParseError {
                key: "ENGINE_RETRY_DELAYS_MS".to_string(),
                details: e.to_string(),
            })
        })
        .collect()
}
