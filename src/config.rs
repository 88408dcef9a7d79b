//! Process configuration.
//!
//! Read once at startup from the environment (with `.env` support) into a
//! closed record that is passed by reference everywhere. A missing required
//! variable or an unparsable value is fatal at process start.

use crate::error::{IngestError, IngestResult};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.tickerfeed.io/v1";

#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream provider API key. Required.
    pub upstream_api_key: String,
    /// SQLite database path. Required.
    pub database_url: String,
    pub upstream_base_url: String,

    /// Daily schedule, UTC wall clock.
    pub schedule_hour: u32,
    pub schedule_minute: u32,
    /// A fire missed by more than this is skipped, never caught up.
    pub misfire_grace_secs: u64,

    pub max_concurrent_symbols: usize,
    pub inter_group_pause_secs: u64,
    pub inter_symbol_stagger_secs: u64,
    pub chunk_days: i64,
    pub default_history_days: i64,
    pub gap_retry_max_attempts: u32,

    pub upstream_call_timeout_secs: u64,
    pub job_deadline_secs: u64,

    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub rate_burst: u32,

    /// Prometheus exporter port; 0 disables the exporter.
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> IngestResult<Self> {
        dotenv::dotenv().ok();

        let upstream_api_key = required("UPSTREAM_API_KEY")?;
        let database_url = required("DATABASE_URL")?;
        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_BASE_URL.to_string());

        let config = Self {
            upstream_api_key,
            database_url,
            upstream_base_url,
            schedule_hour: parsed("BACKFILL_SCHEDULE_HOUR", 2)?,
            schedule_minute: parsed("BACKFILL_SCHEDULE_MINUTE", 0)?,
            misfire_grace_secs: parsed("SCHEDULE_MISFIRE_GRACE_SECONDS", 600)?,
            max_concurrent_symbols: parsed("MAX_CONCURRENT_SYMBOLS", 3)?,
            inter_group_pause_secs: parsed("INTER_GROUP_PAUSE_SECONDS", 15)?,
            inter_symbol_stagger_secs: parsed("INTER_SYMBOL_STAGGER_SECONDS", 5)?,
            chunk_days: parsed("CHUNK_DAYS", 365)?,
            default_history_days: parsed("DEFAULT_HISTORY_DAYS", 365)?,
            gap_retry_max_attempts: parsed("GAP_RETRY_MAX_ATTEMPTS", 2)?,
            upstream_call_timeout_secs: parsed("UPSTREAM_CALL_TIMEOUT_SECONDS", 30)?,
            job_deadline_secs: parsed("JOB_DEADLINE_SECONDS", 14_400)?,
            rate_limit: parsed("UPSTREAM_RATE_LIMIT", 60)?,
            rate_window_secs: parsed("UPSTREAM_RATE_WINDOW_SECONDS", 60)?,
            rate_burst: parsed("UPSTREAM_RATE_BURST", 10)?,
            metrics_port: parsed("METRICS_PORT", 9100)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> IngestResult<()> {
        if self.schedule_hour > 23 {
            return Err(IngestError::Config(format!(
                "BACKFILL_SCHEDULE_HOUR must be 0-23, got {}",
                self.schedule_hour
            )));
        }
        if self.schedule_minute > 59 {
            return Err(IngestError::Config(format!(
                "BACKFILL_SCHEDULE_MINUTE must be 0-59, got {}",
                self.schedule_minute
            )));
        }
        if self.max_concurrent_symbols == 0 {
            return Err(IngestError::Config(
                "MAX_CONCURRENT_SYMBOLS must be at least 1".to_string(),
            ));
        }
        if self.chunk_days < 1 {
            return Err(IngestError::Config(format!(
                "CHUNK_DAYS must be at least 1, got {}",
                self.chunk_days
            )));
        }
        if self.default_history_days < 1 {
            return Err(IngestError::Config(format!(
                "DEFAULT_HISTORY_DAYS must be at least 1, got {}",
                self.default_history_days
            )));
        }
        if self.rate_limit == 0 || self.rate_window_secs == 0 {
            return Err(IngestError::Config(
                "UPSTREAM_RATE_LIMIT and UPSTREAM_RATE_WINDOW_SECONDS must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn upstream_call_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_call_timeout_secs)
    }

    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

fn required(name: &str) -> IngestResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(IngestError::Config(format!("{name} is required"))),
    }
}

fn parsed<T>(name: &str, default: T) -> IngestResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            IngestError::Config(format!("{name}: cannot parse {raw:?}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}
