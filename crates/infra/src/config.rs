//! Environment configuration.
//!
//! Plain key-value settings read once at startup; empty values count as unset.

use std::str::FromStr;
use std::time::Duration;

use feedsync_observability::LogLevel;

use crate::guard::GuardThresholds;
use crate::jobs::{QueueConfig, RetryPolicy};
use crate::lock::LockSettings;
use crate::scheduler::{CronSchedule, SchedulerConfig};

/// Configuration error. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// How the runner drives the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Tick on the cron schedule until shutdown.
    Schedule,
    /// Tick once, drain, exit.
    Once,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "schedule" => Ok(RunMode::Schedule),
            "once" => Ok(RunMode::Once),
            other => Err(format!("expected `schedule` or `once`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub log_level: LogLevel,
    pub enabled: bool,
    pub mode: RunMode,
    pub schedule: CronSchedule,
    pub scheduler_timeout: Duration,
    pub drain_wait: Duration,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub lock_fail_open: bool,
    pub scheduler_lock_ttl: Duration,
    pub feed_lock_ttl: Duration,
    pub feed_lock_retries: u32,
    pub feed_lock_retry_delay: Duration,
    pub job_max_attempts: u32,
    /// Deadline for one processor call inside the feed worker.
    pub job_timeout: Option<Duration>,
    pub job_queue_capacity: Option<usize>,
    pub memory_warn_mb: u64,
    pub memory_max_mb: u64,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let cron = env.get("FEED_SCHEDULER_CRON").unwrap_or_else(|| "0 */10 * * * *".to_string());
        let schedule = CronSchedule::parse(&cron).map_err(|e| ConfigError::Invalid {
            key: "FEED_SCHEDULER_CRON",
            value: cron.clone(),
            reason: e.to_string(),
        })?;

        let log_level = match env.get("LOG_LEVEL") {
            None => LogLevel::default(),
            Some(raw) => LogLevel::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value: raw.clone(),
                reason: "expected debug, info, warn or error".to_string(),
            })?,
        };

        let memory_warn_mb: u64 = env.parse("MEMORY_WARN_MB")?.unwrap_or(512);
        let memory_max_mb: u64 = env.parse("MEMORY_MAX_MB")?.unwrap_or(1024);
        if memory_warn_mb > memory_max_mb {
            return Err(ConfigError::Invalid {
                key: "MEMORY_WARN_MB",
                value: memory_warn_mb.to_string(),
                reason: format!("must not exceed MEMORY_MAX_MB ({memory_max_mb})"),
            });
        }

        Ok(Self {
            log_level,
            enabled: env.flag("FEED_INGESTION_ENABLED")?.unwrap_or(true),
            mode: env.parse("FEED_SCHEDULER_MODE")?.unwrap_or(RunMode::Schedule),
            schedule,
            scheduler_timeout: env.millis("FEED_SCHEDULER_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(300)),
            drain_wait: env.millis("FEED_DRAIN_WAIT_MS")?.unwrap_or(Duration::from_secs(60)),
            redis_url: env.get("REDIS_URL"),
            database_url: env.get("DATABASE_URL"),
            lock_fail_open: env.flag("LOCK_FAIL_OPEN")?.unwrap_or(true),
            scheduler_lock_ttl: env.positive_millis("SCHEDULER_LOCK_TTL_MS")?.unwrap_or(Duration::from_secs(600)),
            feed_lock_ttl: env.positive_millis("FEED_LOCK_TTL_MS")?.unwrap_or(Duration::from_secs(300)),
            feed_lock_retries: env.positive("FEED_LOCK_RETRIES")?.unwrap_or(3),
            feed_lock_retry_delay: env.millis("FEED_LOCK_RETRY_DELAY_MS")?.unwrap_or(Duration::from_millis(500)),
            job_max_attempts: env.positive("JOB_MAX_ATTEMPTS")?.unwrap_or(3),
            job_timeout: env.positive_millis("JOB_TIMEOUT_MS")?,
            job_queue_capacity: env.positive("JOB_QUEUE_CAPACITY")?,
            memory_warn_mb,
            memory_max_mb,
        })
    }

    /// `DATABASE_URL`, required by the runner.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.enabled,
            tick_timeout: self.scheduler_timeout,
            drain_wait: self.drain_wait,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry: RetryPolicy {
                max_attempts: self.job_max_attempts,
                ..RetryPolicy::default()
            },
            capacity: self.job_queue_capacity,
            ..QueueConfig::default()
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            scheduler_ttl: self.scheduler_lock_ttl,
            feed_ttl: self.feed_lock_ttl,
            feed_max_attempts: self.feed_lock_retries,
            feed_retry_delay: self.feed_lock_retry_delay,
            fail_open: self.lock_fail_open,
        }
    }

    pub fn guard_thresholds(&self) -> GuardThresholds {
        GuardThresholds::from_megabytes(self.memory_warn_mb, self.memory_max_mb)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn positive<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + PartialEq + Default,
        T::Err: std::fmt::Display,
    {
        match self.parse::<T>(key)? {
            Some(v) if v == T::default() => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn positive_millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.positive::<u64>(key)?.map(Duration::from_millis))
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: "expected true or false".to_string(),
                }),
            })
            .transpose()
    }
}
