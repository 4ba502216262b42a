//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::JobPayload;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind, used to route a job to its handler.
///
/// Closed set: a new kind means a new variant here, a payload type, and a
/// handler registration (the runner matches exhaustively over [`JobKind::ALL`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Fetch and process one feed.
    #[serde(rename = "feed:fetch")]
    FeedFetch,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[JobKind::FeedFetch];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FeedFetch => "feed:fetch",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy: capped exponential backoff without jitter.
///
/// The delay after the n-th failed attempt is `base_delay * 2^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default attempt budget for jobs that do not set their own
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A queued job.
///
/// Owned by the queue; handlers receive a snapshot taken when the attempt
/// started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    /// Attempts started so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    /// Accepted for callers; dispatch order does not depend on it
    pub priority: i32,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest dispatch time for delayed jobs and backoff retries
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value, options: &JobOptions, default_max_attempts: u32) -> Self {
        let created_at = Utc::now();
        let scheduled_for = options
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| created_at + chrono::Duration::from_std(d).unwrap_or_default());

        Self {
            id: JobId::new(),
            kind,
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            priority: options.priority,
            dedupe_key: options.dedupe_key.clone(),
            created_at,
            scheduled_for,
            last_error: None,
        }
    }

    /// Decode the payload as `P`, checking that `P` belongs to this job's kind.
    pub fn payload_as<P>(&self) -> Result<P, PayloadError>
    where
        P: JobPayload + DeserializeOwned,
    {
        if self.kind != P::KIND {
            return Err(PayloadError::KindMismatch {
                expected: P::KIND,
                found: self.kind,
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Payload decoding error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload for {found} cannot be read as {expected}")]
    KindMismatch { expected: JobKind, found: JobKind },
    #[error("payload does not decode: {0}")]
    Decode(String),
}

/// Per-job options for `add`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
    pub priority: i32,
    pub dedupe_key: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Queued, not currently running
    pub waiting: usize,
    /// Currently running
    pub active: usize,
    /// Cumulative successes
    pub completed: u64,
    /// Cumulative jobs that ran out of attempts (or failed a contract)
    pub failed: u64,
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
