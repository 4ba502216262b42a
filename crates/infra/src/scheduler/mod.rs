//! Periodic feed scheduler.
//!
//! Each tick is independent:
//!
//! 1. skip if this process's previous tick is still running
//! 2. skip if ingestion is disabled
//! 3. skip if another instance holds the scheduler lock (no retry)
//! 4. find due feeds and enqueue one `feed:fetch` job per feed, under a
//!    wall-clock deadline
//! 5. release the scheduler lock on every path
//!
//! Entry points: [`FeedScheduler::run_forever`] on a cron schedule, and
//! [`FeedScheduler::run_once`] which drains the queue before returning.

pub mod cron;
pub mod overlap;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use feedsync_core::{FeedId, FeedRepository, RepositoryError};
use feedsync_observability::{ErrorDetail, Logger};

use crate::jobs::{FeedFetchPayload, JobOptions, JobQueue, JobQueueError};
use crate::lock::{LockError, LockFactory};

pub use self::cron::CronSchedule;
pub use overlap::{DeadlineExceeded, OverlapGuard, RunningToken, TimeoutCallback};

/// Scheduler error. Aborts the current tick only.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler lock failed: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("feed discovery timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

impl From<DeadlineExceeded> for SchedulerError {
    fn from(e: DeadlineExceeded) -> Self {
        Self::Timeout(e.0)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Feature flag for the whole subsystem.
    pub enabled: bool,
    /// Deadline for discovery + enqueue.
    pub tick_timeout: Duration,
    /// How long `run_once` (and shutdown) waits for the queue to drain.
    pub drain_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_timeout: Duration::from_secs(300),
            drain_wait: Duration::from_secs(60),
        }
    }
}

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    AlreadyRunning,
    Disabled,
    LockHeld,
}

/// A feed that could not be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleError {
    pub feed_id: FeedId,
    pub feed_name: String,
    pub error: String,
}

/// Result of one discovery + enqueue pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSummary {
    pub scheduled: usize,
    /// Feeds that already had a job queued.
    pub skipped: usize,
    pub errors: Vec<ScheduleError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed(ScheduleSummary),
}

struct Inner {
    repo: Arc<dyn FeedRepository>,
    queue: JobQueue,
    locks: LockFactory,
    config: SchedulerConfig,
    overlap: OverlapGuard,
    log: Logger,
}

/// Periodic driver that turns due feeds into queued jobs.
#[derive(Clone)]
pub struct FeedScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FeedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedScheduler")
            .field("config", &self.inner.config)
            .field("overlap", &self.inner.overlap)
            .finish_non_exhaustive()
    }
}

impl FeedScheduler {
    pub fn new(repo: Arc<dyn FeedRepository>, queue: JobQueue, locks: LockFactory, config: SchedulerConfig) -> Self {
        Self::with_overlap_guard(repo, queue, locks, config, OverlapGuard::new(config.tick_timeout))
    }

    /// Use a custom overlap guard (e.g. one with a timeout alert callback).
    pub fn with_overlap_guard(
        repo: Arc<dyn FeedRepository>,
        queue: JobQueue,
        locks: LockFactory,
        config: SchedulerConfig,
        overlap: OverlapGuard,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                queue,
                locks,
                config,
                overlap,
                log: Logger::new("feed-scheduler"),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// Whether a tick is currently executing in this process.
    pub fn is_running(&self) -> bool {
        self.inner.overlap.is_running()
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> Result<TickOutcome, SchedulerError> {
        let Some(_running) = self.inner.overlap.try_start() else {
            self.inner
                .log
                .warn("previous scheduler run still executing; skipping tick", ());
            return Ok(TickOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        if !self.inner.config.enabled {
            self.inner.log.info("feed ingestion disabled; skipping tick", ());
            return Ok(TickOutcome::Skipped(SkipReason::Disabled));
        }

        let mut lock = self.inner.locks.scheduler_lock();
        if !lock.acquire().await? {
            self.inner.log.info(
                "scheduler lock held by another instance; skipping tick",
                json!({ "key": lock.key() }),
            );
            return Ok(TickOutcome::Skipped(SkipReason::LockHeld));
        }

        let result = self.inner.overlap.run(self.schedule_due_feeds()).await;

        if let Err(e) = lock.release().await {
            self.inner.log.error(
                "failed to release scheduler lock",
                ErrorDetail::of(&e),
                json!({ "key": lock.key() }),
            );
        }

        let summary = result??;
        self.inner.log.info(
            "scheduler run finished",
            json!({
                "scheduled": summary.scheduled,
                "skipped": summary.skipped,
                "errors": serde_json::to_value(&summary.errors).unwrap_or_default(),
            }),
        );
        Ok(TickOutcome::Completed(summary))
    }

    async fn schedule_due_feeds(&self) -> Result<ScheduleSummary, SchedulerError> {
        let feeds = self.inner.repo.find_enabled_due().await?;
        if feeds.is_empty() {
            self.inner.log.info("no feeds due", ());
            return Ok(ScheduleSummary::default());
        }

        let mut summary = ScheduleSummary::default();
        for feed in &feeds {
            let options = JobOptions::new().with_dedupe_key(format!("feed:{}", feed.id));
            match self.inner.queue.add_typed(&FeedFetchPayload::from(feed), options) {
                Ok(job) => {
                    summary.scheduled += 1;
                    self.inner.log.debug(
                        "feed job enqueued",
                        json!({ "feedId": feed.id, "jobId": job.id.to_string() }),
                    );
                }
                Err(JobQueueError::Duplicate { .. }) => {
                    summary.skipped += 1;
                    self.inner
                        .log
                        .debug("feed already queued", json!({ "feedId": feed.id }));
                }
                Err(e) => {
                    self.inner.log.warn(
                        "failed to enqueue feed",
                        json!({ "feedId": feed.id, "feedName": feed.name, "error": e.to_string() }),
                    );
                    summary.errors.push(ScheduleError {
                        feed_id: feed.id,
                        feed_name: feed.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Tick, logging instead of returning errors.
    pub async fn tick_logged(&self) -> Option<TickOutcome> {
        match self.tick().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.inner.log.error("scheduler run failed", ErrorDetail::of(&e), ());
                None
            }
        }
    }

    /// One tick, then wait up to the drain window for queued work to finish.
    pub async fn run_once(&self) -> Result<TickOutcome, SchedulerError> {
        let outcome = self.tick().await?;

        let drained = self.drain().await;
        if !drained {
            self.inner.log.warn(
                "drain window elapsed with work still queued",
                json!({ "stats": serde_json::to_value(self.inner.queue.get_stats()).unwrap_or_default() }),
            );
        }
        Ok(outcome)
    }

    /// Wait up to the drain window for the queue to go idle.
    pub async fn drain(&self) -> bool {
        self.inner.queue.wait_idle(self.inner.config.drain_wait).await
    }

    /// Fire a tick at every schedule time until `shutdown` resolves.
    ///
    /// Ticks run on their own tasks, so a slow tick does not delay the next
    /// fire time; the overlap guard makes the next one skip instead.
    pub async fn run_forever<S>(&self, schedule: &CronSchedule, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.inner.log.info(
            "scheduler started",
            json!({ "schedule": schedule.expression() }),
        );

        loop {
            let Some(delay) = schedule.until_next(Utc::now()) else {
                self.inner
                    .log
                    .warn("schedule has no upcoming fire times; stopping", ());
                break;
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.tick_logged().await;
                    });
                }
            }
        }

        self.inner.log.info("scheduler stopped", ());
    }
}
