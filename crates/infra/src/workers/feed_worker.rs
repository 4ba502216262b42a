//! Feed worker: runs one `feed:fetch` job under the per-feed lock.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;

use feedsync_core::{FeedId, FeedProcessor, FeedRepository, FeedResource, ProcessOutcome, RepositoryError};
use feedsync_observability::{ErrorDetail, Logger};

use crate::guard::ResourceGuard;
use crate::jobs::{FeedFetchPayload, Job, JobError, JobHandler, JobKind, JobPayload};
use crate::lock::{DistributedLock, LockError, LockFactory};

/// Worker error.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A job of another kind was routed here. Programming error.
    #[error("expected a {expected} job, got {found}")]
    WrongJobKind { expected: JobKind, found: JobKind },

    /// The payload does not decode. Programming error.
    #[error("invalid feed job payload: {0}")]
    InvalidPayload(String),

    /// Manual run while another worker holds the feed.
    #[error("feed {0} is already being processed")]
    FeedBusy(FeedId),

    #[error("feed {0} not found")]
    FeedNotFound(FeedId),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("feed {feed_id} processing failed: {message}")]
    Processing { feed_id: FeedId, message: String },
}

impl WorkerError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, WorkerError::WrongJobKind { .. } | WorkerError::InvalidPayload(_))
    }
}

impl From<WorkerError> for JobError {
    fn from(err: WorkerError) -> Self {
        if err.is_contract_violation() {
            JobError::Contract(err.to_string())
        } else {
            JobError::failed(err.to_string())
        }
    }
}

/// Executes feed jobs: lock, load, process under the resource guard, record
/// the outcome, unlock.
#[derive(Clone)]
pub struct FeedWorker {
    repo: Arc<dyn FeedRepository>,
    processor: Arc<dyn FeedProcessor>,
    locks: LockFactory,
    guard: ResourceGuard,
    processing_timeout: Option<Duration>,
    log: Logger,
}

impl std::fmt::Debug for FeedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedWorker")
            .field("locks", &self.locks)
            .field("guard", &self.guard)
            .field("processing_timeout", &self.processing_timeout)
            .finish_non_exhaustive()
    }
}

impl FeedWorker {
    pub fn new(
        repo: Arc<dyn FeedRepository>,
        processor: Arc<dyn FeedProcessor>,
        locks: LockFactory,
        guard: ResourceGuard,
    ) -> Self {
        Self {
            repo,
            processor,
            locks,
            guard,
            processing_timeout: None,
            log: Logger::new("feed-worker"),
        }
    }

    /// Bound each processor call. An overrun is a failed attempt: the error
    /// is recorded on the feed and the lock is released as usual.
    pub fn with_processing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Handle one queued job.
    ///
    /// Returns `Ok(None)` when another worker holds the feed: contention is a
    /// skip, not a failed attempt.
    pub async fn process_job(&self, job: &Job) -> Result<Option<ProcessOutcome>, WorkerError> {
        let payload = match self.decode(job) {
            Ok(payload) => payload,
            Err(e) => {
                self.log.error(
                    "feed worker received an invalid job",
                    ErrorDetail::of(&e),
                    json!({ "jobId": job.id.to_string(), "kind": job.kind.as_str() }),
                );
                return Err(e);
            }
        };
        let feed_id = payload.feed_id;

        let mut lock = self.locks.feed_lock(feed_id);
        if !lock.acquire_with_retry().await? {
            self.log.info(
                "feed locked by another worker; skipping",
                json!({ "feedId": feed_id, "jobId": job.id.to_string() }),
            );
            return Ok(None);
        }

        self.run_locked(lock, feed_id).await.map(Some)
    }

    /// Process a feed on demand, outside the queue. Fails fast with
    /// `FeedBusy` if the feed is locked.
    pub async fn process_feed_manually(&self, feed_id: FeedId) -> Result<ProcessOutcome, WorkerError> {
        let mut lock = self.locks.feed_lock(feed_id);
        if !lock.acquire().await? {
            return Err(WorkerError::FeedBusy(feed_id));
        }
        self.run_locked(lock, feed_id).await
    }

    fn decode(&self, job: &Job) -> Result<FeedFetchPayload, WorkerError> {
        if job.kind != FeedFetchPayload::KIND {
            return Err(WorkerError::WrongJobKind {
                expected: FeedFetchPayload::KIND,
                found: job.kind,
            });
        }
        job.payload_as::<FeedFetchPayload>()
            .map_err(|e| WorkerError::InvalidPayload(e.to_string()))
    }

    // Runs with the lock held and releases it on every exit path, panics included.
    async fn run_locked(&self, mut lock: DistributedLock, feed_id: FeedId) -> Result<ProcessOutcome, WorkerError> {
        let result = AssertUnwindSafe(self.load_and_process(feed_id)).catch_unwind().await;

        if let Err(e) = lock.release().await {
            self.log.warn(
                "failed to release feed lock",
                json!({ "feedId": feed_id, "key": lock.key(), "error": e.to_string() }),
            );
        }

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn load_and_process(&self, feed_id: FeedId) -> Result<ProcessOutcome, WorkerError> {
        let feed = self
            .repo
            .find_by_id(feed_id)
            .await?
            .ok_or(WorkerError::FeedNotFound(feed_id))?;

        let label = format!("feed:{feed_id}");
        match self.guard.execute(&label, self.process_with_deadline(&feed)).await {
            Ok(outcome) => {
                self.repo.update_last_fetched(feed_id, None).await?;
                self.log.info(
                    "feed processed",
                    json!({
                        "feedId": feed_id,
                        "feedName": feed.name,
                        "itemsProcessed": outcome.items_processed,
                        "postsCreated": outcome.posts_created,
                    }),
                );
                Ok(outcome)
            }
            Err(err) => {
                let message = format!("{err:#}");
                if let Err(record_err) = self.repo.update_last_fetched(feed_id, Some(&message)).await {
                    self.log.error(
                        "failed to record feed error",
                        ErrorDetail::of(&record_err),
                        json!({ "feedId": feed_id }),
                    );
                }
                self.log.warn(
                    "feed processing failed",
                    json!({ "feedId": feed_id, "feedName": feed.name, "error": message }),
                );
                Err(WorkerError::Processing { feed_id, message })
            }
        }
    }
}

impl FeedWorker {
    async fn process_with_deadline(&self, feed: &FeedResource) -> anyhow::Result<ProcessOutcome> {
        let Some(limit) = self.processing_timeout else {
            return self.processor.process(feed).await;
        };
        match tokio::time::timeout(limit, self.processor.process(feed)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("processing timed out after {limit:?}")),
        }
    }
}

#[async_trait]
impl JobHandler for FeedWorker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.process_job(job).await?;
        Ok(())
    }
}
