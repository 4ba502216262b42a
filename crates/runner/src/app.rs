//! Process wiring: stores, queue, worker, scheduler, and the two run modes.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use feedsync_core::{FeedProcessor, FeedRepository};
use feedsync_infra::config::{IngestConfig, RunMode};
use feedsync_infra::feeds::PostgresFeedRepository;
use feedsync_infra::guard::ResourceGuard;
use feedsync_infra::jobs::{JobHandler, JobKind, JobQueue};
use feedsync_infra::lock::{LockFactory, LockStore, RedisLockStore};
use feedsync_infra::scheduler::{FeedScheduler, SchedulerError, TickOutcome};
use feedsync_infra::workers::FeedWorker;
use feedsync_observability::{ErrorDetail, Logger};

use crate::processor::HttpFeedProcessor;

/// The assembled ingestion subsystem.
#[derive(Debug)]
pub struct App {
    config: IngestConfig,
    scheduler: FeedScheduler,
    worker: FeedWorker,
    log: Logger,
}

impl App {
    /// Connect to the stores named by `config` and wire everything up.
    pub async fn build(config: IngestConfig) -> anyhow::Result<Self> {
        let log = Logger::new("feedsync-runner");

        let store = connect_lock_store(&config, &log).await?;
        let locks = LockFactory::new(store, config.lock_settings());

        let database_url = config.require_database_url()?;
        let repo: Arc<dyn FeedRepository> = Arc::new(
            PostgresFeedRepository::connect(database_url)
                .await
                .context("connecting to the feed database")?,
        );
        let processor: Arc<dyn FeedProcessor> = Arc::new(HttpFeedProcessor::new()?);

        Self::assemble(config, repo, processor, locks)
    }

    /// Wire the subsystem over already-built adapters.
    pub fn assemble(
        config: IngestConfig,
        repo: Arc<dyn FeedRepository>,
        processor: Arc<dyn FeedProcessor>,
        locks: LockFactory,
    ) -> anyhow::Result<Self> {
        let queue = JobQueue::new(config.queue_config());
        let worker = FeedWorker::new(
            repo.clone(),
            processor,
            locks.clone(),
            ResourceGuard::new(config.guard_thresholds()),
        )
        .with_processing_timeout(config.job_timeout);

        for kind in JobKind::ALL {
            let handler: Arc<dyn JobHandler> = match kind {
                JobKind::FeedFetch => Arc::new(worker.clone()),
            };
            queue
                .process(*kind, handler)
                .with_context(|| format!("registering handler for {kind}"))?;
        }

        let scheduler = FeedScheduler::new(repo, queue, locks, config.scheduler_config());
        Ok(Self {
            config,
            scheduler,
            worker,
            log: Logger::new("feedsync-runner"),
        })
    }

    pub fn scheduler(&self) -> &FeedScheduler {
        &self.scheduler
    }

    /// For on-demand runs outside the queue.
    pub fn worker(&self) -> &FeedWorker {
        &self.worker
    }

    /// Run in the configured mode. Tick failures are logged, never returned.
    pub async fn run(&self) {
        match self.config.mode {
            RunMode::Once => {
                if let Err(e) = self.run_once().await {
                    self.log.error("scheduler run failed", ErrorDetail::of(&e), ());
                }
            }
            RunMode::Schedule => self.run_scheduled(shutdown_signal()).await,
        }
    }

    /// One tick, then drain the queue.
    pub async fn run_once(&self) -> Result<TickOutcome, SchedulerError> {
        self.log.info("running scheduler once", ());
        self.scheduler.run_once().await
    }

    /// Tick on the cron schedule until `shutdown`, then drain.
    pub async fn run_scheduled<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        self.scheduler.run_forever(&self.config.schedule, shutdown).await;

        let drained = self.scheduler.drain().await;
        self.log.info(
            "shutdown complete",
            json!({
                "drained": drained,
                "stats": serde_json::to_value(self.scheduler.queue().get_stats()).unwrap_or_default(),
            }),
        );
    }
}

async fn connect_lock_store(config: &IngestConfig, log: &Logger) -> anyhow::Result<Option<Arc<dyn LockStore>>> {
    let Some(url) = config.redis_url.as_deref() else {
        log.warn("REDIS_URL not set; locks are process-local", ());
        return Ok(None);
    };

    match RedisLockStore::connect(url).await {
        Ok(store) => Ok(Some(Arc::new(store))),
        Err(e) if config.lock_fail_open && e.is_unavailable() => {
            log.warn(
                "lock store unreachable at startup; continuing without it",
                json!({ "error": e.to_string() }),
            );
            Ok(None)
        }
        Err(e) => Err(e).context("connecting to the lock store"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
