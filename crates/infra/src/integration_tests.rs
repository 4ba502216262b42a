//! Integration tests for the full ingestion pipeline.
//!
//! Tests: Scheduler → JobQueue → FeedWorker → FeedRepository
//!
//! Verifies:
//! - One tick enqueues every due feed and the worker records each outcome
//! - Failed attempts back off exponentially and eventually succeed or dead-letter
//! - Locks keep instances and workers from stepping on each other

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use feedsync_core::{
    FeedId, FeedProcessor, FeedRepository, FeedResource, FnProcessor, ProcessOutcome, RepositoryResult,
};

use crate::feeds::InMemoryFeedRepository;
use crate::guard::{GuardThresholds, ResourceGuard};
use crate::jobs::{handler_fn, JobError, JobKind, JobOptions, JobQueue, QueueConfig, QueueStats};
use crate::lock::{DistributedLock, InMemoryLockStore, LockFactory, LockOptions, LockSettings, LockStore};
use crate::scheduler::{FeedScheduler, ScheduleError, ScheduleSummary, SchedulerConfig, SkipReason, TickOutcome};
use crate::workers::FeedWorker;

fn feed(id: i64) -> FeedResource {
    FeedResource::new(id, format!("https://example.org/{id}.xml"), format!("feed {id}"))
}

fn shared_store() -> (Arc<InMemoryLockStore>, Arc<dyn LockStore>) {
    let raw = Arc::new(InMemoryLockStore::new());
    let store: Arc<dyn LockStore> = raw.clone();
    (raw, store)
}

fn quick_lock_settings() -> LockSettings {
    LockSettings {
        feed_max_attempts: 1,
        ..LockSettings::default()
    }
}

fn assert_gap(from: Instant, to: Instant, expected_ms: u64) {
    let gap = to.duration_since(from);
    let expected = Duration::from_millis(expected_ms);
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(50),
        "expected ~{expected:?} between attempts, got {gap:?}"
    );
}

struct Pipeline {
    repo: Arc<InMemoryFeedRepository>,
    queue: JobQueue,
    scheduler: FeedScheduler,
}

fn pipeline(
    repo: Arc<InMemoryFeedRepository>,
    processor: Arc<dyn FeedProcessor>,
    queue_config: QueueConfig,
) -> Pipeline {
    let (_, store) = shared_store();
    let locks = LockFactory::new(Some(store), quick_lock_settings());
    let queue = JobQueue::new(queue_config);

    let worker = FeedWorker::new(
        repo.clone(),
        processor,
        locks.clone(),
        ResourceGuard::new(GuardThresholds::default()),
    );
    queue.process(JobKind::FeedFetch, Arc::new(worker)).unwrap();

    let scheduler = FeedScheduler::new(repo.clone(), queue.clone(), locks, SchedulerConfig::default());
    Pipeline { repo, queue, scheduler }
}

#[tokio::test]
async fn lock_is_mutually_exclusive_across_instances() {
    let (_, store) = shared_store();
    let a = LockFactory::new(Some(store.clone()), LockSettings::default());
    let b = LockFactory::new(Some(store), LockSettings::default());

    let mut first = a.scheduler_lock();
    let mut second = b.scheduler_lock();

    assert!(first.acquire().await.unwrap());
    assert!(!second.acquire().await.unwrap());

    assert!(first.release().await.unwrap());
    assert!(second.acquire().await.unwrap());
    assert!(second.release().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn stale_holder_cannot_release_a_lock_taken_over_after_expiry() {
    let (raw, store) = shared_store();
    let options = LockOptions {
        ttl: Duration::from_secs(1),
        ..LockOptions::default()
    };

    let mut stale = DistributedLock::new("feed:9", Some(store.clone()), options);
    assert!(stale.acquire().await.unwrap());

    tokio::time::advance(Duration::from_millis(1500)).await;

    let mut fresh = DistributedLock::new("feed:9", Some(store), options);
    assert!(fresh.acquire().await.unwrap());

    assert!(!stale.release().await.unwrap());
    assert!(fresh.is_locked().await.unwrap());
    assert_eq!(raw.live_keys(), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_job_backs_off_then_dead_letters() {
    let queue = JobQueue::new(QueueConfig::default());
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let seen = attempts.clone();
    queue
        .process(
            JobKind::FeedFetch,
            handler_fn(move |_job| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(Instant::now());
                    Err(JobError::failed("upstream returned 503"))
                }
            }),
        )
        .unwrap();

    let before = queue.get_stats();
    let job = queue
        .add(JobKind::FeedFetch, serde_json::json!({ "feedId": 1 }), JobOptions::new())
        .unwrap();
    assert!(queue.wait_idle(Duration::from_secs(30)).await);

    let at = attempts.lock().unwrap().clone();
    assert_eq!(at.len(), 3);
    assert_gap(at[0], at[1], 1000);
    assert_gap(at[1], at[2], 2000);

    let after = queue.get_stats();
    assert_eq!(after.failed, before.failed + 1);
    assert_eq!(after.completed, before.completed);
    assert_eq!(after.waiting, 0);

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, job.id);
    assert_eq!(dead[0].job.attempts, 3);
    assert_eq!(dead[0].reason, "upstream returned 503");
}

#[tokio::test]
async fn successful_job_moves_stats_by_one() {
    let queue = JobQueue::new(QueueConfig::default());
    queue
        .process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) }))
        .unwrap();

    let before = queue.get_stats();
    queue
        .add(JobKind::FeedFetch, serde_json::json!({}), JobOptions::new())
        .unwrap();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(
        queue.get_stats(),
        QueueStats {
            completed: before.completed + 1,
            ..before
        }
    );
}

#[tokio::test(start_paused = true)]
async fn worker_skips_a_feed_locked_elsewhere() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(1)]));
    let (_, store) = shared_store();
    let locks = LockFactory::new(Some(store), quick_lock_settings());

    let mut other_worker = locks.feed_lock(FeedId::new(1));
    assert!(other_worker.acquire().await.unwrap());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let processor = FnProcessor::new(move |_feed| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(ProcessOutcome::default())
        }
    });

    let queue = JobQueue::new(QueueConfig::default());
    let worker = FeedWorker::new(
        repo.clone(),
        Arc::new(processor),
        locks,
        ResourceGuard::new(GuardThresholds::default()),
    );
    queue.process(JobKind::FeedFetch, Arc::new(worker)).unwrap();

    queue
        .add_typed(&crate::jobs::FeedFetchPayload::from(&feed(1)), JobOptions::new())
        .unwrap();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let stats = queue.get_stats();
    assert_eq!((stats.completed, stats.failed), (1, 0));
    assert!(queue.dead_letters().is_empty());
    assert_eq!(repo.record(FeedId::new(1)).unwrap().fetch_count, 0);
    assert!(other_worker.release().await.unwrap());
}

/// Repository whose discovery blocks until the gate opens.
struct GatedRepository {
    inner: InMemoryFeedRepository,
    gate: Notify,
}

#[async_trait]
impl FeedRepository for GatedRepository {
    async fn find_enabled_due(&self) -> RepositoryResult<Vec<FeedResource>> {
        self.gate.notified().await;
        self.inner.find_enabled_due().await
    }

    async fn find_by_id(&self, id: FeedId) -> RepositoryResult<Option<FeedResource>> {
        self.inner.find_by_id(id).await
    }

    async fn update_last_fetched(&self, id: FeedId, error: Option<&str>) -> RepositoryResult<()> {
        self.inner.update_last_fetched(id, error).await
    }
}

#[tokio::test]
async fn overlapping_tick_is_skipped_without_enqueueing() {
    let repo = Arc::new(GatedRepository {
        inner: InMemoryFeedRepository::with_feeds([feed(1)]),
        gate: Notify::new(),
    });
    let scheduler = FeedScheduler::new(
        repo.clone(),
        JobQueue::new(QueueConfig::default()),
        LockFactory::local(LockSettings::default()),
        SchedulerConfig::default(),
    );

    let slow = scheduler.clone();
    let first = tokio::spawn(async move { slow.tick().await });
    while !scheduler.is_running() {
        tokio::task::yield_now().await;
    }

    let second = scheduler.tick().await.unwrap();
    assert_eq!(second, TickOutcome::Skipped(SkipReason::AlreadyRunning));
    assert_eq!(scheduler.queue().get_stats().waiting, 0);

    repo.gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, TickOutcome::Completed(ref s) if s.scheduled == 1));
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn tick_schedules_and_processes_every_due_feed() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(1), feed(2), feed(3)]));
    let processor = FnProcessor::new(|_feed| async {
        Ok::<_, anyhow::Error>(ProcessOutcome {
            items_processed: 4,
            posts_created: 2,
        })
    });
    let p = pipeline(repo, Arc::new(processor), QueueConfig::default());

    let outcome = p.scheduler.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed(ScheduleSummary {
            scheduled: 3,
            skipped: 0,
            errors: vec![],
        })
    );

    assert!(p.scheduler.drain().await);
    assert_eq!(p.queue.get_stats().completed, 3);
    for id in 1..=3 {
        let record = p.repo.record(FeedId::new(id)).unwrap();
        assert_eq!(record.fetch_count, 1);
        assert!(record.last_fetched_at.is_some());
        assert_eq!(record.last_error, None);
    }

    // Every feed was just fetched, so the next tick finds nothing.
    let next = p.scheduler.tick().await.unwrap();
    assert_eq!(next, TickOutcome::Completed(ScheduleSummary::default()));
}

#[tokio::test]
async fn full_queue_reports_the_feed_that_did_not_fit() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(1), feed(2)]));
    let scheduler = FeedScheduler::new(
        repo,
        JobQueue::new(QueueConfig {
            capacity: Some(1),
            ..QueueConfig::default()
        }),
        LockFactory::local(LockSettings::default()),
        SchedulerConfig::default(),
    );

    let outcome = scheduler.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed(ScheduleSummary {
            scheduled: 1,
            skipped: 0,
            errors: vec![ScheduleError {
                feed_id: FeedId::new(2),
                feed_name: "feed 2".into(),
                error: "queue full".into(),
            }],
        })
    );
}

#[tokio::test(start_paused = true)]
async fn flaky_feed_succeeds_on_the_third_attempt() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(7)]));
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let seen = attempts.clone();
    let processor = FnProcessor::new(move |_feed| {
        let seen = seen.clone();
        async move {
            let attempt = {
                let mut seen = seen.lock().unwrap();
                seen.push(Instant::now());
                seen.len()
            };
            if attempt < 3 {
                anyhow::bail!("connection reset (attempt {attempt})");
            }
            Ok(ProcessOutcome {
                items_processed: 1,
                posts_created: 1,
            })
        }
    });
    let p = pipeline(repo, Arc::new(processor), QueueConfig::default());
    let before = p.queue.get_stats();

    let outcome = p.scheduler.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Completed(ref s) if s.scheduled == 1));
    assert!(p.queue.wait_idle(Duration::from_secs(30)).await);

    let at = attempts.lock().unwrap().clone();
    assert_eq!(at.len(), 3);
    assert_gap(at[0], at[2], 3000);

    let after = p.queue.get_stats();
    assert_eq!(after.completed, before.completed + 1);
    assert_eq!(after.failed, before.failed);

    let record = p.repo.record(FeedId::new(7)).unwrap();
    assert_eq!(record.fetch_count, 3);
    assert_eq!(record.last_error, None);
}

#[tokio::test]
async fn failed_attempt_records_the_error_on_the_feed() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(5)]));
    let processor = FnProcessor::new(|_feed| async {
        Err::<ProcessOutcome, _>(anyhow::anyhow!("invalid XML at line 3"))
    });
    let p = pipeline(
        repo,
        Arc::new(processor),
        QueueConfig {
            retry: crate::jobs::RetryPolicy::exponential(1, Duration::from_millis(10), Duration::from_millis(10)),
            ..QueueConfig::default()
        },
    );

    p.scheduler.tick().await.unwrap();
    assert!(p.scheduler.drain().await);

    let record = p.repo.record(FeedId::new(5)).unwrap();
    assert_eq!(record.last_error.as_deref(), Some("invalid XML at line 3"));
    assert_eq!(p.queue.get_stats().failed, 1);
    assert_eq!(p.queue.dead_letters().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_admit_exactly_one_holder() {
    const CONTENDERS: usize = 16;
    let (raw, store) = shared_store();
    let locks = LockFactory::new(Some(store), LockSettings::default());
    let start = Arc::new(tokio::sync::Barrier::new(CONTENDERS));

    let mut tasks = Vec::with_capacity(CONTENDERS);
    for _ in 0..CONTENDERS {
        let mut lock = locks.feed_lock(FeedId::new(42));
        let start = start.clone();
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            lock.acquire().await.unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(raw.live_keys(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_recorded_unlocked_and_retried() {
    let repo = Arc::new(InMemoryFeedRepository::with_feeds([feed(4)]));
    let (raw, store) = shared_store();
    let locks = LockFactory::new(Some(store), quick_lock_settings());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let processor = FnProcessor::new(move |_feed| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok::<_, anyhow::Error>(ProcessOutcome::default())
        }
    });

    let queue = JobQueue::new(QueueConfig::default());
    let worker = FeedWorker::new(
        repo.clone(),
        Arc::new(processor),
        locks,
        ResourceGuard::new(GuardThresholds::default()),
    )
    .with_processing_timeout(Some(Duration::from_secs(2)));
    queue.process(JobKind::FeedFetch, Arc::new(worker)).unwrap();

    queue
        .add_typed(&crate::jobs::FeedFetchPayload::from(&feed(4)), JobOptions::new())
        .unwrap();
    assert!(queue.wait_idle(Duration::from_secs(30)).await);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = queue.get_stats();
    assert_eq!((stats.completed, stats.failed, stats.active), (1, 0, 0));
    assert_eq!(raw.live_keys(), 0);

    // One recorded failure, then the clean retry.
    let record = repo.record(FeedId::new(4)).unwrap();
    assert_eq!(record.fetch_count, 2);
    assert_eq!(record.last_error, None);
}
