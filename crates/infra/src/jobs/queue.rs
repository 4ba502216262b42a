//! In-process job queue with timer-driven dispatch, retry, and backoff.
//!
//! Each job gets its own timer task; there is no shared poll loop. A task
//! sleeps until its job is due, then runs one dispatch step for that job.
//! `remove`/`clear` abort sleeping timers so a stale dispatch never fires
//! against a deleted job.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use feedsync_observability::{ErrorDetail, Logger};

use super::handler::{JobError, JobHandler};
use super::payload::JobPayload;
use super::types::{DeadLetterEntry, Job, JobId, JobKind, JobOptions, QueueStats, RetryPolicy};

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("queue full")]
    QueueFull,
    #[error("duplicate job: {key}")]
    Duplicate { key: String },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is running")]
    InFlight(JobId),
    #[error("job {0} has exhausted its attempts")]
    AttemptsExhausted(JobId),
    #[error("a handler is already registered for {0}")]
    HandlerAlreadyRegistered(JobKind),
    #[error("payload could not be encoded: {0}")]
    Payload(String),
}

/// Queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// Bound on waiting + active jobs.
    pub capacity: Option<usize>,
    /// Most recent dead letters kept for inspection.
    pub dead_letter_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            capacity: None,
            dead_letter_limit: 100,
        }
    }
}

#[derive(Debug)]
struct Entry {
    job: Job,
    ready_at: Instant,
    timer: Option<JoinHandle<()>>,
    in_flight: bool,
    /// No handler was registered when the job came due.
    parked: bool,
}

impl Entry {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<JobId, Entry>,
    /// Attempts in progress. Outlives the entry when a running job is removed.
    running: HashSet<JobId>,
    completed: u64,
    failed: u64,
    dead_letters: VecDeque<DeadLetterEntry>,
}

struct Inner {
    config: QueueConfig,
    state: Mutex<State>,
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
    idle: Notify,
    log: Logger,
}

/// In-memory job queue.
///
/// Cheap to clone; clones share the same queue. Construct one at startup and
/// hand it to the scheduler and the runner.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

enum Step {
    Stop,
    Run(Job, Arc<dyn JobHandler>),
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                handlers: RwLock::new(HashMap::new()),
                idle: Notify::new(),
                log: Logger::new("job-queue"),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Enqueue a job. Dispatch happens on a background task; this never waits
    /// for the handler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, kind: JobKind, payload: serde_json::Value, options: JobOptions) -> Result<Job, JobQueueError> {
        let job = Job::new(kind, payload, &options, self.inner.config.retry.max_attempts);
        let delay = options.delay.unwrap_or(Duration::ZERO);

        let mut state = self.lock_state();

        if let Some(capacity) = self.inner.config.capacity {
            if state.entries.len() >= capacity {
                return Err(JobQueueError::QueueFull);
            }
        }
        if let Some(key) = job.dedupe_key.as_deref() {
            if state.entries.values().any(|e| e.job.dedupe_key.as_deref() == Some(key)) {
                return Err(JobQueueError::Duplicate { key: key.to_string() });
            }
        }

        let id = job.id;
        state.entries.insert(
            id,
            Entry {
                job: job.clone(),
                ready_at: Instant::now() + delay,
                timer: None,
                in_flight: false,
                parked: false,
            },
        );
        self.arm(&mut state, id, delay);
        drop(state);

        self.inner.log.debug(
            "job added",
            json!({ "jobId": id.to_string(), "kind": kind.as_str(), "delayMs": delay.as_millis() as u64 }),
        );
        Ok(job)
    }

    /// Enqueue a typed payload under its own kind.
    pub fn add_typed<P>(&self, payload: &P, options: JobOptions) -> Result<Job, JobQueueError>
    where
        P: JobPayload,
    {
        let value = serde_json::to_value(payload).map_err(|e| JobQueueError::Payload(e.to_string()))?;
        self.add(P::KIND, value, options)
    }

    /// Register the handler for `kind`. One handler per kind.
    ///
    /// Jobs of that kind that came due while no handler existed are re-armed.
    pub fn process(&self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Result<(), JobQueueError> {
        {
            let mut handlers = self.inner.handlers.write().unwrap_or_else(|p| p.into_inner());
            if handlers.contains_key(&kind) {
                return Err(JobQueueError::HandlerAlreadyRegistered(kind));
            }
            handlers.insert(kind, handler);
        }

        let mut state = self.lock_state();
        let parked: Vec<JobId> = state
            .entries
            .iter()
            .filter(|(_, e)| e.parked && e.job.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        for id in parked {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.parked = false;
            }
            self.arm(&mut state, id, Duration::ZERO);
        }
        Ok(())
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            waiting: state.entries.values().filter(|e| !e.in_flight).count(),
            active: state.running.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.lock_state().entries.get(&id).map(|e| e.job.clone())
    }

    /// Drop a job. A running attempt finishes, still counts as active until
    /// then, and is not retried.
    pub fn remove(&self, id: JobId) -> bool {
        let removed = {
            let mut state = self.lock_state();
            match state.entries.remove(&id) {
                Some(mut entry) => {
                    entry.abort_timer();
                    true
                }
                None => false,
            }
        };
        if removed {
            self.inner.idle.notify_waiters();
        }
        removed
    }

    /// Dispatch a waiting job now, skipping any remaining delay.
    pub fn retry(&self, id: JobId) -> Result<(), JobQueueError> {
        let mut state = self.lock_state();

        let Some(entry) = state.entries.get_mut(&id) else {
            let dead = state.dead_letters.iter().any(|d| d.job.id == id);
            return Err(if dead {
                JobQueueError::AttemptsExhausted(id)
            } else {
                JobQueueError::NotFound(id)
            });
        };
        if entry.in_flight {
            return Err(JobQueueError::InFlight(id));
        }
        if !entry.job.has_attempts_left() {
            return Err(JobQueueError::AttemptsExhausted(id));
        }

        entry.job.scheduled_for = None;
        entry.ready_at = Instant::now();
        entry.parked = false;
        self.arm(&mut state, id, Duration::ZERO);
        Ok(())
    }

    /// Drop every queued job. Counters are cumulative and survive.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.entries.len();
            for (_, mut entry) in state.entries.drain() {
                entry.abort_timer();
            }
            removed
        };
        self.inner.idle.notify_waiters();
        removed
    }

    /// Most recent jobs that exhausted their attempts, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock_state().dead_letters.iter().cloned().collect()
    }

    /// No job is running or waiting to run.
    ///
    /// Jobs parked for want of a handler do not count.
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.running.is_empty() && state.entries.values().all(|e| e.parked)
    }

    /// Wait until the queue is idle or `timeout` elapses. Returns whether it
    /// became idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handler_for(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .cloned()
    }

    // Replace the job's timer with one that dispatches after `delay`. Called
    // with the state lock held, so the new task cannot observe the entry
    // before its handle is stored.
    fn arm(&self, state: &mut State, id: JobId, delay: Duration) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.abort_timer();

        let queue = self.clone();
        entry.timer = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.dispatch(id).await;
        }));
    }

    async fn dispatch(&self, id: JobId) {
        let (job, handler) = match self.begin(id) {
            Step::Stop => {
                self.inner.idle.notify_waiters();
                return;
            }
            Step::Run(job, handler) => (job, handler),
        };

        self.inner.log.debug(
            "job started",
            json!({ "jobId": id.to_string(), "kind": job.kind.as_str(), "attempt": job.attempts }),
        );

        let result = self.run_handler(handler.as_ref(), &job).await;
        self.finish(id, &job, result);
        self.inner.idle.notify_waiters();
    }

    // Steps before the handler runs: existence, re-entrancy, due time, attempt
    // budget, handler lookup. On `Run`, the job is marked in flight.
    fn begin(&self, id: JobId) -> Step {
        let mut state = self.lock_state();

        let Some(entry) = state.entries.get_mut(&id) else {
            return Step::Stop;
        };
        if entry.in_flight {
            return Step::Stop;
        }
        // This task is the timer; forget it so nothing aborts a running attempt.
        entry.timer = None;

        let now = Instant::now();
        if entry.ready_at > now {
            let remaining = entry.ready_at - now;
            self.arm(&mut state, id, remaining);
            return Step::Stop;
        }

        if !entry.job.has_attempts_left() {
            let reason = entry
                .job
                .last_error
                .clone()
                .unwrap_or_else(|| "attempts exhausted".to_string());
            self.fail_permanently(&mut state, id, reason);
            return Step::Stop;
        }

        let kind = entry.job.kind;
        let Some(handler) = self.handler_for(kind) else {
            entry.parked = true;
            self.inner.log.warn(
                "no handler registered for job kind; job parked",
                json!({ "jobId": id.to_string(), "kind": kind.as_str() }),
            );
            return Step::Stop;
        };

        entry.in_flight = true;
        entry.job.attempts += 1;
        let job = entry.job.clone();
        state.running.insert(id);
        Step::Run(job, handler)
    }

    async fn run_handler(&self, handler: &dyn JobHandler, job: &Job) -> Result<(), JobError> {
        let outcome = AssertUnwindSafe(handler.handle(job)).catch_unwind().await;

        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::failed(format!("handler panicked: {message}")))
        })
    }

    fn finish(&self, id: JobId, job: &Job, result: Result<(), JobError>) {
        let mut state = self.lock_state();
        state.running.remove(&id);

        let Some(entry) = state.entries.get_mut(&id) else {
            // Removed while running.
            if result.is_ok() {
                state.completed += 1;
            }
            self.inner.log.debug(
                "job removed while running; outcome not retried",
                json!({ "jobId": id.to_string(), "succeeded": result.is_ok() }),
            );
            return;
        };
        entry.in_flight = false;

        let err = match result {
            Ok(()) => {
                state.entries.remove(&id);
                state.completed += 1;
                self.inner.log.debug(
                    "job completed",
                    json!({ "jobId": id.to_string(), "kind": job.kind.as_str(), "attempts": job.attempts }),
                );
                return;
            }
            Err(err) => err,
        };

        let message = err.to_string();
        entry.job.last_error = Some(message.clone());

        if err.is_retryable() && entry.job.has_attempts_left() {
            let delay = self.inner.config.retry.delay_for_attempt(entry.job.attempts);
            entry.ready_at = Instant::now() + delay;
            entry.job.scheduled_for = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());

            self.inner.log.warn(
                "job failed; retry scheduled",
                json!({
                    "jobId": id.to_string(),
                    "kind": job.kind.as_str(),
                    "attempt": entry.job.attempts,
                    "maxAttempts": entry.job.max_attempts,
                    "delayMs": delay.as_millis() as u64,
                    "error": message,
                }),
            );
            self.arm(&mut state, id, delay);
            return;
        }

        self.inner.log.error(
            "job failed permanently",
            ErrorDetail::of(&err),
            json!({ "jobId": id.to_string(), "kind": job.kind.as_str(), "attempts": job.attempts }),
        );
        self.fail_permanently(&mut state, id, message);
    }

    fn fail_permanently(&self, state: &mut State, id: JobId, reason: String) {
        let Some(entry) = state.entries.remove(&id) else {
            return;
        };
        state.failed += 1;
        state.dead_letters.push_back(DeadLetterEntry::new(entry.job, reason));
        while state.dead_letters.len() > self.inner.config.dead_letter_limit {
            state.dead_letters.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::payload::FeedFetchPayload;
    use feedsync_core::FeedId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn queue() -> JobQueue {
        JobQueue::new(QueueConfig::default())
    }

    fn payload(id: i64) -> FeedFetchPayload {
        FeedFetchPayload {
            feed_id: FeedId::new(id),
            url: format!("https://example.org/{id}.xml"),
            name: format!("feed {id}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_is_removed_and_counted() {
        let q = queue();
        q.process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) })).unwrap();

        let before = q.get_stats();
        let job = q.add_typed(&payload(1), JobOptions::new()).unwrap();
        assert!(q.wait_idle(Duration::from_secs(1)).await);

        let after = q.get_stats();
        assert_eq!(after.completed, before.completed + 1);
        assert_eq!(after.waiting, before.waiting);
        assert_eq!(after.active, before.active);
        assert!(q.get_job(job.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_waits_for_its_delay() {
        let q = queue();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        q.process(
            JobKind::FeedFetch,
            handler_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        q.add_typed(&payload(1), JobOptions::new().with_delay(Duration::from_secs(5)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(q.get_stats().waiting, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_job_exhausts_attempts_and_is_dead_lettered() {
        let q = queue();
        q.process(
            JobKind::FeedFetch,
            handler_fn(|_job| async { Err(JobError::failed("feed unreachable")) }),
        )
        .unwrap();

        let job = q.add_typed(&payload(1), JobOptions::new()).unwrap();
        assert!(q.wait_idle(Duration::from_secs(10)).await);

        let stats = q.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.waiting, 0);

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, job.id);
        assert_eq!(dead[0].job.attempts, 3);
        assert_eq!(dead[0].reason, "feed unreachable");

        assert_eq!(q.retry(job.id), Err(JobQueueError::AttemptsExhausted(job.id)));
    }

    #[tokio::test(start_paused = true)]
    async fn contract_errors_skip_the_retry_budget() {
        let q = queue();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        q.process(
            JobKind::FeedFetch,
            handler_fn(move |_job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(JobError::Contract("wrong kind".into())) }
            }),
        )
        .unwrap();

        q.add_typed(&payload(1), JobOptions::new()).unwrap();
        assert!(q.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(q.get_stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_counts_as_a_failed_attempt() {
        let q = JobQueue::new(QueueConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..QueueConfig::default()
        });
        q.process(
            JobKind::FeedFetch,
            handler_fn(|job| async move {
                if job.attempts > 0 {
                    panic!("parser blew up");
                }
                Ok(())
            }),
        )
        .unwrap();

        q.add_typed(&payload(1), JobOptions::new()).unwrap();
        assert!(q.wait_idle(Duration::from_secs(1)).await);

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "handler panicked: parser blew up");
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_rejects_with_queue_full() {
        let q = JobQueue::new(QueueConfig {
            capacity: Some(1),
            ..QueueConfig::default()
        });

        q.add_typed(&payload(1), JobOptions::new()).unwrap();
        let err = q.add_typed(&payload(2), JobOptions::new()).unwrap_err();

        assert_eq!(err, JobQueueError::QueueFull);
        assert_eq!(err.to_string(), "queue full");
    }

    #[tokio::test(start_paused = true)]
    async fn dedupe_key_rejects_while_the_first_job_is_queued() {
        let q = queue();
        let options = JobOptions::new().with_dedupe_key("feed:1");

        q.add_typed(&payload(1), options.clone()).unwrap();
        let err = q.add_typed(&payload(1), options.clone()).unwrap_err();
        assert_eq!(err, JobQueueError::Duplicate { key: "feed:1".into() });

        q.process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) })).unwrap();
        assert!(q.wait_idle(Duration::from_secs(1)).await);
        assert!(q.add_typed(&payload(1), options).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_without_a_handler_park_until_one_is_registered() {
        let q = queue();
        let job = q.add_typed(&payload(1), JobOptions::new()).unwrap();

        assert!(q.wait_idle(Duration::from_secs(1)).await);
        let parked = q.get_job(job.id).unwrap();
        assert_eq!(parked.attempts, 0);
        assert_eq!(q.get_stats().waiting, 1);

        q.process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) })).unwrap();
        assert!(q.wait_idle(Duration::from_secs(1)).await);
        assert!(q.get_job(job.id).is_none());
        assert_eq!(q.get_stats().completed, 1);
    }

    #[tokio::test]
    async fn second_handler_for_a_kind_is_rejected() {
        let q = queue();
        q.process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) })).unwrap();

        let err = q
            .process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) }))
            .unwrap_err();
        assert_eq!(err, JobQueueError::HandlerAlreadyRegistered(JobKind::FeedFetch));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_a_pending_dispatch() {
        let q = queue();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        q.process(
            JobKind::FeedFetch,
            handler_fn(move |_job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        )
        .unwrap();

        let job = q
            .add_typed(&payload(1), JobOptions::new().with_delay(Duration::from_secs(1)))
            .unwrap();
        assert!(q.remove(job.id));
        assert!(!q.remove(job.id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(q.get_stats(), QueueStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_dispatches_a_delayed_job_immediately() {
        let q = queue();
        q.process(JobKind::FeedFetch, handler_fn(|_job| async { Ok(()) })).unwrap();

        let job = q
            .add_typed(&payload(1), JobOptions::new().with_delay(Duration::from_secs(3600)))
            .unwrap();
        q.retry(job.id).unwrap();

        assert!(q.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(q.get_stats().completed, 1);
        assert!(matches!(q.retry(JobId::new()), Err(JobQueueError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_queued_jobs_and_keeps_counters() {
        let q = queue();
        for id in 1..=3 {
            q.add_typed(&payload(id), JobOptions::new().with_delay(Duration::from_secs(60)))
                .unwrap();
        }

        assert_eq!(q.clear(), 3);
        assert!(q.is_idle());
        assert_eq!(q.get_stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_while_work_remains() {
        let q = queue();
        q.process(
            JobKind::FeedFetch,
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .unwrap();

        q.add_typed(&payload(1), JobOptions::new()).unwrap();
        assert!(!q.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(q.get_stats().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_running_job_keeps_it_active_until_it_finishes() {
        let q = queue();
        let finished = Arc::new(AtomicU32::new(0));
        let counter = finished.clone();
        q.process(
            JobKind::FeedFetch,
            handler_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let job = q.add_typed(&payload(1), JobOptions::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(q.get_stats().active, 1);

        assert!(q.remove(job.id));
        assert_eq!(q.get_stats().active, 1);
        assert_eq!(q.get_stats().waiting, 0);
        assert!(!q.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        assert!(q.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(q.get_stats().active, 0);
        assert!(q.get_job(job.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_during_a_run_does_not_report_idle() {
        let q = queue();
        q.process(
            JobKind::FeedFetch,
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        )
        .unwrap();

        q.add_typed(&payload(1), JobOptions::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(q.clear(), 1);
        assert!(!q.is_idle());
        assert_eq!(q.get_stats().active, 1);
        assert!(q.wait_idle(Duration::from_secs(20)).await);
    }

    #[tokio::test]
    async fn contract_payload_flags_undecodable_payloads() {
        let job = Job::new(
            JobKind::FeedFetch,
            serde_json::json!({"nope": true}),
            &JobOptions::new(),
            3,
        );
        assert!(matches!(
            job.contract_payload::<FeedFetchPayload>(),
            Err(JobError::Contract(_))
        ));
    }
}
