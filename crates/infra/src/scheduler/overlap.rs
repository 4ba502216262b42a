//! Single-process overlap guard for scheduler ticks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Called with the deadline when a guarded run exceeds it.
pub type TimeoutCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// In-memory "executing" flag with a wall-clock deadline.
///
/// This is not the distributed lock: it only stops one process from starting
/// a tick while its own previous tick is still running.
pub struct OverlapGuard {
    running: AtomicBool,
    timeout: Duration,
    on_timeout: Option<TimeoutCallback>,
}

impl std::fmt::Debug for OverlapGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlapGuard")
            .field("running", &self.is_running())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Marks the guard as executing until dropped.
#[derive(Debug)]
pub struct RunningToken<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunningToken<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The guarded work missed its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded(pub Duration);

impl OverlapGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            timeout,
            on_timeout: None,
        }
    }

    pub fn with_timeout_callback(mut self, callback: TimeoutCallback) -> Self {
        self.on_timeout = Some(callback);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark as executing, or `None` if a previous run still is.
    pub fn try_start(&self) -> Option<RunningToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningToken { flag: &self.running })
    }

    /// Race `work` against the deadline. On expiry the callback fires and the
    /// work is dropped.
    pub async fn run<F, T>(&self, work: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(value) => Ok(value),
            Err(_) => {
                if let Some(callback) = &self.on_timeout {
                    callback(self.timeout);
                }
                Err(DeadlineExceeded(self.timeout))
            }
        }
    }
}
