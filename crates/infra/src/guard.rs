//! Resource-usage guard: memory visibility around long-running work.
//!
//! Purely observational. Thresholds are logged, never enforced, and the
//! guard itself has no failure mode.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;

use feedsync_observability::{ErrorDetail, Logger};

const MIB: u64 = 1024 * 1024;

/// Source of the process's current memory usage.
pub trait MemorySampler: Send + Sync + 'static {
    /// Resident set size in bytes, or `None` when it cannot be read.
    fn rss_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Yields `None` off Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatusSampler;

impl MemorySampler for ProcStatusSampler {
    fn rss_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Guard thresholds, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardThresholds {
    pub warn_bytes: u64,
    pub max_bytes: u64,
    /// Growth across one call above which the delta is reported.
    pub report_delta_bytes: u64,
}

impl Default for GuardThresholds {
    fn default() -> Self {
        Self {
            warn_bytes: 512 * MIB,
            max_bytes: 1024 * MIB,
            report_delta_bytes: 10 * MIB,
        }
    }
}

impl GuardThresholds {
    pub fn from_megabytes(warn_mb: u64, max_mb: u64) -> Self {
        Self {
            warn_bytes: warn_mb.saturating_mul(MIB),
            max_bytes: max_mb.saturating_mul(MIB),
            ..Self::default()
        }
    }
}

/// Memory pressure relative to the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    Warn,
    Max,
}

pub fn classify(bytes: u64, thresholds: &GuardThresholds) -> Pressure {
    if bytes >= thresholds.max_bytes {
        Pressure::Max
    } else if bytes >= thresholds.warn_bytes {
        Pressure::Warn
    } else {
        Pressure::Normal
    }
}

/// Wraps work with before/after memory sampling.
#[derive(Clone)]
pub struct ResourceGuard {
    sampler: Arc<dyn MemorySampler>,
    thresholds: GuardThresholds,
    log: Logger,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ResourceGuard {
    pub fn new(thresholds: GuardThresholds) -> Self {
        Self::with_sampler(thresholds, Arc::new(ProcStatusSampler))
    }

    pub fn with_sampler(thresholds: GuardThresholds, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            sampler,
            thresholds,
            log: Logger::new("resource-guard"),
        }
    }

    pub fn thresholds(&self) -> &GuardThresholds {
        &self.thresholds
    }

    /// Run `work`, logging memory pressure before and growth after.
    ///
    /// The output of `work` is returned untouched; a panic is re-raised after
    /// the post-check.
    pub async fn execute<F, T>(&self, label: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let before = self.sampler.rss_bytes();
        if let Some(bytes) = before {
            self.check(label, bytes);
        }

        let result = AssertUnwindSafe(work).catch_unwind().await;

        if let (Some(before), Some(after)) = (before, self.sampler.rss_bytes()) {
            self.report_delta(label, before, after);
        }

        match result {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn check(&self, label: &str, bytes: u64) {
        let context = json!({
            "label": label,
            "rssMb": bytes / MIB,
            "warnMb": self.thresholds.warn_bytes / MIB,
            "maxMb": self.thresholds.max_bytes / MIB,
        });
        match classify(bytes, &self.thresholds) {
            Pressure::Normal => {}
            Pressure::Warn => self.log.warn("memory usage above warning threshold", context),
            Pressure::Max => {
                self.log
                    .error("memory usage above maximum threshold", None::<ErrorDetail>, context)
            }
        }
    }

    fn report_delta(&self, label: &str, before: u64, after: u64) {
        let delta = after.saturating_sub(before);
        if delta > self.thresholds.report_delta_bytes {
            self.log.debug(
                "memory grew during guarded work",
                json!({ "label": label, "deltaMb": delta / MIB, "rssMb": after / MIB }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Hands out the scripted readings in order, then repeats the last one.
    struct Scripted(Mutex<Vec<u64>>);

    impl MemorySampler for Scripted {
        fn rss_bytes(&self) -> Option<u64> {
            let mut readings = self.0.lock().unwrap();
            if readings.len() > 1 {
                Some(readings.remove(0))
            } else {
                readings.first().copied()
            }
        }
    }

    struct Unavailable;

    impl MemorySampler for Unavailable {
        fn rss_bytes(&self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn parses_vm_rss_in_kib() {
        let status = "Name:\tfeedsync\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2 * MIB));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn classification_boundaries_are_inclusive() {
        let t = GuardThresholds::from_megabytes(512, 1024);

        assert_eq!(classify(511 * MIB, &t), Pressure::Normal);
        assert_eq!(classify(512 * MIB, &t), Pressure::Warn);
        assert_eq!(classify(1024 * MIB, &t), Pressure::Max);
    }

    #[tokio::test]
    async fn returns_the_work_output_even_above_max() {
        let guard = ResourceGuard::with_sampler(
            GuardThresholds::from_megabytes(1, 2),
            Arc::new(Scripted(Mutex::new(vec![4 * MIB, 40 * MIB]))),
        );

        let out: Result<u32, String> = guard.execute("feed:1", async { Err("bad xml".to_string()) }).await;
        assert_eq!(out, Err("bad xml".to_string()));
    }

    #[tokio::test]
    async fn runs_without_a_sampler_reading() {
        let guard = ResourceGuard::with_sampler(GuardThresholds::default(), Arc::new(Unavailable));
        assert_eq!(guard.execute("feed:1", async { 7 }).await, 7);
    }

    #[tokio::test]
    async fn panics_pass_through_after_the_post_check() {
        let sampler = Arc::new(Scripted(Mutex::new(vec![MIB, 2 * MIB, 3 * MIB])));
        let guard = ResourceGuard::with_sampler(GuardThresholds::default(), sampler.clone());

        let outcome = AssertUnwindSafe(guard.execute("feed:1", async {
            let fail = true;
            if fail {
                panic!("boom");
            }
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        // Two readings consumed: the post-check ran.
        assert_eq!(sampler.0.lock().unwrap().as_slice(), &[3 * MIB]);
    }

    #[test]
    fn proc_sampler_reads_something_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(ProcStatusSampler.rss_bytes().is_some_and(|b| b > 0));
        }
    }
}
