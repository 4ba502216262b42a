//! Distributed lock: one acquisition of one namespaced key.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use feedsync_core::FeedId;
use feedsync_observability::{ErrorDetail, Logger};
use futures::FutureExt;
use serde_json::json;

use super::store::{LockStore, LockStoreError};

/// Namespace for every lock key written by this crate.
pub const LOCK_KEY_PREFIX: &str = "feedsync:lock:";

const SCHEDULER_LOCK_NAME: &str = "scheduler:feeds";

/// Lock error.
///
/// "Held by someone else" is never an error for `acquire`; `NotAcquired` is
/// only produced by [`DistributedLock::execute`], which has no `false` to return.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire lock {key}")]
    NotAcquired { key: String },

    #[error(transparent)]
    Store(#[from] LockStoreError),
}

/// Per-lock behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Total `acquire` attempts made by `acquire_with_retry` (at least 1).
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Treat an unreachable store as a successful acquisition.
    ///
    /// Keeps a single-instance deployment running without its coordination
    /// store. With several instances and a down store, every instance gets the
    /// lock, so mutual exclusion is lost for the duration of the outage.
    pub fail_open: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            fail_open: true,
        }
    }
}

/// A named, TTL-bounded mutual-exclusion token.
///
/// The holder value written on `acquire` is kept locally and used for the
/// compare-and-act in `release`/`extend`. A lock with no store (or one that
/// failed open) is "degraded": it always acquires and releases locally.
pub struct DistributedLock {
    key: String,
    store: Option<Arc<dyn LockStore>>,
    options: LockOptions,
    holder: Option<String>,
    degraded: bool,
    log: Logger,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("held", &self.holder.is_some())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl DistributedLock {
    /// Lock on `name`, stored under `LOCK_KEY_PREFIX + name`.
    pub fn new(name: &str, store: Option<Arc<dyn LockStore>>, options: LockOptions) -> Self {
        Self {
            key: format!("{LOCK_KEY_PREFIX}{name}"),
            store,
            options,
            holder: None,
            degraded: false,
            log: Logger::new("distributed-lock"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Whether this instance currently holds the lock (as far as it knows).
    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    /// One acquisition attempt.
    ///
    /// Returns `Ok(false)` if the key is held by anyone, including this
    /// instance. Store errors propagate unless the store is unreachable and
    /// the lock fails open.
    pub async fn acquire(&mut self) -> Result<bool, LockError> {
        if self.holder.is_some() {
            return Ok(false);
        }

        let holder = new_holder_value();
        let Some(store) = self.store.as_ref() else {
            self.degraded = true;
            self.holder = Some(holder);
            return Ok(true);
        };

        match store.set_if_absent(&self.key, &holder, self.options.ttl).await {
            Ok(true) => {
                self.degraded = false;
                self.holder = Some(holder);
                self.log.debug("lock acquired", json!({ "key": self.key }));
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) if e.is_unavailable() && self.options.fail_open => {
                self.log.warn(
                    "lock store unreachable; proceeding without lock",
                    json!({ "key": self.key, "reason": e.to_string() }),
                );
                self.degraded = true;
                self.holder = Some(holder);
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `acquire` up to `max_attempts` times, sleeping `retry_delay` in between.
    pub async fn acquire_with_retry(&mut self) -> Result<bool, LockError> {
        let attempts = self.options.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.acquire().await? {
                return Ok(true);
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        self.log.debug(
            "lock busy after retries",
            json!({ "key": self.key, "attempts": attempts }),
        );
        Ok(false)
    }

    /// Compare-and-delete. The local holder value is cleared either way.
    pub async fn release(&mut self) -> Result<bool, LockError> {
        let Some(holder) = self.holder.take() else {
            return Ok(false);
        };
        if std::mem::take(&mut self.degraded) {
            return Ok(true);
        }
        let Some(store) = self.store.as_ref() else {
            return Ok(true);
        };

        let released = store.delete_if_equals(&self.key, &holder).await?;
        if released {
            self.log.debug("lock released", json!({ "key": self.key }));
        } else {
            self.log.warn(
                "lock no longer owned at release (expired or taken over)",
                json!({ "key": self.key }),
            );
        }
        Ok(released)
    }

    /// Compare-and-expire: reset the TTL to `ttl` if still owned.
    pub async fn extend(&mut self, ttl: Duration) -> Result<bool, LockError> {
        let Some(holder) = self.holder.as_deref() else {
            return Ok(false);
        };
        if self.degraded {
            return Ok(true);
        }
        let Some(store) = self.store.as_ref() else {
            return Ok(true);
        };

        let extended = store.expire_if_equals(&self.key, holder, ttl).await?;
        if !extended {
            self.log.warn("lock no longer owned at extend", json!({ "key": self.key }));
        }
        Ok(extended)
    }

    /// Whether anyone holds the key right now. Diagnostic only.
    pub async fn is_locked(&self) -> Result<bool, LockError> {
        match self.store.as_ref() {
            Some(store) => Ok(store.get(&self.key).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Run `f` under the lock.
    ///
    /// Acquires with retry, fails with `NotAcquired` if the lock stays busy,
    /// and releases on every exit path. A panic in `f` is re-raised after the
    /// release.
    pub async fn execute<F, Fut, T>(&mut self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_with_retry().await? {
            return Err(LockError::NotAcquired {
                key: self.key.clone(),
            });
        }

        let result = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release().await {
            self.log.error(
                "failed to release lock",
                ErrorDetail::of(&e),
                json!({ "key": self.key }),
            );
        }

        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

// pid:millis:random, unique per acquisition attempt.
fn new_holder_value() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}:{}:{:016x}", std::process::id(), millis, rand::random::<u64>())
}

/// Settings for the two pre-configured locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub scheduler_ttl: Duration,
    pub feed_ttl: Duration,
    pub feed_max_attempts: u32,
    pub feed_retry_delay: Duration,
    pub fail_open: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            scheduler_ttl: Duration::from_secs(600),
            feed_ttl: Duration::from_secs(300),
            feed_max_attempts: 3,
            feed_retry_delay: Duration::from_millis(500),
            fail_open: true,
        }
    }
}

/// Builds the scheduler-wide lock and the per-feed locks over one store.
#[derive(Clone)]
pub struct LockFactory {
    store: Option<Arc<dyn LockStore>>,
    settings: LockSettings,
}

impl std::fmt::Debug for LockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFactory")
            .field("has_store", &self.store.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl LockFactory {
    pub fn new(store: Option<Arc<dyn LockStore>>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    /// Factory without a coordination store: every lock acquires.
    pub fn local(settings: LockSettings) -> Self {
        Self::new(None, settings)
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Single key, long TTL, one attempt: skip rather than wait.
    pub fn scheduler_lock(&self) -> DistributedLock {
        DistributedLock::new(
            SCHEDULER_LOCK_NAME,
            self.store.clone(),
            LockOptions {
                ttl: self.settings.scheduler_ttl,
                max_attempts: 1,
                retry_delay: Duration::ZERO,
                fail_open: self.settings.fail_open,
            },
        )
    }

    /// `feed:<id>`, shorter TTL, brief retry.
    pub fn feed_lock(&self, feed_id: FeedId) -> DistributedLock {
        DistributedLock::new(
            &format!("feed:{feed_id}"),
            self.store.clone(),
            LockOptions {
                ttl: self.settings.feed_ttl,
                max_attempts: self.settings.feed_max_attempts,
                retry_delay: self.settings.feed_retry_delay,
                fail_open: self.settings.fail_open,
            },
        )
    }
}
