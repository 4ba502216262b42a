//! In-memory lock store for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::store::{LockStore, LockStoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Single-process lock store.
///
/// - Every operation is atomic under one mutex
/// - Expiry follows the tokio clock, so paused-time tests can step past a TTL
/// - `set_available(false)` simulates an unreachable store
#[derive(Debug)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated reachability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.lock_entries()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), LockStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockStoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Drop `key` if it has expired, then return the live entry (if any).
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.check_available()?;
        let mut entries = self.lock_entries();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        self.check_available()?;
        let mut entries = self.lock_entries();
        Ok(Self::live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError> {
        self.check_available()?;
        let mut entries = self.lock_entries();
        let owned = Self::live(&mut entries, key).is_some_and(|e| e.value == value);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.check_available()?;
        let mut entries = self.lock_entries();
        match Self::live(&mut entries, key) {
            Some(entry) if entry.value == value => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
