//! Lock store abstraction.

use std::time::Duration;

use async_trait::async_trait;

/// Lock store error.
///
/// `Unavailable` means the store could not be reached at all; only that case
/// is eligible for fail-open acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[error("lock store command failed: {0}")]
    Command(String),
    #[error("invalid lock store configuration: {0}")]
    Configuration(String),
}

impl LockStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LockStoreError::Unavailable(_))
    }
}

/// Atomic key-value primitives a distributed lock needs.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// `SET key value NX PX ttl`. Returns `true` iff the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Current value of `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError>;

    /// Delete `key` only if it currently holds `value`. Returns `true` iff deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `value`.
    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError>;
}
