//! Distributed mutual exclusion backed by a shared key-value store.
//!
//! ## Design
//!
//! - One key per protected unit of work, namespaced with [`LOCK_KEY_PREFIX`]
//! - Each acquisition writes a fresh holder value; release/extend are
//!   compare-and-act on that value so a late release cannot clobber a newer holder
//! - TTL expiry is enforced by the store, independent of this process
//! - Store unreachability is fail-open by default (see [`LockOptions::fail_open`])
//!
//! ## Components
//!
//! - `LockStore`: the atomic primitives (SET NX PX, GET, compare-and-delete, compare-and-expire)
//! - `InMemoryLockStore`: TTL-aware store for tests/dev
//! - `RedisLockStore`: Redis-backed store (feature `redis`)
//! - `DistributedLock`: one acquisition of one key
//! - `LockFactory`: the scheduler-wide and per-feed lock presets

pub mod distributed;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use distributed::{DistributedLock, LockError, LockFactory, LockOptions, LockSettings, LOCK_KEY_PREFIX};
pub use in_memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use store::{LockStore, LockStoreError};
