//! Job handlers.
//!
//! Handlers must be idempotent: the queue delivers at least once.

pub mod feed_worker;

pub use feed_worker::{FeedWorker, WorkerError};
