//! `feedsync-core`: domain foundation for scheduled feed ingestion.
//!
//! This crate contains **pure domain** types and the seams the ingestion
//! subsystem consumes (no infrastructure concerns).

pub mod error;
pub mod feed;
pub mod id;
pub mod processor;
pub mod repository;

pub use error::{RepositoryError, RepositoryResult};
pub use feed::{FeedResource, ProcessOutcome};
pub use id::FeedId;
pub use processor::{FeedProcessor, FnProcessor};
pub use repository::FeedRepository;
