//! Feed repository adapters.
//!
//! - `InMemoryFeedRepository`: dev/tests, records every outcome
//! - `PostgresFeedRepository`: the `feeds` table via SQLx

pub mod in_memory;
pub mod postgres;

pub use in_memory::{FeedRecord, InMemoryFeedRepository};
pub use postgres::PostgresFeedRepository;
