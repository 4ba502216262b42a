//! Repository error model.

use thiserror::Error;

use crate::id::FeedId;

/// Result type used by feed repositories.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Failure talking to the external feed store.
///
/// A missing feed is not an error at this layer (`find_by_id` returns `None`);
/// callers decide whether absence is fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The store could not be reached (connection refused, pool timeout, ...).
    #[error("feed store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the query failed.
    #[error("feed store query failed: {0}")]
    Query(String),

    /// A write targeted a feed that does not exist.
    #[error("feed {0} not found")]
    NotFound(FeedId),
}

impl RepositoryError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }
}
