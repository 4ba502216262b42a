//! Feed repository seam (external data store).

use async_trait::async_trait;

use crate::error::RepositoryResult;
use crate::feed::FeedResource;
use crate::id::FeedId;

/// Narrow view of the relational store used by the scheduler and worker.
#[async_trait]
pub trait FeedRepository: Send + Sync + 'static {
    /// Feeds that are enabled and whose fetch interval has elapsed since the
    /// last attempt (or that were never attempted).
    async fn find_enabled_due(&self) -> RepositoryResult<Vec<FeedResource>>;

    async fn find_by_id(&self, id: FeedId) -> RepositoryResult<Option<FeedResource>>;

    /// Record the outcome of an attempt: `None` means success, `Some(msg)`
    /// stores the error message as the feed's last error.
    async fn update_last_fetched(&self, id: FeedId, error: Option<&str>) -> RepositoryResult<()>;
}
