//! Processing callback seam.
//!
//! Fetching, parsing and turning feed items into posts is owned by the caller;
//! the ingestion subsystem only schedules, serialises and records attempts.

use async_trait::async_trait;

use crate::feed::{FeedResource, ProcessOutcome};

/// Processes one feed. Errors are opaque to the subsystem and end up as the
/// feed's last-error text.
#[async_trait]
pub trait FeedProcessor: Send + Sync + 'static {
    async fn process(&self, feed: &FeedResource) -> anyhow::Result<ProcessOutcome>;
}

/// Adapter so plain async closures can serve as processors.
///
/// ```ignore
/// let processor = FnProcessor::new(|feed| async move {
///     Ok(ProcessOutcome { items_processed: 1, posts_created: 0 })
/// });
/// ```
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> FeedProcessor for FnProcessor<F>
where
    F: Fn(FeedResource) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<ProcessOutcome>> + Send + 'static,
{
    async fn process(&self, feed: &FeedResource) -> anyhow::Result<ProcessOutcome> {
        (self.f)(feed.clone()).await
    }
}
