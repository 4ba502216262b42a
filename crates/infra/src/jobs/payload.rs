//! Typed job payloads.

use serde::{Deserialize, Serialize};

use feedsync_core::{FeedId, FeedResource};

use super::types::JobKind;

/// Ties a payload type to the job kind that carries it.
pub trait JobPayload: Serialize {
    const KIND: JobKind;
}

/// Payload of a [`JobKind::FeedFetch`] job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedFetchPayload {
    pub feed_id: FeedId,
    pub url: String,
    pub name: String,
}

impl JobPayload for FeedFetchPayload {
    const KIND: JobKind = JobKind::FeedFetch;
}

impl From<&FeedResource> for FeedFetchPayload {
    fn from(feed: &FeedResource) -> Self {
        Self {
            feed_id: feed.id,
            url: feed.url.clone(),
            name: feed.name.clone(),
        }
    }
}
