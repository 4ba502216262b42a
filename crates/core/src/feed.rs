//! Feed resource as seen by the ingestion subsystem.

use serde::{Deserialize, Serialize};

use crate::id::FeedId;

/// A feed due for (or undergoing) ingestion.
///
/// The external store owns the full record (enable flag, fetch interval, last
/// attempt); ingestion only needs identity plus something readable for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedResource {
    pub id: FeedId,
    pub url: String,
    pub name: String,
}

impl FeedResource {
    pub fn new(id: impl Into<FeedId>, url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: name.into(),
        }
    }
}

/// What a processing callback reports after handling one feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub items_processed: u32,
    pub posts_created: u32,
}
