//! In-memory feed repository for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use feedsync_core::{FeedId, FeedRepository, FeedResource, RepositoryError, RepositoryResult};

/// A feed row plus the bookkeeping the store owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    pub feed: FeedResource,
    pub enabled: bool,
    pub fetch_interval: Duration,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of recorded outcomes.
    pub fetch_count: u32,
}

impl FeedRecord {
    /// Enabled, never fetched, ten-minute interval.
    pub fn new(feed: FeedResource) -> Self {
        Self {
            feed,
            enabled: true,
            fetch_interval: Duration::from_secs(600),
            last_fetched_at: None,
            last_error: None,
            fetch_count: 0,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_fetched_at = Some(at);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval = interval;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_fetched_at {
            None => true,
            Some(at) => {
                let Ok(interval) = chrono::Duration::from_std(self.fetch_interval) else {
                    return false;
                };
                at.checked_add_signed(interval).is_some_and(|due| due <= now)
            }
        }
    }
}

/// Feed repository backed by a map, ordered by id.
#[derive(Debug, Default)]
pub struct InMemoryFeedRepository {
    records: Mutex<BTreeMap<FeedId, FeedRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryFeedRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feeds(feeds: impl IntoIterator<Item = FeedResource>) -> Self {
        let repo = Self::new();
        for feed in feeds {
            repo.insert(FeedRecord::new(feed));
        }
        repo
    }

    pub fn insert(&self, record: FeedRecord) {
        self.lock_records().insert(record.feed.id, record);
    }

    pub fn delete(&self, id: FeedId) -> bool {
        self.lock_records().remove(&id).is_some()
    }

    pub fn record(&self, id: FeedId) -> Option<FeedRecord> {
        self.lock_records().get(&id).cloned()
    }

    /// Simulate the store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> RepositoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::unavailable("in-memory feed store marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, BTreeMap<FeedId, FeedRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FeedRepository for InMemoryFeedRepository {
    async fn find_enabled_due(&self) -> RepositoryResult<Vec<FeedResource>> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .lock_records()
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.feed.clone())
            .collect())
    }

    async fn find_by_id(&self, id: FeedId) -> RepositoryResult<Option<FeedResource>> {
        self.check_available()?;
        Ok(self.lock_records().get(&id).map(|r| r.feed.clone()))
    }

    async fn update_last_fetched(&self, id: FeedId, error: Option<&str>) -> RepositoryResult<()> {
        self.check_available()?;
        let mut records = self.lock_records();
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        record.last_fetched_at = Some(Utc::now());
        record.last_error = error.map(str::to_string);
        record.fetch_count += 1;
        Ok(())
    }
}
