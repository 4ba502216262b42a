//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Identifier of a feed row in the external store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(i64);

impl FeedId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for FeedId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for FeedId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<FeedId> for i64 {
    fn from(value: FeedId) -> Self {
        value.0
    }
}

impl FromStr for FeedId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}
