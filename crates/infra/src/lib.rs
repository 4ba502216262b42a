//! Infrastructure layer: job queue, distributed locks, feed storage, the
//! periodic scheduler and the feed worker.

pub mod config;
pub mod feeds;
pub mod guard;
pub mod jobs;
pub mod lock;
pub mod scheduler;
pub mod workers;

#[cfg(test)]
mod integration_tests;
