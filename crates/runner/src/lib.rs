//! Feed ingestion runner: configuration, wiring, and the process entry modes.

pub mod app;
pub mod processor;
