//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::logging::LogLevel;

/// Initialize tracing/logging for the process.
///
/// `RUST_LOG` wins when set; otherwise the minimum level comes from
/// `LOG_LEVEL` (default `info`). Safe to call multiple times (subsequent calls
/// are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LogLevel::from_env().as_str()));

    // JSON logs + timestamps.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
