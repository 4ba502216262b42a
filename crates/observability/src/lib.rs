//! Tracing and structured logging (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Named, leveled structured logger used by every ingestion component.
pub mod logging;

pub use logging::{ErrorDetail, LogContext, LogLevel, Logger};
