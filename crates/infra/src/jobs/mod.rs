//! In-process job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are typed by a closed `JobKind`; one handler per kind
//! - Dispatch is timer-driven per job (no poll loop)
//! - Capped exponential backoff between attempts
//! - Jobs that run out of attempts land in a bounded dead-letter list
//! - Memory-resident: queued work does not survive a restart
//!
//! ## Components
//!
//! - `Job`: a queued unit of work with payload and attempt bookkeeping
//! - `JobPayload`: links a payload type to its kind
//! - `JobHandler`: runs one attempt
//! - `JobQueue`: enqueue, dispatch, retry, stats, drain

pub mod handler;
pub mod payload;
pub mod queue;
pub mod types;

pub use handler::{handler_fn, JobError, JobHandler};
pub use payload::{FeedFetchPayload, JobPayload};
pub use queue::{JobQueue, JobQueueError, QueueConfig};
pub use types::{
    DeadLetterEntry, Job, JobId, JobKind, JobOptions, PayloadError, QueueStats, RetryPolicy,
};
