//! Job handler contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::payload::JobPayload;
use super::types::Job;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Retryable failure; engages backoff.
    #[error("{message}")]
    Failed { message: String },

    /// Programming error (wrong kind, undecodable payload); never retried.
    #[error("contract violation: {0}")]
    Contract(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Contract(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed(format!("{err:#}"))
    }
}

impl Job {
    /// Decode the payload, treating a mismatch as a contract violation.
    pub fn contract_payload<P>(&self) -> Result<P, JobError>
    where
        P: JobPayload + DeserializeOwned,
    {
        self.payload_as::<P>().map_err(|e| JobError::Contract(e.to_string()))
    }
}

/// Handles jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (self.0)(job.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
