//! Background job queue and processor.
//!
//! `JobQueueService` (§4.1) owns the `jobs` table and all of its state
//! transitions. `JobProcessorService` (§4.3) drains it by dispatching to
//! handlers registered by job type. Handlers cooperate with cancellation
//! through a `CancellationToken` (§4.5).

pub mod cancellation;
pub mod job;
pub mod processor;
pub mod queue;

pub use cancellation::{CancellationToken, JobCancellationSignal};
pub use job::{ExecutionMode, Job, JobCounts, JobFilter, JobId, JobStatus, NewJob};
pub use processor::JobProcessorService;
pub use queue::{CancellationStatus, JobQueueService};

use async_trait::async_trait;

/// §6.5 error taxonomy for the job queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job already claimed: {0}")]
    JobAlreadyClaimed(JobId),
    #[error("an active sequential job already exists for ({reference_type}, {reference_id})")]
    DuplicateActiveJob {
        reference_type: String,
        reference_id: String,
    },
    #[error("no handler registered for job type: {0}")]
    NoHandler(String),
    #[error("job {0} exceeded its retry budget")]
    MaxRetriesExceeded(JobId),
    #[error(transparent)]
    JobCancellationSignal(#[from] JobCancellationSignal),
    #[error("job {0} is not in a cancellable state")]
    JobNotCancellable(JobId),
    /// A store-layer operation failed underneath an otherwise well-formed
    /// request (connection loss, constraint violation, etc).
    #[error("store error: {0}")]
    Store(String),
    /// A registered handler's own business logic failed.
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

impl JobQueueError {
    /// Classification used for operational dashboards.
    pub fn category(&self) -> &'static str {
        match self {
            JobQueueError::JobNotFound(_) => "not_found",
            JobQueueError::JobAlreadyClaimed(_) => "conflict",
            JobQueueError::DuplicateActiveJob { .. } => "conflict",
            JobQueueError::NoHandler(_) => "no_handler",
            JobQueueError::MaxRetriesExceeded(_) => "retry_exhausted",
            JobQueueError::JobCancellationSignal(_) => "cancelled",
            JobQueueError::JobNotCancellable(_) => "invalid_state",
            JobQueueError::Store(_) => "store",
            JobQueueError::HandlerFailed(_) => "handler_failed",
        }
    }
}

/// Result returned by a handler on successful completion; stored as the
/// job's `result` blob.
pub type HandlerResult = Vec<u8>;

/// A registered job type's executable. Handlers are keyed by job type
/// string in the processor's registry, not by subclassing.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: Job,
        token: CancellationToken,
    ) -> Result<HandlerResult, JobQueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = JobQueueError::NoHandler("send_email".to_string());
        assert_eq!(err.category(), "no_handler");
        assert!(err.to_string().contains("send_email"));
    }
}
