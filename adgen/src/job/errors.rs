use thiserror::Error;

use crate::job::JobStatusKind;
use crate::ledger::LedgerError;
use crate::types::JobId;

/// Errors raised by the job queue and job stores.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} already exists")]
    AlreadyExists(JobId),

    /// The worker's claim was taken over (stalled requeue) before it could write.
    #[error("Claim on job {0} was lost")]
    ClaimLost(JobId),

    #[error("Job {job_id} is {status} and can no longer be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatusKind },

    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;
