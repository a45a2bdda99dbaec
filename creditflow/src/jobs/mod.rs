//! Job lifecycle: validation, credit reservation, submission and completion tracking.
//!
//! - [`orchestrator::JobOrchestrator`] creates jobs, debits credits and submits work
//! - [`tracker::JobTracker`] owns every state transition and the refund that follows a failure
//! - [`poller::CompletionPoller`] polls the provider when no webhook arrives and runs the sweeps

pub mod orchestrator;
pub mod poller;
pub mod request;
pub mod tracker;
pub mod transitions;
pub mod types;

use thiserror::Error;

use crate::db::errors::DbError;
use crate::ledger::LedgerError;
use crate::providers::ProviderError;
use crate::types::JobId;
use types::JobState;

#[derive(Error, Debug)]
pub enum JobError {
    /// Malformed request, rejected before any mutation
    #[error("Invalid job request: {0}")]
    Validation(String),

    /// The debit was refused; the job failed without reaching the provider
    #[error("Insufficient credits for job {job_id}: balance {balance}, required {required}")]
    InsufficientCredits { job_id: JobId, balance: i64, required: i64 },

    #[error("Job {0} not found")]
    NotFound(JobId),

    /// Submission failed after retries; the job is FAILED and refunded
    #[error("Provider unavailable for job {job_id}: {source}")]
    ProviderUnavailable {
        job_id: JobId,
        #[source]
        source: ProviderError,
    },

    #[error("Job {job_id} is {state}")]
    InvalidState { job_id: JobId, state: JobState },

    #[error("Illegal transition {from} -> {to} for job {job_id}")]
    IllegalTransition { job_id: JobId, from: JobState, to: JobState },

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<LedgerError> for JobError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Database(db) => JobError::Database(db),
            other => JobError::Ledger(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
