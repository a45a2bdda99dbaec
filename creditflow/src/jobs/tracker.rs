//! Single owner of job state transitions.
//!
//! Every transition is a compare-and-set against the state the caller observed. When two paths
//! race (webhook vs poll, poll vs user cancel) exactly one wins; the loser gets `None` and drops
//! its update. Whoever wins a transition to FAILED issues the refund, keyed `"{job_id}:refund"`,
//! so even a duplicate refund attempt is a ledger replay.

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::types::{FailureReason, Job, JobState, JobTransition};
use super::{JobError, Result};
use crate::db::Storage;
use crate::db::models::credits::{EntryReason, LedgerEntry, job_debit_key, job_refund_key};
use crate::ledger::CreditLedger;
use crate::providers::ProviderStatus;
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{JobId, abbrev_uuid};

/// What happened when a provider status was applied to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// This call moved the job to a terminal state
    Applied(Job),
    /// The job was already terminal, or another path got there first
    Late(Job),
    /// The job has not reached SUBMITTED, so there is nothing to complete yet
    NotSubmitted(Job),
    /// The status was not terminal
    StillRunning,
}

#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn Storage>,
    ledger: CreditLedger,
    retry: RetryPolicy,
}

impl JobTracker {
    pub fn new(store: Arc<dyn Storage>, ledger: CreditLedger, retry: RetryPolicy) -> Self {
        Self { store, ledger, retry }
    }

    /// Compare-and-set `from → transition.to`. `None` means the job was not in `from`.
    #[instrument(skip(self, transition), fields(job_id = %abbrev_uuid(&job_id), to = %transition.to))]
    pub async fn transition(&self, job_id: JobId, from: JobState, transition: &JobTransition) -> Result<Option<Job>> {
        if !from.can_transition_to(transition.to) {
            return Err(JobError::IllegalTransition {
                job_id,
                from,
                to: transition.to,
            });
        }

        let updated = with_retry(&self.retry, "transition_job", || {
            self.store.transition_job(job_id, from, transition)
        })
        .await?;

        match &updated {
            Some(job) => {
                counter!("creditflow_jobs_transitions_total", "to" => transition.to.as_str()).increment(1);
                info!(
                    user_id = %job.user_id,
                    %from,
                    correlation_id = job.external_correlation_id.as_deref().unwrap_or("-"),
                    "Job transitioned"
                );
            }
            None => debug!(%from, "Transition lost: job is no longer in the expected state"),
        }
        Ok(updated)
    }

    /// Move the job to FAILED and refund it if it was debited. `None` if another path won.
    pub async fn fail(&self, job_id: JobId, from: JobState, reason: FailureReason, detail: Option<String>) -> Result<Option<Job>> {
        let Some(job) = self.transition(job_id, from, &JobTransition::failed(reason, detail)).await? else {
            return Ok(None);
        };

        if let Err(e) = self.refund_if_debited(&job).await {
            // The refund sweep retries FAILED jobs whose refund is missing.
            warn!(job_id = %job.id, error = %e, "Refund failed, leaving it to the reconciliation sweep");
        }
        Ok(Some(job))
    }

    /// Refund a failed job's debit, if there was one. Safe to call repeatedly.
    #[instrument(skip(self, job), fields(job_id = %abbrev_uuid(&job.id)))]
    pub async fn refund_if_debited(&self, job: &Job) -> Result<Option<LedgerEntry>> {
        if job.state != JobState::Failed {
            return Err(JobError::InvalidState {
                job_id: job.id,
                state: job.state,
            });
        }
        if self.ledger.entry(&job_debit_key(job.id)).await?.is_none() {
            return Ok(None);
        }

        let entry = self
            .ledger
            .credit(&job.user_id, job.cost_in_credits, EntryReason::JobRefund, &job_refund_key(job.id))
            .await?;
        counter!("creditflow_jobs_refunds_total").increment(1);
        Ok(Some(entry))
    }

    /// Apply a provider status to a job. Shared by the webhook and poll paths.
    #[instrument(skip(self, job), fields(job_id = %abbrev_uuid(&job.id)))]
    pub async fn complete(&self, job: &Job, status: &ProviderStatus) -> Result<CompletionOutcome> {
        if !status.is_terminal() {
            return Ok(CompletionOutcome::StillRunning);
        }
        if job.state.is_terminal() {
            return Ok(CompletionOutcome::Late(job.clone()));
        }
        if job.state != JobState::Submitted {
            return Ok(CompletionOutcome::NotSubmitted(job.clone()));
        }

        let applied = match status {
            ProviderStatus::Succeeded { result_ref } => {
                self.transition(job.id, JobState::Submitted, &JobTransition::succeeded(result_ref.clone()))
                    .await?
            }
            ProviderStatus::Failed { error } => {
                self.fail(job.id, JobState::Submitted, FailureReason::ProviderFailed, error.clone())
                    .await?
            }
            ProviderStatus::Pending => None,
        };

        match applied {
            Some(job) => Ok(CompletionOutcome::Applied(job)),
            None => {
                let current = self.store.get_job(job.id).await?.ok_or(JobError::NotFound(job.id))?;
                Ok(CompletionOutcome::Late(current))
            }
        }
    }
}
