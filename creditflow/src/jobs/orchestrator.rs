//! Job submission: validate, debit, submit.
//!
//! The debit is committed before the provider is called and no store lock is held while the call is
//! in flight. A failed submission is compensated afterwards by a refund rather than rolled back.
//!
//! Retries and pack jobs get ids derived from their origin (UUIDv5), so a resent request collides
//! on the job's primary key and gets the existing job back instead of a second debit.

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::request::{JobRequest, http_url};
use super::tracker::JobTracker;
use super::types::{FailureReason, Job, JobKind, JobState, JobTransition, NewJob};
use super::{JobError, Result};
use crate::config::{JobCosts, JobsConfig};
use crate::db::Storage;
use crate::db::errors::DbError;
use crate::db::models::credits::job_debit_key;
use crate::ledger::{CreditLedger, LedgerError};
use crate::providers::{JobProvider, JobSubmission, ProviderError};
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{JobId, abbrev_uuid, time_after};

/// A job submission as received from a user.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub kind: JobKind,
    pub payload: Value,
    /// Client's idea of the cost. Must match the configured cost when given.
    pub cost: Option<i64>,
}

/// GENERATE prompts submitted together, one job per prompt.
#[derive(Debug, Clone)]
pub struct SubmitPack {
    /// Caller's key for the pack. Submitting the same key again returns the same jobs.
    pub pack_id: Uuid,
    pub prompts: Vec<String>,
    /// TRAIN job whose weights every prompt is generated with
    pub model_job_id: Option<JobId>,
}

/// Id of the job created by retrying `original`.
pub fn retry_job_id(original: JobId) -> JobId {
    Uuid::new_v5(&original, b"retry")
}

/// Id of the job for prompt `index` of a user's pack.
pub fn pack_job_id(pack_id: Uuid, user_id: &str, index: usize) -> JobId {
    Uuid::new_v5(&pack_id, format!("{user_id}:{index}").as_bytes())
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn Storage>,
    ledger: CreditLedger,
    tracker: JobTracker,
    provider: Arc<dyn JobProvider>,
    config: JobsConfig,
    costs: JobCosts,
    retry: RetryPolicy,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        ledger: CreditLedger,
        tracker: JobTracker,
        provider: Arc<dyn JobProvider>,
        config: JobsConfig,
        costs: JobCosts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            tracker,
            provider,
            config,
            costs,
            retry,
        }
    }

    /// Validate, debit and submit a job. Returns the job as stored once submission settled.
    pub async fn submit(&self, user_id: &str, request: SubmitJob) -> Result<Job> {
        self.submit_inner(user_id, request, Uuid::new_v4(), None).await
    }

    /// Submit `job_id` unless it already exists, in which case the existing job is returned.
    #[instrument(skip(self, request), fields(kind = %request.kind, job_id = %abbrev_uuid(&job_id)))]
    async fn submit_inner(&self, user_id: &str, request: SubmitJob, job_id: JobId, retry_of: Option<JobId>) -> Result<Job> {
        let parsed = JobRequest::parse(request.kind, &request.payload)?;
        let parsed = self.resolve_model(user_id, parsed).await?;
        let cost = self.costs.for_kind(request.kind);
        if let Some(client_cost) = request.cost
            && client_cost != cost
        {
            return Err(JobError::Validation(format!(
                "cost {client_cost} does not match the price of a {} job ({cost} credits)",
                request.kind
            )));
        }

        let new_job = NewJob {
            id: job_id,
            user_id: user_id.to_string(),
            kind: request.kind,
            payload: parsed.to_payload(),
            cost_in_credits: cost,
            retry_of,
        };
        let job = match with_retry(&self.retry, "insert_job", || self.store.insert_job(&new_job)).await {
            Ok(job) => job,
            Err(DbError::UniqueViolation { .. }) => {
                info!("Job already submitted");
                return self.get(user_id, job_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        match self.ledger.debit(user_id, cost, &job_debit_key(job.id)).await {
            Ok(_) => {}
            Err(LedgerError::InsufficientCredits { balance, required }) => {
                self.tracker
                    .fail(job.id, JobState::Created, FailureReason::InsufficientCredits, None)
                    .await?;
                return Err(JobError::InsufficientCredits {
                    job_id: job.id,
                    balance,
                    required,
                });
            }
            // The job stays CREATED; the stale submission sweep fails it later.
            Err(e) => return Err(e.into()),
        }

        if self
            .tracker
            .transition(job.id, JobState::Created, &JobTransition::debited())
            .await?
            .is_none()
        {
            // Canceled between insert and debit. The canceling path may not have seen the debit.
            let current = self.current(job.id).await?;
            if current.state == JobState::Failed {
                self.tracker.refund_if_debited(&current).await?;
            }
            return Ok(current);
        }

        let submission = JobSubmission {
            job_id: job.id,
            kind: job.kind,
            input: parsed.provider_input(),
        };
        match self.submit_to_provider(&submission).await {
            Ok(correlation_id) => self.record_submission(job.id, correlation_id).await,
            Err(e) => {
                warn!(error = %e, provider = self.provider.name(), "Submission failed, refunding");
                self.tracker
                    .fail(job.id, JobState::Debited, FailureReason::ProviderError, Some(e.to_string()))
                    .await?;
                Err(JobError::ProviderUnavailable { job_id: job.id, source: e })
            }
        }
    }

    /// Point a GENERATE request that names a trained model at that model's weights.
    async fn resolve_model(&self, user_id: &str, request: JobRequest) -> Result<JobRequest> {
        match request {
            JobRequest::Generate {
                prompt,
                model_job_id: Some(model_job_id),
                ..
            } => Ok(JobRequest::Generate {
                prompt,
                lora_url: Some(self.model_weights(user_id, model_job_id).await?),
                model_job_id: Some(model_job_id),
            }),
            other => Ok(other),
        }
    }

    /// Weights of a trained model. The model must be the user's own TRAIN job and must have SUCCEEDED.
    async fn model_weights(&self, user_id: &str, model_job_id: JobId) -> Result<Url> {
        let model = self.get(user_id, model_job_id).await?;
        if model.kind != JobKind::Train {
            return Err(JobError::Validation(format!("job {model_job_id} is not a TRAIN job")));
        }
        if model.state != JobState::Succeeded {
            return Err(JobError::InvalidState {
                job_id: model_job_id,
                state: model.state,
            });
        }
        let weights = model
            .result_ref
            .as_deref()
            .ok_or_else(|| JobError::Validation(format!("model {model_job_id} has no weights")))?;
        http_url(weights, "weights")
    }

    /// Submit one GENERATE job per prompt.
    ///
    /// Everything is validated and the balance is checked against the jobs not yet created before
    /// anything is written. Each job is then debited on its own, so a concurrent spend can still
    /// fail later jobs of the pack with INSUFFICIENT_CREDITS. Jobs are returned in prompt order.
    #[instrument(skip(self, pack), fields(pack_id = %pack.pack_id, prompts = pack.prompts.len()))]
    pub async fn submit_pack(&self, user_id: &str, pack: SubmitPack) -> Result<Vec<Job>> {
        if pack.prompts.is_empty() {
            return Err(JobError::Validation("a pack needs at least one prompt".to_string()));
        }
        if pack.prompts.len() > self.config.max_pack_size {
            return Err(JobError::Validation(format!(
                "a pack takes at most {} prompts, got {}",
                self.config.max_pack_size,
                pack.prompts.len()
            )));
        }

        let requests = pack
            .prompts
            .iter()
            .map(|prompt| {
                let mut payload = json!({"prompt": prompt});
                if let Some(id) = pack.model_job_id {
                    payload["modelJobId"] = json!(id);
                }
                JobRequest::parse(JobKind::Generate, &payload)?;
                Ok(SubmitJob {
                    kind: JobKind::Generate,
                    payload,
                    cost: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(model_job_id) = pack.model_job_id {
            self.model_weights(user_id, model_job_id).await?;
        }

        let ids: Vec<JobId> = (0..requests.len())
            .map(|index| pack_job_id(pack.pack_id, user_id, index))
            .collect();
        let mut missing = 0;
        for id in &ids {
            if self.store.get_job(*id).await?.is_none() {
                missing += 1;
            }
        }
        let required = missing * self.costs.for_kind(JobKind::Generate);
        let balance = self.ledger.balance(user_id).await?.balance;
        if balance < required {
            return Err(LedgerError::InsufficientCredits { balance, required }.into());
        }

        let jobs = try_join_all(
            requests
                .into_iter()
                .zip(ids)
                .map(|(request, id)| self.submit_pack_job(user_id, request, id)),
        )
        .await?;
        info!(jobs = jobs.len(), "Pack submitted");
        Ok(jobs)
    }

    /// A pack job that failed at submission is reported as the FAILED job, not as an error.
    async fn submit_pack_job(&self, user_id: &str, request: SubmitJob, job_id: JobId) -> Result<Job> {
        match self.submit_inner(user_id, request, job_id, None).await {
            Ok(job) => Ok(job),
            Err(JobError::InsufficientCredits { job_id, .. } | JobError::ProviderUnavailable { job_id, .. }) => {
                self.current(job_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Each attempt is bounded by `submit_timeout`; timeouts and transient errors are retried.
    async fn submit_to_provider(&self, submission: &JobSubmission) -> std::result::Result<String, ProviderError> {
        let policy = RetryPolicy {
            max_attempts: self.config.submit_attempts,
            ..self.retry
        };
        with_retry(&policy, "provider_submit", || async {
            timeout(self.config.submit_timeout, self.provider.submit(submission))
                .await
                .map_err(|_| ProviderError::Timeout)?
        })
        .await
    }

    async fn record_submission(&self, job_id: JobId, correlation_id: String) -> Result<Job> {
        let now = Utc::now();
        let first_poll_at = if self.provider.delivers_webhooks() {
            time_after(now, self.config.webhook_grace_period)
        } else {
            time_after(now, self.config.poll_interval)
        };

        let transition = JobTransition::submitted(correlation_id.clone(), now, first_poll_at);
        match self.tracker.transition(job_id, JobState::Debited, &transition).await? {
            Some(job) => {
                info!(%correlation_id, provider = self.provider.name(), "Job submitted");
                Ok(job)
            }
            None => {
                // Canceled while the provider call was in flight
                if let Err(e) = self.provider.cancel(&correlation_id).await {
                    warn!(%correlation_id, error = %e, "Could not cancel orphaned provider job");
                }
                self.current(job_id).await
            }
        }
    }

    /// Fail a non-terminal job with CANCELED, refunding it if it was debited.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&job_id)))]
    pub async fn cancel(&self, user_id: &str, job_id: JobId) -> Result<Job> {
        // States only move forward, so this loop runs at most once per state.
        let canceled = loop {
            let job = self.get(user_id, job_id).await?;
            if job.state.is_terminal() {
                return Err(JobError::InvalidState {
                    job_id,
                    state: job.state,
                });
            }
            if let Some(canceled) = self
                .tracker
                .fail(job_id, job.state, FailureReason::Canceled, Some("canceled by user".to_string()))
                .await?
            {
                break canceled;
            }
        };

        if let Some(correlation_id) = canceled.external_correlation_id.as_deref()
            && let Err(e) = self.provider.cancel(correlation_id).await
        {
            warn!(%correlation_id, error = %e, "Provider cancel failed");
        }
        Ok(canceled)
    }

    /// Submit a FAILED job again as a new job. The original is left untouched.
    ///
    /// A job is retried at most once: retrying it again returns the job the first retry created.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&job_id)))]
    pub async fn retry(&self, user_id: &str, job_id: JobId) -> Result<Job> {
        let original = self.get(user_id, job_id).await?;
        if original.state != JobState::Failed {
            return Err(JobError::InvalidState {
                job_id,
                state: original.state,
            });
        }
        let request = SubmitJob {
            kind: original.kind,
            payload: original.payload,
            cost: None,
        };
        self.submit_inner(user_id, request, retry_job_id(job_id), Some(job_id)).await
    }

    /// A job owned by `user_id`. Other users' jobs are reported as missing.
    pub async fn get(&self, user_id: &str, job_id: JobId) -> Result<Job> {
        match self.store.get_job(job_id).await? {
            Some(job) if job.user_id == user_id => Ok(job),
            _ => Err(JobError::NotFound(job_id)),
        }
    }

    pub async fn list(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<Job>> {
        Ok(self.store.list_user_jobs(user_id, skip, limit).await?)
    }

    async fn current(&self, job_id: JobId) -> Result<Job> {
        self.store.get_job(job_id).await?.ok_or(JobError::NotFound(job_id))
    }
}
