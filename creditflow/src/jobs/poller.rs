//! Background completion poller and reconciliation sweeps.
//!
//! ```text
//! poller.tick()
//!   ├─ poll_due()         SUBMITTED jobs whose next_poll_at has passed
//!   │    ├─ past deadline        → FAILED(TIMEOUT) + refund
//!   │    ├─ provider: pending    → reschedule with backoff
//!   │    ├─ provider: terminal   → tracker.complete()   (races the webhook via CAS)
//!   │    └─ provider: error      → count; FAILED(PROVIDER_ERROR) + refund at the limit
//!   ├─ sweep_orphans()    CREATED/DEBITED jobs abandoned mid-submission → FAILED + refund
//!   ├─ sweep_refunds()    FAILED jobs with a debit but no refund → refund
//!   ├─ sweep_orders()     PENDING orders past their deadline → FAILED
//!   └─ sweep_events()     webhook event ids past their retention → forgotten
//! ```
//!
//! Errors are logged and the cycle moves on; everything left undone is picked up next tick.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::Result;
use super::tracker::{CompletionOutcome, JobTracker};
use super::types::{FailureReason, Job, JobState, PollUpdate};
use crate::config::JobsConfig;
use crate::db::Storage;
use crate::payments::PaymentReconciler;
use crate::providers::{JobProvider, ProviderError, ProviderStatus};
use crate::retry::{RetryPolicy, exponential_backoff, with_retry};
use crate::types::{abbrev_uuid, time_after, time_before};

/// What a single poll did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    StillRunning,
    Completed,
    TimedOut,
    StatusError,
    GaveUp,
    /// The job left SUBMITTED while this poll was in flight
    Superseded,
}

/// Counts from one poller cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub status_errors: usize,
    pub gave_up: usize,
    pub orphans_failed: usize,
    pub refunds_issued: usize,
    pub orders_abandoned: u64,
    pub webhook_events_pruned: u64,
}

impl PollSummary {
    fn record(&mut self, outcome: PollOutcome) {
        self.polled += 1;
        match outcome {
            PollOutcome::Completed => self.completed += 1,
            PollOutcome::TimedOut => self.timed_out += 1,
            PollOutcome::StatusError => self.status_errors += 1,
            PollOutcome::GaveUp => self.gave_up += 1,
            PollOutcome::StillRunning | PollOutcome::Superseded => {}
        }
    }

    fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct CompletionPoller {
    store: Arc<dyn Storage>,
    tracker: JobTracker,
    provider: Arc<dyn JobProvider>,
    config: JobsConfig,
    retry: RetryPolicy,
    payments: Option<PaymentReconciler>,
}

impl CompletionPoller {
    pub fn new(
        store: Arc<dyn Storage>,
        tracker: JobTracker,
        provider: Arc<dyn JobProvider>,
        config: JobsConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            tracker,
            provider,
            config,
            retry,
            payments: None,
        }
    }

    /// Also abandon stale payment orders on every tick.
    pub fn with_payment_sweep(mut self, reconciler: PaymentReconciler) -> Self {
        self.payments = Some(reconciler);
        self
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick = %humantime::format_duration(self.config.poller_tick),
            provider = self.provider.name(),
            "Starting completion poller"
        );
        let mut interval = tokio::time::interval(self.config.poller_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Completion poller shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let summary = self.tick().await;
            if !summary.is_idle() {
                debug!(?summary, "Poller cycle finished");
            }
        }
    }

    /// Run one poll cycle followed by the sweeps.
    pub async fn tick(&self) -> PollSummary {
        let now = Utc::now();
        let mut summary = PollSummary::default();
        self.poll_due(now, &mut summary).await;
        self.sweep_orphans(now, &mut summary).await;
        self.sweep_refunds(&mut summary).await;
        self.sweep_orders(&mut summary).await;
        self.sweep_events(now, &mut summary).await;
        summary
    }

    async fn poll_due(&self, now: DateTime<Utc>, summary: &mut PollSummary) {
        let due = match self.store.due_for_poll(now, self.config.poll_batch_size).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load jobs due for polling");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        let results: Vec<Result<PollOutcome>> = stream::iter(due)
            .map(|job| self.poll_job(job, now))
            .buffer_unordered(self.config.poll_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(e) => error!(error = %e, "Failed to poll job"),
            }
        }
    }

    #[instrument(skip(self, job, now), fields(job_id = %abbrev_uuid(&job.id), attempt = job.poll_attempts + 1))]
    async fn poll_job(&self, job: Job, now: DateTime<Utc>) -> Result<PollOutcome> {
        let submitted_at = job.submitted_at.unwrap_or(job.updated_at);
        if now >= time_after(submitted_at, self.config.deadline) {
            let detail = format!(
                "no terminal status within {}",
                humantime::format_duration(self.config.deadline)
            );
            warn!("Job passed its deadline");
            let failed = self
                .tracker
                .fail(job.id, JobState::Submitted, FailureReason::Timeout, Some(detail))
                .await?;
            return Ok(if failed.is_some() {
                PollOutcome::TimedOut
            } else {
                PollOutcome::Superseded
            });
        }

        let Some(correlation_id) = job.external_correlation_id.as_deref() else {
            warn!("Submitted job has no correlation id");
            return Ok(PollOutcome::Superseded);
        };

        match self.fetch_status(correlation_id).await {
            Ok(ProviderStatus::Pending) => {
                let attempts = job.poll_attempts + 1;
                let update = PollUpdate {
                    poll_attempts: attempts,
                    status_errors: 0,
                    next_poll_at: self.next_poll_at(now, attempts),
                };
                Ok(self.reschedule(&job, update).await?.unwrap_or(PollOutcome::StillRunning))
            }
            Ok(status) => match self.tracker.complete(&job, &status).await? {
                CompletionOutcome::Applied(_) => Ok(PollOutcome::Completed),
                CompletionOutcome::Late(current) => {
                    debug!(state = %current.state, "Completion already recorded by another path");
                    Ok(PollOutcome::Superseded)
                }
                CompletionOutcome::NotSubmitted(_) | CompletionOutcome::StillRunning => Ok(PollOutcome::Superseded),
            },
            Err(e) => {
                let errors = job.status_errors + 1;
                if errors as u32 >= self.config.max_status_errors {
                    warn!(error = %e, errors, "Giving up on job after repeated status errors");
                    let failed = self
                        .tracker
                        .fail(job.id, JobState::Submitted, FailureReason::ProviderError, Some(e.to_string()))
                        .await?;
                    return Ok(if failed.is_some() {
                        PollOutcome::GaveUp
                    } else {
                        PollOutcome::Superseded
                    });
                }

                warn!(error = %e, errors, "Status fetch failed");
                let attempts = job.poll_attempts + 1;
                let update = PollUpdate {
                    poll_attempts: attempts,
                    status_errors: errors,
                    next_poll_at: self.next_poll_at(now, attempts),
                };
                Ok(self.reschedule(&job, update).await?.unwrap_or(PollOutcome::StatusError))
            }
        }
    }

    async fn fetch_status(&self, correlation_id: &str) -> std::result::Result<ProviderStatus, ProviderError> {
        with_retry(&self.retry, "provider_fetch_status", || async {
            timeout(self.config.submit_timeout, self.provider.fetch_status(correlation_id))
                .await
                .map_err(|_| ProviderError::Timeout)?
        })
        .await
    }

    /// `Some(Superseded)` if the job left SUBMITTED, `None` once rescheduled.
    async fn reschedule(&self, job: &Job, update: PollUpdate) -> Result<Option<PollOutcome>> {
        let updated = with_retry(&self.retry, "record_poll", || self.store.record_poll(job.id, &update)).await?;
        Ok(updated.is_none().then_some(PollOutcome::Superseded))
    }

    fn next_poll_at(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        let delay = exponential_backoff(
            self.config.poll_interval,
            self.config.poll_backoff_factor,
            attempts.max(0) as u32,
            self.config.max_poll_interval,
        );
        time_after(now, delay)
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>, summary: &mut PollSummary) {
        let older_than = time_before(now, self.config.stale_submission_after);
        let stale = match self.store.stale_unsubmitted(older_than, self.config.poll_batch_size).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Failed to load stale unsubmitted jobs");
                return;
            }
        };

        for job in stale {
            let detail = Some("submission did not complete".to_string());
            match self.tracker.fail(job.id, job.state, FailureReason::ProviderError, detail).await {
                Ok(Some(_)) => {
                    warn!(job_id = %job.id, state = %job.state, "Failed orphaned job");
                    summary.orphans_failed += 1;
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to fail orphaned job"),
            }
        }
    }

    async fn sweep_refunds(&self, summary: &mut PollSummary) {
        let missing = match self.store.jobs_missing_refund(self.config.poll_batch_size).await {
            Ok(missing) => missing,
            Err(e) => {
                error!(error = %e, "Failed to load jobs missing a refund");
                return;
            }
        };

        for job in missing {
            match self.tracker.refund_if_debited(&job).await {
                Ok(Some(_)) => {
                    info!(job_id = %job.id, "Issued missing refund");
                    summary.refunds_issued += 1;
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to issue missing refund"),
            }
        }
    }

    async fn sweep_orders(&self, summary: &mut PollSummary) {
        let Some(payments) = &self.payments else {
            return;
        };
        match payments.sweep_abandoned().await {
            Ok(abandoned) => summary.orders_abandoned = abandoned,
            Err(e) => error!(error = %e, "Failed to abandon stale orders"),
        }
    }

    async fn sweep_events(&self, now: DateTime<Utc>, summary: &mut PollSummary) {
        let older_than = time_before(now, self.config.webhook_event_retention);
        match self.store.prune_webhook_events(older_than).await {
            Ok(pruned) => summary.webhook_events_pruned = pruned,
            Err(e) => error!(error = %e, "Failed to prune webhook events"),
        }
    }
}
