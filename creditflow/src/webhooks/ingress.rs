//! Completion webhook ingress.
//!
//! Notifications never create jobs. A notification is matched to a job by its correlation id and
//! applied through [`JobTracker::complete`], racing the poller on the same compare-and-set.
//! Everything that is not an authentication failure or a storage outage is acknowledged: unknown
//! correlation ids, redeliveries and late signals are logged and dropped.

use axum::http::HeaderMap;
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use super::signing::{SignatureError, WEBHOOK_ID_HEADER, verify_standard_webhook};
use crate::db::Storage;
use crate::db::errors::DbError;
use crate::jobs::JobError;
use crate::jobs::tracker::{CompletionOutcome, JobTracker};
use crate::providers::ProviderStatus;

/// Accepted clock skew between the webhook timestamp and now.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Completion notification. Provider-native bodies (`id`, `output`) are accepted as aliases.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    #[serde(alias = "id")]
    pub external_correlation_id: String,
    /// `succeeded`, `failed`, `canceled`, or a non-terminal status such as `processing`
    pub status: String,
    #[serde(default, alias = "output")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    /// Sender's event id, used to recognise redeliveries
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The job reached its terminal state through this notification
    Applied,
    /// This event was already processed
    Duplicate,
    /// No job has this correlation id
    UnknownCorrelation,
    /// Non-terminal status; nothing to do
    InProgress,
    /// The job was already terminal
    Late,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::UnknownCorrelation => "unknown_correlation",
            WebhookOutcome::InProgress => "in_progress",
            WebhookOutcome::Late => "late",
        }
    }
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("Malformed webhook: {0}")]
    Malformed(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, WebhookError>;

#[derive(Clone)]
pub struct WebhookIngress {
    store: Arc<dyn Storage>,
    tracker: JobTracker,
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookIngress {
    /// Without a secret, notifications are accepted unsigned.
    pub fn new(store: Arc<dyn Storage>, tracker: JobTracker, secret: Option<String>) -> Self {
        Self {
            store,
            tracker,
            secret,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Authenticate and apply a raw webhook delivery.
    pub async fn receive(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookOutcome> {
        let payload = std::str::from_utf8(body).map_err(|_| WebhookError::Malformed("body is not UTF-8".to_string()))?;

        let delivery_id = match &self.secret {
            Some(secret) => match verify_standard_webhook(headers, payload, secret, self.tolerance, Utc::now()) {
                Ok(msg_id) => Some(msg_id),
                Err(e) => {
                    warn!(target: "security", error = %e, "Provider webhook rejected");
                    counter!("creditflow_webhooks_received_total", "outcome" => "rejected").increment(1);
                    return Err(e.into());
                }
            },
            None => headers
                .get(WEBHOOK_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };

        let notice: CompletionNotice =
            serde_json::from_str(payload).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        let outcome = self.apply(&notice, delivery_id.as_deref()).await?;
        counter!("creditflow_webhooks_received_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    /// Apply an authenticated notification.
    #[instrument(skip(self, notice), fields(correlation_id = %notice.external_correlation_id, status = %notice.status))]
    pub async fn apply(&self, notice: &CompletionNotice, delivery_id: Option<&str>) -> Result<WebhookOutcome> {
        let status = ProviderStatus::parse(&notice.status, notice.result.as_ref(), notice.error.as_ref())
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        let correlation_id = notice.external_correlation_id.as_str();
        let Some(job) = self.store.get_job_by_correlation(correlation_id).await? else {
            info!("Dropping notification for unknown correlation id");
            return Ok(WebhookOutcome::UnknownCorrelation);
        };
        if !status.is_terminal() {
            debug!(job_id = %job.id, "Job still running");
            return Ok(WebhookOutcome::InProgress);
        }

        let outcome = match self.tracker.complete(&job, &status).await {
            Ok(CompletionOutcome::Applied(job)) => {
                info!(job_id = %job.id, state = %job.state, "Completion applied from webhook");
                WebhookOutcome::Applied
            }
            Ok(CompletionOutcome::Late(current)) => {
                info!(job_id = %current.id, state = %current.state, "Ignoring completion for terminal job");
                WebhookOutcome::Late
            }
            Ok(CompletionOutcome::NotSubmitted(current)) => {
                warn!(job_id = %current.id, state = %current.state, "Completion for a job that is not submitted");
                WebhookOutcome::Late
            }
            Ok(CompletionOutcome::StillRunning) => WebhookOutcome::InProgress,
            Err(JobError::Database(e)) => return Err(e.into()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Dropping completion that could not be applied");
                WebhookOutcome::Late
            }
        };

        // Recorded after applying, so a delivery that failed part-way is reprocessed on redelivery.
        let event_id = notice.event_id.as_deref().or(delivery_id);
        if let Some(event_id) = event_id
            && !self.store.record_webhook_event(correlation_id, event_id).await?
            && outcome != WebhookOutcome::Applied
        {
            debug!(%event_id, "Redelivered event");
            return Ok(WebhookOutcome::Duplicate);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStore;
    use crate::db::in_memory::InMemoryStorage;
    use crate::db::models::credits::{EntryReason, job_debit_key};
    use crate::jobs::types::{FailureReason, Job, JobKind, JobState, JobTransition, NewJob};
    use crate::ledger::CreditLedger;
    use crate::retry::RetryPolicy;
    use crate::webhooks::signing::{
        WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER, generate_secret, sign_payload,
    };
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryStorage>,
        ledger: CreditLedger,
        tracker: JobTracker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStorage::new());
        let ledger = CreditLedger::new(store.clone(), RetryPolicy::none());
        let tracker = JobTracker::new(store.clone(), ledger.clone(), RetryPolicy::none());
        Fixture { store, ledger, tracker }
    }

    fn ingress(f: &Fixture, secret: Option<String>) -> WebhookIngress {
        WebhookIngress::new(f.store.clone(), f.tracker.clone(), secret)
    }

    async fn submitted_job(f: &Fixture, correlation_id: &str) -> Job {
        f.ledger.open_account("erin", 10).await.unwrap();
        let job = f
            .store
            .insert_job(&NewJob {
                id: Uuid::new_v4(),
                user_id: "erin".to_string(),
                kind: JobKind::Train,
                payload: json!({}),
                cost_in_credits: 4,
                retry_of: None,
            })
            .await
            .unwrap();
        f.ledger.debit("erin", 4, &job_debit_key(job.id)).await.unwrap();
        f.tracker
            .transition(job.id, JobState::Created, &JobTransition::debited())
            .await
            .unwrap();
        let now = Utc::now();
        f.tracker
            .transition(job.id, JobState::Debited, &JobTransition::submitted(correlation_id, now, now))
            .await
            .unwrap()
            .unwrap()
    }

    fn body(correlation_id: &str, status: &str, event_id: Option<&str>) -> String {
        json!({
            "externalCorrelationId": correlation_id,
            "status": status,
            "result": "https://cdn.example.com/weights.tar",
            "eventId": event_id,
        })
        .to_string()
    }

    async fn refunds(f: &Fixture) -> usize {
        f.ledger
            .entries("erin", 0, 100)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.reason == EntryReason::JobRefund)
            .count()
    }

    #[tokio::test]
    async fn test_success_is_applied_once() {
        let f = fixture();
        let job = submitted_job(&f, "pred-1").await;
        let ingress = ingress(&f, None);
        let delivery = body("pred-1", "succeeded", Some("evt-1"));

        let first = ingress.receive(&HeaderMap::new(), delivery.as_bytes()).await.unwrap();
        assert_eq!(first, WebhookOutcome::Applied);
        let second = ingress.receive(&HeaderMap::new(), delivery.as_bytes()).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate);

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert_eq!(stored.result_ref.as_deref(), Some("https://cdn.example.com/weights.tar"));
    }

    #[tokio::test]
    async fn test_replicate_prediction_body() {
        let f = fixture();
        let job = submitted_job(&f, "pred-r").await;
        let delivery = json!({
            "id": "pred-r",
            "status": "succeeded",
            "output": ["https://replicate.delivery/a.png", "https://replicate.delivery/b.png"],
            "error": null,
        })
        .to_string();

        let outcome = ingress(&f, None).receive(&HeaderMap::new(), delivery.as_bytes()).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);
        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.result_ref.as_deref(), Some("https://replicate.delivery/a.png"));
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_acknowledged() {
        let f = fixture();
        let outcome = ingress(&f, None)
            .receive(&HeaderMap::new(), body("nobody", "succeeded", None).as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownCorrelation);
        assert!(f.store.list_user_jobs("erin", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_terminal_status_is_ignored() {
        let f = fixture();
        let job = submitted_job(&f, "pred-2").await;
        let outcome = ingress(&f, None)
            .receive(&HeaderMap::new(), body("pred-2", "processing", None).as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::InProgress);
        assert_eq!(f.store.get_job(job.id).await.unwrap().unwrap().state, JobState::Submitted);
    }

    #[tokio::test]
    async fn test_failure_after_success_is_late() {
        let f = fixture();
        let job = submitted_job(&f, "pred-3").await;
        let ingress = ingress(&f, None);

        ingress
            .receive(&HeaderMap::new(), body("pred-3", "succeeded", Some("a")).as_bytes())
            .await
            .unwrap();
        let late = ingress
            .receive(&HeaderMap::new(), body("pred-3", "failed", Some("b")).as_bytes())
            .await
            .unwrap();
        assert_eq!(late, WebhookOutcome::Late);
        assert_eq!(f.store.get_job(job.id).await.unwrap().unwrap().state, JobState::Succeeded);
        assert_eq!(refunds(&f).await, 0);
    }

    #[tokio::test]
    async fn test_webhook_and_poll_race_leaves_one_outcome() {
        let f = fixture();
        let job = submitted_job(&f, "pred-4").await;
        let ingress = ingress(&f, None);
        let delivery = body("pred-4", "succeeded", None);
        let headers = HeaderMap::new();

        let (webhook, timeout) = tokio::join!(
            ingress.receive(&headers, delivery.as_bytes()),
            f.tracker.fail(job.id, JobState::Submitted, FailureReason::Timeout, None),
        );
        let webhook = webhook.unwrap();
        let timed_out = timeout.unwrap().is_some();
        assert!((webhook == WebhookOutcome::Applied) ^ timed_out);

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        let expected_refunds = usize::from(stored.state == JobState::Failed);
        assert_eq!(refunds(&f).await, expected_refunds);
    }

    #[tokio::test]
    async fn test_signed_webhooks() {
        let f = fixture();
        let job = submitted_job(&f, "pred-5").await;
        let secret = generate_secret();
        let ingress = ingress(&f, Some(secret.clone()));
        let delivery = body("pred-5", "failed", None);

        let unsigned = ingress.receive(&HeaderMap::new(), delivery.as_bytes()).await.unwrap_err();
        assert!(matches!(
            unsigned,
            WebhookError::Signature(SignatureError::MissingHeader(_))
        ));

        let timestamp = Utc::now().timestamp();
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_ID_HEADER, "msg_1".parse().unwrap());
        headers.insert(WEBHOOK_TIMESTAMP_HEADER, timestamp.to_string().parse().unwrap());
        let wrong = sign_payload("msg_1", timestamp, &delivery, &generate_secret()).unwrap();
        headers.insert(WEBHOOK_SIGNATURE_HEADER, wrong.parse().unwrap());
        assert!(matches!(
            ingress.receive(&headers, delivery.as_bytes()).await,
            Err(WebhookError::Signature(SignatureError::Mismatch))
        ));
        assert_eq!(f.store.get_job(job.id).await.unwrap().unwrap().state, JobState::Submitted);

        let signature = sign_payload("msg_1", timestamp, &delivery, &secret).unwrap();
        headers.insert(WEBHOOK_SIGNATURE_HEADER, signature.parse().unwrap());
        assert_eq!(ingress.receive(&headers, delivery.as_bytes()).await.unwrap(), WebhookOutcome::Applied);
        // Same webhook-id redelivered
        assert_eq!(ingress.receive(&headers, delivery.as_bytes()).await.unwrap(), WebhookOutcome::Duplicate);

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_reason, Some(FailureReason::ProviderFailed));
        assert_eq!(refunds(&f).await, 1);
        assert_eq!(f.ledger.balance("erin").await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_malformed_bodies() {
        let f = fixture();
        let ingress = ingress(&f, None);
        assert!(matches!(
            ingress.receive(&HeaderMap::new(), b"{").await,
            Err(WebhookError::Malformed(_))
        ));
        assert!(matches!(
            ingress
                .receive(&HeaderMap::new(), body("x", "exploded", None).as_bytes())
                .await,
            Err(WebhookError::Malformed(_))
        ));
    }
}
