use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::jobs::types::{FailureReason, Job, JobKind, JobState};
use crate::types::JobId;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// `TRAIN` or `GENERATE` (case-insensitive)
    pub kind: String,
    /// `{zipUrl, name}` for TRAIN, `{prompt, loraUrl?, modelJobId?}` for GENERATE
    #[serde(default)]
    pub payload: Value,
    /// Expected cost in credits; rejected if it differs from the server's price
    pub cost: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
    pub state: JobState,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPackRequest {
    /// Idempotency key; resubmitting a pack with the same key returns its jobs. Generated when absent.
    #[schema(value_type = Option<String>, format = "uuid")]
    pub pack_id: Option<Uuid>,
    /// One GENERATE job is created per prompt
    pub prompts: Vec<String>,
    /// A succeeded TRAIN job whose weights every prompt uses
    #[schema(value_type = Option<String>, format = "uuid")]
    pub model_job_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackResponse {
    #[schema(value_type = String, format = "uuid")]
    pub pack_id: Uuid,
    pub jobs: Vec<JobResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub cost_in_credits: i64,
    pub payload: Value,
    pub external_correlation_id: Option<String>,
    pub result_ref: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            state: job.state,
            cost_in_credits: job.cost_in_credits,
            payload: job.payload,
            external_correlation_id: job.external_correlation_id,
            result_ref: job.result_ref,
            failure_reason: job.failure_reason,
            failure_detail: job.failure_detail,
            retry_of: job.retry_of,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
