//! Job records and their lifecycle states.

use crate::types::{JobId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Fine-tune a model on a user-supplied image archive
    Train,
    /// Generate an image from a prompt, optionally with trained weights
    Generate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Train => "TRAIN",
            JobKind::Generate => "GENERATE",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRAIN" => Ok(JobKind::Train),
            "GENERATE" => Ok(JobKind::Generate),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Lifecycle state. Transitions only move forward, see [`crate::jobs::transitions`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Debited,
    Submitted,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Debited => "DEBITED",
            JobState::Submitted => "SUBMITTED",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InsufficientCredits,
    /// Submission or status fetch failed after retries
    ProviderError,
    /// The provider reported the job as failed or canceled
    ProviderFailed,
    Timeout,
    Canceled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InsufficientCredits => "INSUFFICIENT_CREDITS",
            FailureReason::ProviderError => "PROVIDER_ERROR",
            FailureReason::ProviderFailed => "PROVIDER_FAILED",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    /// Validated input forwarded to the provider
    pub payload: serde_json::Value,
    pub external_correlation_id: Option<String>,
    pub state: JobState,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub cost_in_credits: i64,
    pub result_ref: Option<String>,
    pub retry_of: Option<JobId>,
    pub poll_attempts: i32,
    pub status_errors: i32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub cost_in_credits: i64,
    pub retry_of: Option<JobId>,
}

/// Target state plus the fields that change with it. Applied by a compare-and-set on the
/// current state, see [`crate::db::JobStore::transition_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub to: JobState,
    pub external_correlation_id: Option<String>,
    pub result_ref: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Replaces the stored poll schedule; `None` clears it
    pub next_poll_at: Option<DateTime<Utc>>,
}

/// Poll bookkeeping written while a job stays SUBMITTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollUpdate {
    pub poll_attempts: i32,
    pub status_errors: i32,
    pub next_poll_at: DateTime<Utc>,
}
