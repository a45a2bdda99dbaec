//! Job execution provider abstraction.
//!
//! A provider accepts a job, hands back a correlation id, and later reports the job's status
//! under that id, either by webhook or when polled. Implementations are selected by
//! configuration through [`create_provider`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::jobs::types::JobKind;
use crate::retry::Transient;
use crate::types::JobId;

pub mod dummy;
pub mod mock;
pub mod replicate;

/// Create a job provider from configuration
pub fn create_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn JobProvider>> {
    Ok(match config {
        ProviderConfig::Replicate(replicate_config) => Arc::new(replicate::ReplicateProvider::new(replicate_config.clone())?),
        ProviderConfig::Dummy(dummy_config) => Arc::new(dummy::DummyProvider::from(dummy_config.clone())),
    })
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Provider unreachable: {0}")]
    Transport(String),

    /// The provider refused the job; resubmitting unchanged will not help
    #[error("Provider rejected the job: {0}")]
    Rejected(String),

    #[error("Provider does not know correlation id {0}")]
    UnknownCorrelation(String),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ProviderError::Rejected(_) | ProviderError::UnknownCorrelation(_) | ProviderError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Work handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    pub job_id: JobId,
    pub kind: JobKind,
    /// Provider input built from the validated request payload
    pub input: Value,
}

/// Status of a job as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Succeeded { result_ref: Option<String> },
    Failed { error: Option<String> },
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderStatus::Pending)
    }

    /// Interpret a provider status string with its output and error fields.
    ///
    /// Succeeded jobs report the first output URL (or the string output) as their result.
    pub fn parse(status: &str, output: Option<&Value>, error: Option<&Value>) -> Result<Self> {
        match status.to_ascii_lowercase().as_str() {
            "starting" | "processing" | "queued" | "pending" => Ok(ProviderStatus::Pending),
            "succeeded" | "success" | "completed" => Ok(ProviderStatus::Succeeded {
                result_ref: output.and_then(extract_result_ref),
            }),
            "failed" | "canceled" | "cancelled" | "error" => Ok(ProviderStatus::Failed {
                error: error
                    .filter(|e| !e.is_null())
                    .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                    .or_else(|| Some(status.to_string())),
            }),
            other => Err(ProviderError::InvalidResponse(format!("unknown status '{other}'"))),
        }
    }
}

fn extract_result_ref(output: &Value) -> Option<String> {
    match output {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(extract_result_ref),
        Value::Object(fields) => ["url", "weights", "version"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(extract_result_ref)),
        _ => None,
    }
}

/// Abstract job provider interface
#[async_trait]
pub trait JobProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether completion is pushed to the provider webhook. Without it, polling starts right away.
    fn delivers_webhooks(&self) -> bool {
        false
    }

    /// Submit a job; returns the provider's correlation id.
    async fn submit(&self, submission: &JobSubmission) -> Result<String>;

    async fn fetch_status(&self, correlation_id: &str) -> Result<ProviderStatus>;

    /// Best-effort cancellation of a running job.
    async fn cancel(&self, correlation_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_status() {
        assert_eq!(ProviderStatus::parse("starting", None, None).unwrap(), ProviderStatus::Pending);
        assert_eq!(ProviderStatus::parse("processing", None, None).unwrap(), ProviderStatus::Pending);

        let output = json!(["https://cdn.example.com/a.png", "https://cdn.example.com/b.png"]);
        assert_eq!(
            ProviderStatus::parse("succeeded", Some(&output), None).unwrap(),
            ProviderStatus::Succeeded {
                result_ref: Some("https://cdn.example.com/a.png".to_string())
            }
        );

        let weights = json!({"version": "v1", "weights": "https://cdn.example.com/lora.safetensors"});
        assert_eq!(
            ProviderStatus::parse("succeeded", Some(&weights), None).unwrap(),
            ProviderStatus::Succeeded {
                result_ref: Some("https://cdn.example.com/lora.safetensors".to_string())
            }
        );

        assert_eq!(
            ProviderStatus::parse("failed", None, Some(&json!("CUDA out of memory"))).unwrap(),
            ProviderStatus::Failed {
                error: Some("CUDA out of memory".to_string())
            }
        );
        assert_eq!(
            ProviderStatus::parse("canceled", None, Some(&Value::Null)).unwrap(),
            ProviderStatus::Failed {
                error: Some("canceled".to_string())
            }
        );
        assert!(ProviderStatus::parse("exploded", None, None).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(
            ProviderError::Api {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(
            ProviderError::Api {
                status: 429,
                message: "slow down".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Api {
                status: 404,
                message: "nope".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::Rejected("bad input".into()).is_transient());
    }
}
