//! Dummy provider for local development.
//!
//! Jobs are accepted immediately and report success on the first status poll, with the configured
//! result URL. No webhooks are sent, so completion always comes through the poller.

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobProvider, JobSubmission, ProviderError, ProviderStatus, Result};
use crate::config::DummyProviderConfig;

pub struct DummyProvider {
    result_url: String,
    fail_submissions: bool,
}

impl From<DummyProviderConfig> for DummyProvider {
    fn from(config: DummyProviderConfig) -> Self {
        Self {
            result_url: config.result_url,
            fail_submissions: config.fail_submissions,
        }
    }
}

#[async_trait]
impl JobProvider for DummyProvider {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn submit(&self, submission: &JobSubmission) -> Result<String> {
        if self.fail_submissions {
            return Err(ProviderError::Rejected("dummy provider is configured to reject submissions".to_string()));
        }
        let correlation_id = format!("dummy_{}", Uuid::new_v4().simple());
        tracing::info!(job_id = %submission.job_id, %correlation_id, "Dummy provider accepted job");
        Ok(correlation_id)
    }

    async fn fetch_status(&self, correlation_id: &str) -> Result<ProviderStatus> {
        if !correlation_id.starts_with("dummy_") {
            return Err(ProviderError::UnknownCorrelation(correlation_id.to_string()));
        }
        Ok(ProviderStatus::Succeeded {
            result_ref: Some(self.result_url.replace("{correlation_id}", correlation_id)),
        })
    }

    async fn cancel(&self, _correlation_id: &str) -> Result<()> {
        Ok(())
    }
}
