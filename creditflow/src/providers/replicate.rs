//! Replicate predictions API client.
//!
//! - `POST /v1/predictions` with `version`, `input` and, when configured, a completion `webhook`
//! - `GET /v1/predictions/{id}` for polling
//! - `POST /v1/predictions/{id}/cancel`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use super::{JobProvider, JobSubmission, ProviderError, ProviderStatus, Result};
use crate::config::ReplicateConfig;
use crate::jobs::types::JobKind;

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub struct ReplicateProvider {
    client: reqwest::Client,
    config: ReplicateConfig,
}

impl ReplicateProvider {
    pub fn new(config: ReplicateConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.base_url.as_str().trim_end_matches('/'), path)
    }

    fn version_for(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Train => &self.config.train_version,
            JobKind::Generate => &self.config.generate_version,
        }
    }
}

/// Map a non-success response. Client errors other than 408/429 mean the request itself is bad.
async fn error_from(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Rejected(format!("{status}: {message}"))
    } else {
        ProviderError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl JobProvider for ReplicateProvider {
    fn name(&self) -> &'static str {
        "replicate"
    }

    fn delivers_webhooks(&self) -> bool {
        self.config.webhook_url.is_some()
    }

    #[tracing::instrument(skip(self, submission), fields(job_id = %submission.job_id, kind = %submission.kind))]
    async fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let mut body = json!({
            "version": self.version_for(submission.kind),
            "input": submission.input,
        });
        if let Some(webhook_url) = &self.config.webhook_url {
            body["webhook"] = json!(webhook_url.as_str());
            body["webhook_events_filter"] = json!(["completed"]);
        }

        let response = self
            .client
            .post(self.url("predictions"))
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let prediction: Prediction = response.json().await?;
        tracing::debug!(correlation_id = %prediction.id, status = %prediction.status, "Prediction created");
        Ok(prediction.id)
    }

    async fn fetch_status(&self, correlation_id: &str) -> Result<ProviderStatus> {
        let response = self
            .client
            .get(self.url(&format!("predictions/{correlation_id}")))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::UnknownCorrelation(correlation_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let prediction: Prediction = response.json().await?;
        ProviderStatus::parse(&prediction.status, prediction.output.as_ref(), prediction.error.as_ref())
    }

    async fn cancel(&self, correlation_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("predictions/{correlation_id}/cancel")))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, webhook_url: Option<&str>) -> ReplicateProvider {
        ReplicateProvider::new(ReplicateConfig {
            api_token: "r8_test".to_string(),
            base_url: server.uri().parse().unwrap(),
            train_version: "train-v1".to_string(),
            generate_version: "gen-v1".to_string(),
            webhook_url: webhook_url.map(|u| u.parse().unwrap()),
        })
        .unwrap()
    }

    fn submission(kind: JobKind) -> JobSubmission {
        JobSubmission {
            job_id: Uuid::new_v4(),
            kind,
            input: json!({"prompt": "a red fox"}),
        }
    }

    #[tokio::test]
    async fn test_submit_sends_version_input_and_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .and(header("authorization", "Bearer r8_test"))
            .and(body_partial_json(json!({
                "version": "gen-v1",
                "input": {"prompt": "a red fox"},
                "webhook": "https://hooks.example.com/webhooks/provider",
                "webhook_events_filter": ["completed"],
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "pred-123", "status": "starting"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server, Some("https://hooks.example.com/webhooks/provider"));
        let correlation_id = provider.submit(&submission(JobKind::Generate)).await.unwrap();
        assert_eq!(correlation_id, "pred-123");
    }

    #[tokio::test]
    async fn test_submit_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"version": "train-v1"})))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"detail": "training_data is required"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"version": "gen-v1"})))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider(&server, None);
        match provider.submit(&submission(JobKind::Train)).await {
            Err(ProviderError::Rejected(message)) => assert!(message.contains("training_data is required")),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(matches!(
            provider.submit(&submission(JobKind::Generate)).await,
            Err(ProviderError::Api { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/pred-ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pred-ok",
                "status": "succeeded",
                "output": ["https://replicate.delivery/out-0.png"],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/pred-running"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pred-running", "status": "processing"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/pred-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider(&server, None);
        assert_eq!(
            provider.fetch_status("pred-ok").await.unwrap(),
            ProviderStatus::Succeeded {
                result_ref: Some("https://replicate.delivery/out-0.png".to_string())
            }
        );
        assert_eq!(provider.fetch_status("pred-running").await.unwrap(), ProviderStatus::Pending);
        assert!(matches!(
            provider.fetch_status("pred-gone").await,
            Err(ProviderError::UnknownCorrelation(id)) if id == "pred-gone"
        ));
    }

    #[tokio::test]
    async fn test_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/pred-1/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pred-1", "status": "canceled"})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(provider(&server, None).cancel("pred-1").await.is_ok());
    }
}
