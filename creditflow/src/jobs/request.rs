//! Validation of submitted job payloads.

use serde_json::{Map, Value, json};
use url::Url;
use uuid::Uuid;

use super::types::JobKind;
use super::{JobError, Result};
use crate::types::JobId;

/// A payload that passed validation for its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    /// `{zipUrl, name}`: an archive of training images and the trigger word to train on
    Train { zip_url: Url, name: String },
    /// `{prompt, loraUrl?, modelJobId?}` (`tensorPath` is accepted as an alias of `loraUrl`).
    ///
    /// `modelJobId` names a TRAIN job whose weights replace `loraUrl` at submission.
    Generate {
        prompt: String,
        lora_url: Option<Url>,
        model_job_id: Option<JobId>,
    },
}

fn field<'a>(payload: &'a Map<String, Value>, names: &[&str]) -> Result<Option<&'a str>> {
    for name in names {
        match payload.get(*name) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.trim())),
            Some(_) => return Err(JobError::Validation(format!("`{name}` must be a string"))),
        }
    }
    Ok(None)
}

pub(crate) fn http_url(value: &str, name: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| JobError::Validation(format!("`{name}` is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(JobError::Validation(format!("`{name}` must be an http(s) URL, got {scheme}"))),
    }
}

impl JobRequest {
    pub fn parse(kind: JobKind, payload: &Value) -> Result<Self> {
        let Value::Object(payload) = payload else {
            return Err(JobError::Validation("payload must be a JSON object".to_string()));
        };

        match kind {
            JobKind::Train => {
                let zip_url = field(payload, &["zipUrl"])?
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| JobError::Validation("`zipUrl` is required for TRAIN jobs".to_string()))?;
                let name = field(payload, &["name"])?
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| JobError::Validation("`name` is required for TRAIN jobs".to_string()))?;
                Ok(JobRequest::Train {
                    zip_url: http_url(zip_url, "zipUrl")?,
                    name: name.to_string(),
                })
            }
            JobKind::Generate => {
                let prompt = field(payload, &["prompt"])?
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| JobError::Validation("`prompt` is required for GENERATE jobs".to_string()))?;
                let lora_url = field(payload, &["loraUrl", "tensorPath"])?
                    .filter(|s| !s.is_empty())
                    .map(|u| http_url(u, "loraUrl"))
                    .transpose()?;
                let model_job_id = field(payload, &["modelJobId", "modelId"])?
                    .filter(|s| !s.is_empty())
                    .map(|id| {
                        Uuid::parse_str(id).map_err(|_| JobError::Validation(format!("`modelJobId` is not a job id: {id}")))
                    })
                    .transpose()?;
                Ok(JobRequest::Generate {
                    prompt: prompt.to_string(),
                    lora_url,
                    model_job_id,
                })
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Train { .. } => JobKind::Train,
            JobRequest::Generate { .. } => JobKind::Generate,
        }
    }

    /// Normalised payload stored on the job.
    pub fn to_payload(&self) -> Value {
        match self {
            JobRequest::Train { zip_url, name } => json!({"zipUrl": zip_url.as_str(), "name": name}),
            JobRequest::Generate {
                prompt,
                lora_url,
                model_job_id,
            } => {
                let mut payload = json!({"prompt": prompt});
                if let Some(url) = lora_url {
                    payload["loraUrl"] = json!(url.as_str());
                }
                if let Some(id) = model_job_id {
                    payload["modelJobId"] = json!(id);
                }
                payload
            }
        }
    }

    /// Input sent to the provider.
    pub fn provider_input(&self) -> Value {
        match self {
            JobRequest::Train { zip_url, name } => json!({
                "training_data": zip_url.as_str(),
                "trigger_word": name,
            }),
            JobRequest::Generate { prompt, lora_url, .. } => {
                let mut input = json!({"prompt": prompt, "num_outputs": 1});
                if let Some(url) = lora_url {
                    input["lora_url"] = json!(url.as_str());
                    input["lora_scale"] = json!(1);
                }
                input
            }
        }
    }
}
