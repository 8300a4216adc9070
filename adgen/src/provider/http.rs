//! Reference adapter for vendors exposing a simple JSON-over-HTTP generation API.
//!
//! `POST {endpoint}/{task}` with `{"task", "operation", "input"}`. A `200` body is the result
//! (its `output` field if present). A `202` body carrying an `id` starts an asynchronous job,
//! which is polled at `GET {endpoint}/{task}/{id}` until it reports `completed` or `failed`.
//! The whole exchange, polling included, is bounded by `timeout`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{GenerationOutput, GenerationRequest, Provider, ProviderError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpProviderConfig {
    /// Base URL, e.g. `https://api.vendor.example/v1`
    pub endpoint: String,
    /// Sent as `Authorization: Bearer` when set
    pub api_key: Option<String>,
    /// Upper bound for one `generate` call, including polling
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct HttpProvider {
    name: String,
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, config: HttpProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    pub fn config(&self) -> &HttpProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    async fn call(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let url = self.url(request.task.as_str());
        tracing::debug!(provider = %self.name, url = %url, "Submitting generation request");

        let body = json!({
            "task": request.task,
            "operation": request.operation,
            "input": request.input,
        });
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = read_body(response).await?;
        check_status(status, &body)?;

        if status == StatusCode::ACCEPTED {
            if let Some(id) = body.get("id").and_then(json_id) {
                return self.poll(request, &id).await;
            }
        }

        Ok(extract_output(body))
    }

    async fn poll(&self, request: &GenerationRequest, vendor_job_id: &str) -> Result<GenerationOutput, ProviderError> {
        let url = self.url(&format!("{}/{}", request.task.as_str(), vendor_job_id));
        tracing::debug!(provider = %self.name, url = %url, "Vendor accepted job, polling for result");

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();
            let body = read_body(response).await?;
            check_status(status, &body)?;

            match body.get("status").and_then(Value::as_str) {
                Some("completed") => return Ok(extract_output(body)),
                Some("failed") => {
                    let message = body
                        .get("error")
                        .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                        .unwrap_or_else(|| "vendor reported failure".to_string());
                    return Err(ProviderError::InvalidInput(message));
                }
                other => {
                    tracing::trace!(provider = %self.name, status = ?other, "Vendor job still running");
                }
            }
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, request), fields(provider = %self.name, job_id = %request.job_id, task = %request.task))]
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        match tokio::time::timeout(self.config.timeout, self.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "no result from {} within {:?}",
                self.name, self.config.timeout
            ))),
        }
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::UpstreamUnavailable(e.to_string())
    }
}

async fn read_body(response: reqwest::Response) -> Result<Value, ProviderError> {
    let text = response.text().await.map_err(transport_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    // Error pages are often not JSON; keep them as a string so the message survives
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Map a non-success status to the matching error class.
fn check_status(status: StatusCode, body: &Value) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }

    let message = match body {
        Value::Null => status.to_string(),
        Value::String(s) => format!("{status}: {s}"),
        other => format!("{status}: {other}"),
    };

    Err(match status.as_u16() {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::RateLimited(message),
        400 | 404 | 422 => ProviderError::InvalidInput(message),
        408 | 504 => ProviderError::Timeout(message),
        s if s >= 500 => ProviderError::UpstreamUnavailable(message),
        _ => ProviderError::InvalidInput(message),
    })
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_output(mut body: Value) -> GenerationOutput {
    if let Some(output) = body.get_mut("output") {
        return output.take();
    }
    body
}
