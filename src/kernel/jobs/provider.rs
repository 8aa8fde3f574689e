//! Provider Adapter — isolates the upstream generation provider's wire
//! surface from the poller's state machine; upstream idiosyncrasies never
//! leak past this module.
//!
//! HTTP-client shape follows `kernel/firecrawl_client.rs` (a `reqwest::Client`
//! wrapper, typed request/response structs, header-based auth, `post`/`get`
//! helpers). The exact status-mapping table, field-name fallbacks, and
//! error-code-per-HTTP-status assignment follow
//! `examples/original_source/backend/app/services/provider_higgsfield.py`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

/// The closed set of normalized job-set statuses the poller's state machine
/// matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// A single generation result, field-name drift already resolved.
#[derive(Debug, Clone)]
pub struct NormalizedResult {
    pub kind: String,
    pub min_url: Option<String>,
    pub raw_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NormalizedJobSet {
    pub status: NormalizedStatus,
    pub results: Vec<NormalizedResult>,
}

/// Typed equivalent of the pre-distillation source's `ProviderError(code,
/// retryable)` base class, made exhaustive-matchable rather than stringly
/// flagged. One variant per taxonomy entry in spec §4.2/§7.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("provider server error: {0}")]
    ProviderServerError(String),
    #[error("job set not found: {0}")]
    JobNotFound(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider error: {0}")]
    ProviderErrorOther(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RateLimited(_) => "RATE_LIMITED",
            ProviderError::InvalidParams(_) => "INVALID_PARAMS",
            ProviderError::ProviderServerError(_) => "PROVIDER_SERVER_ERROR",
            ProviderError::JobNotFound(_) => "JOB_NOT_FOUND",
            ProviderError::NetworkError(_) => "NETWORK_ERROR",
            ProviderError::InvalidResponse(_) => "INVALID_RESPONSE",
            ProviderError::ProviderErrorOther(_) => "PROVIDER_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::ProviderServerError(_)
                | ProviderError::NetworkError(_)
        )
    }
}

/// Normalized interface to the upstream generation provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn start_generation(
        &self,
        model_key: &str,
        params: &serde_json::Value,
        prompt: &str,
    ) -> Result<String, ProviderError>;

    async fn get_job_set(&self, provider_job_set_id: &str) -> Result<NormalizedJobSet, ProviderError>;
}

#[derive(Deserialize)]
struct StartGenerationResponse {
    job_set_id: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct JobSetResponse {
    status: Option<String>,
    #[serde(default)]
    results: Vec<RawResult>,
    #[serde(default)]
    outputs: Vec<RawResult>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(rename = "type")]
    kind: Option<String>,
    min_url: Option<String>,
    thumbnail_url: Option<String>,
    raw_url: Option<String>,
    url: Option<String>,
}

/// HTTP client for the upstream provider. A single instance (with connection
/// pooling) is injected once at process start per §5.
pub struct HttpProviderAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    secret: String,
}

impl HttpProviderAdapter {
    pub fn new(base_url: String, api_key: String, secret: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            secret,
        })
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("hf-api-key", self.api_key.clone()),
            ("hf-secret", self.secret.clone()),
        ]
    }

    /// Classify a non-2xx response from `StartGeneration` into its typed
    /// error, matching `provider_higgsfield.py::start_generation`.
    fn classify_start_error(status: StatusCode, body: &str) -> ProviderError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited("rate limited by provider".into()),
            StatusCode::BAD_REQUEST => ProviderError::InvalidParams(format!("invalid params: {body}")),
            s if s.is_server_error() => {
                ProviderError::ProviderServerError(format!("provider server error: {s}"))
            }
            s => ProviderError::ProviderErrorOther(format!("provider error: {s} - {body}")),
        }
    }

    /// Classify a non-2xx response from `GetJobSet`, matching
    /// `provider_higgsfield.py::get_job_set`.
    fn classify_get_error(status: StatusCode, body: &str) -> ProviderError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited("rate limited by provider".into()),
            s if s.is_server_error() => {
                ProviderError::ProviderServerError(format!("provider server error: {s}"))
            }
            StatusCode::NOT_FOUND => ProviderError::JobNotFound("job set not found".into()),
            s => ProviderError::ProviderErrorOther(format!("provider error: {s} - {body}")),
        }
    }

    fn normalize_status(raw: &str) -> NormalizedStatus {
        match raw.to_ascii_lowercase().as_str() {
            "queued" | "pending" => NormalizedStatus::Queued,
            "processing" | "running" | "in_progress" => NormalizedStatus::Processing,
            "completed" | "succeeded" | "success" => NormalizedStatus::Completed,
            "failed" | "error" => NormalizedStatus::Failed,
            // Any unknown label is treated as queued.
            _ => NormalizedStatus::Queued,
        }
    }

    fn normalize_job_set(raw: JobSetResponse) -> NormalizedJobSet {
        let status = Self::normalize_status(raw.status.as_deref().unwrap_or(""));

        let results = if matches!(status, NormalizedStatus::Completed) {
            let raw_results = if !raw.results.is_empty() {
                raw.results
            } else {
                raw.outputs
            };
            raw_results
                .into_iter()
                .map(|r| NormalizedResult {
                    kind: r.kind.unwrap_or_else(|| "image".to_string()),
                    min_url: r.min_url.or(r.thumbnail_url).or_else(|| r.url.clone()),
                    raw_url: r.raw_url.or(r.url),
                })
                .collect()
        } else {
            Vec::new()
        };

        NormalizedJobSet { status, results }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn start_generation(
        &self,
        model_key: &str,
        params: &serde_json::Value,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/models/{}/generate", self.base_url, model_key);

        let mut payload = params.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("prompt".to_string(), serde_json::Value::String(prompt.to_string()));
        }
        let body = serde_json::json!({ "params": payload });

        let mut request = self.client.post(&url).json(&body);
        for (name, value) in self.headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify_start_error(status, &text));
        }

        let parsed: StartGenerationResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .job_set_id
            .or(parsed.id)
            .ok_or_else(|| ProviderError::InvalidResponse("no job_set_id in response".into()))
    }

    async fn get_job_set(&self, provider_job_set_id: &str) -> Result<NormalizedJobSet, ProviderError> {
        let url = format!("{}/v1/job-sets/{}", self.base_url, provider_job_set_id);

        let mut request = self.client.get(&url);
        for (name, value) in self.headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify_get_error(status, &text));
        }

        let parsed: JobSetResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(Self::normalize_job_set(parsed))
    }
}
