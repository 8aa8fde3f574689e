//! `POST /options/{id}/generate` and `GET /jobs/{id}` — the two handlers
//! that front the Orchestrator and Job Store. Response shapes follow
//! `JobCreateResponse`/`JobOut`/`JobResult`/`ErrorOut` in the pre-distillation
//! `app/domain/schemas.py`, as referenced by `jobs.py`'s handlers.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::kernel::jobs::model::JobStatus;
use crate::kernel::jobs::orchestrator::CreateJobError;

use super::super::app::AppState;

pub(crate) const USER_ID_HEADER: &str = "x-user-id";
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(code: &str, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        let status = match code {
            "MISSING_IDEMPOTENCY_KEY" | "MISSING_USER_ID" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ApiError {
                code: code.to_string(),
                message: message.into(),
            }),
        )
    }
}

pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<String, (StatusCode, Json<ApiError>)> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::new("MISSING_USER_ID", "X-User-Id header is required"))
}

#[derive(Debug, Serialize)]
pub struct JobCreateResponse {
    pub job_id: Uuid,
}

pub async fn generate_option(
    Extension(state): Extension<AppState>,
    Path(option_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<JobCreateResponse>), (StatusCode, Json<ApiError>)> {
    let user_id = user_id_from_headers(&headers)?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ApiError::new(
                "MISSING_IDEMPOTENCY_KEY",
                "Idempotency-Key header is required",
            )
        })?;

    let job_id = state
        .deps
        .orchestrator
        .create_job(&user_id, option_id, &idempotency_key)
        .await
        .map_err(|e| match e {
            CreateJobError::OptionNotFound(id) => {
                ApiError::new("NOT_FOUND", format!("option {id} not found"))
            }
            CreateJobError::Store(err) => ApiError::new("INTERNAL_ERROR", err.to_string()),
        })?;

    Ok((StatusCode::ACCEPTED, Json(JobCreateResponse { job_id })))
}

#[derive(Debug, Serialize)]
pub struct JobResult {
    pub min_url: Option<String>,
    pub raw_url: Option<String>,
    pub mime: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobOut {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOut>,
    pub retry_after_seconds: i64,
}

pub async fn get_job(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<JobOut>, (StatusCode, Json<ApiError>)> {
    let user_id = user_id_from_headers(&headers)?;

    let job = state
        .deps
        .store
        .get_job(job_id)
        .await
        .map_err(|e| ApiError::new("INTERNAL_ERROR", e.to_string()))?
        .filter(|j| j.user_id == user_id)
        .ok_or_else(|| ApiError::new("NOT_FOUND", "job not found"))?;

    let now = state.deps.clock.now();
    let retry_after_seconds = if job.status.is_terminal() {
        10
    } else {
        let delta_ms = (job.next_poll_at - now).num_milliseconds();
        let ceil_secs = if delta_ms <= 0 { 0 } else { (delta_ms + 999) / 1000 };
        ceil_secs.clamp(1, 10)
    };

    let result = if job.status == JobStatus::Succeeded {
        job.output_urls_typed().map(|urls| JobResult {
            min_url: urls.min_url,
            raw_url: urls.raw_url,
            mime: if urls.kind == "image" {
                "image/jpeg".to_string()
            } else {
                "video/mp4".to_string()
            },
        })
    } else {
        None
    };

    let error = if matches!(job.status, JobStatus::Failed | JobStatus::Timeout) {
        Some(ErrorOut {
            code: job.last_error_code.clone().unwrap_or_else(|| "UNKNOWN".to_string()),
            message: job
                .last_error_message
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
        })
    } else {
        None
    };

    Ok(Json(JobOut {
        job_id: job.id,
        status: job.status,
        result,
        error,
        retry_after_seconds,
    }))
}
