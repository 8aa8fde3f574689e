//! GenerationJob and the entities it depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A candidate generation spec surfaced to the user for selection.
///
/// Produced elsewhere (the LLM recommender); immutable once created, the
/// core only ever reads it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OptionRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub rank: i32,
    pub tool_type: ToolType,
    pub model_key: String,
    pub parameters: serde_json::Value,
    pub enhanced_prompt: String,
    pub requires_attachment: bool,
    pub style_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tool_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    TextToImage,
    TextToVideo,
    ImageToVideo,
    Speak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses never leave themselves; `next_poll_at` stops mattering once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout | JobStatus::Canceled
        )
    }
}

/// Output produced by a successful generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputUrls {
    #[serde(rename = "type")]
    pub kind: String,
    pub min_url: Option<String>,
    pub raw_url: Option<String>,
}

/// The durable record of a single generation attempt.
///
/// Once `status` is terminal, no field but read-only auxiliaries changes again.
#[derive(Debug, Clone, sqlx::FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct GenerationJob {
    pub id: Uuid,
    pub user_id: String,
    pub option_id: Uuid,
    pub idempotency_key: String,

    pub status: JobStatus,

    #[builder(default)]
    pub provider_job_set_id: Option<String>,

    #[builder(default)]
    pub attempts: i32,
    #[builder(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,

    #[builder(default)]
    pub progress: Option<i32>,
    #[builder(default)]
    pub output_urls: Option<serde_json::Value>,
    #[builder(default)]
    pub last_error_code: Option<String>,
    #[builder(default)]
    pub last_error_message: Option<String>,

    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub finished_at: Option<DateTime<Utc>>,

    pub trace_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn output_urls_typed(&self) -> Option<OutputUrls> {
        self.output_urls
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
