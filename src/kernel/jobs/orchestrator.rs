//! Orchestrator — creates generation jobs, idempotently.
//!
//! Mirrors `orchestrator.py::Orchestrator.create_job`: look the job up by
//! its natural key first for a cheap idempotent short-circuit, then fall
//! back to the store's `(user_id, option_id, idempotency_key)` unique index
//! to win races against a concurrent identical request.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use super::metrics::MetricsSink;
use super::model::{GenerationJob, JobStatus, ToolType};
use super::store::{InsertOutcome, JobStore};
use crate::kernel::clock::Clock;

#[derive(Debug, thiserror::Error)]
pub enum CreateJobError {
    #[error("option {0} not found")]
    OptionNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Per-tool-type timeout budget, in seconds. `speak` rides on the
/// text-to-image timeout (short, no video render step); an unrecognized
/// tool type falls back to the text-to-video timeout, matching
/// `_get_timeout_seconds`'s dict-with-default.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub t2i_timeout_s: i64,
    pub t2v_timeout_s: i64,
    pub i2v_timeout_s: i64,
}

impl TimeoutConfig {
    pub fn for_tool_type(&self, tool_type: ToolType) -> Duration {
        let seconds = match tool_type {
            ToolType::TextToImage => self.t2i_timeout_s,
            ToolType::TextToVideo => self.t2v_timeout_s,
            ToolType::ImageToVideo => self.i2v_timeout_s,
            ToolType::Speak => self.t2i_timeout_s,
        };
        Duration::seconds(seconds)
    }
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    timeouts: TimeoutConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            clock,
            timeouts,
        }
    }

    /// Create a job for `(user_id, option_id)` under `idempotency_key`,
    /// returning the winning job id whether this call created it or a
    /// concurrent/earlier call did.
    pub async fn create_job(
        &self,
        user_id: &str,
        option_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Uuid, CreateJobError> {
        let option = self
            .store
            .get_option(option_id)
            .await?
            .ok_or(CreateJobError::OptionNotFound(option_id))?;

        let now = self.clock.now();
        let timeout_at = now + self.timeouts.for_tool_type(option.tool_type);

        let job = GenerationJob::builder()
            .id(Uuid::new_v4())
            .user_id(user_id.to_string())
            .option_id(option_id)
            .idempotency_key(idempotency_key.to_string())
            .status(JobStatus::Pending)
            .next_poll_at(now)
            .timeout_at(timeout_at)
            .trace_id(Uuid::new_v4())
            .created_at(now)
            .updated_at(now)
            .build();

        let (outcome, row) = self.store.insert_job_if_absent(job).await?;

        match outcome {
            InsertOutcome::AlreadyExists => {
                info!(job_id = %row.id, option_id = %option_id, idempotency_key, "job already exists");
            }
            InsertOutcome::Inserted => {
                self.metrics
                    .inc_jobs_created(tool_type_label(option.tool_type), &option.model_key);
                info!(
                    job_id = %row.id,
                    option_id = %option_id,
                    user_id,
                    tool_type = tool_type_label(option.tool_type),
                    model_key = %option.model_key,
                    timeout_at = %timeout_at,
                    "job created"
                );
            }
        }

        Ok(row.id)
    }
}

fn tool_type_label(tool_type: ToolType) -> &'static str {
    match tool_type {
        ToolType::TextToImage => "text_to_image",
        ToolType::TextToVideo => "text_to_video",
        ToolType::ImageToVideo => "image_to_video",
        ToolType::Speak => "speak",
    }
}
