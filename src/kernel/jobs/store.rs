//! Job Store — the durable record of every generation attempt.
//!
//! Raw `sqlx::query_as!`-free hand-written queries, no ORM, whole-row
//! `UPDATE ... RETURNING *` on write — the shape of `kernel/jobs/job.rs`'s
//! `Record` impl. `claim_ready` mirrors `Job::claim_jobs()`'s
//! `FOR UPDATE SKIP LOCKED` claim-and-lease pattern: the same Postgres table
//! backing the job rows doubles as the delayed queue per SPEC §4.4, so no
//! second broker is introduced. The lease lives in its own `locked_until`
//! column rather than borrowing `next_poll_at` — bumping `next_poll_at`
//! itself would make the claimed row look "not yet due" to the state
//! machine's own due-check and the job would never be polled.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{GenerationJob, OptionRow};

/// Outcome of an idempotent insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job row, relying on the `(user_id, option_id,
    /// idempotency_key)` unique index for idempotency. Returns the winning
    /// row either way (the one just inserted, or the pre-existing one).
    async fn insert_job_if_absent(
        &self,
        job: GenerationJob,
    ) -> anyhow::Result<(InsertOutcome, GenerationJob)>;

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<GenerationJob>>;

    async fn get_option(&self, id: Uuid) -> anyhow::Result<Option<OptionRow>>;

    /// Whole-row update (`UPDATE ... RETURNING *`), mirroring
    /// `Record::update`. Callers mutate the in-memory `GenerationJob` and
    /// pass it back; `updated_at` is always stamped server-side.
    async fn update_job(&self, job: &GenerationJob) -> anyhow::Result<GenerationJob>;

    /// Count of jobs in `{PENDING, RUNNING}`, for the queue-depth gauge.
    async fn count_active(&self) -> anyhow::Result<i64>;

    /// Ids of non-terminal jobs whose `next_poll_at` fell before `before`
    /// without a transition landing — the stalled-job sweeper's input.
    async fn scan_stalled(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>>;

    /// Claim up to `limit` due jobs, leasing each by setting `locked_until`
    /// to `now + lease` so a concurrent worker can't also claim it
    /// mid-processing. `next_poll_at` is left untouched by the claim itself;
    /// `update_job` clears the lock once the transition's outcome is
    /// persisted, and any lock that outlives a crashed worker simply expires.
    async fn claim_ready(
        &self,
        limit: i64,
        lease: ChronoDuration,
    ) -> anyhow::Result<Vec<GenerationJob>>;
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = r#"
    id, user_id, option_id, idempotency_key, status, provider_job_set_id,
    attempts, last_polled_at, next_poll_at, timeout_at, progress, output_urls,
    last_error_code, last_error_message, started_at, finished_at, trace_id,
    created_at, updated_at
"#;

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job_if_absent(
        &self,
        job: GenerationJob,
    ) -> anyhow::Result<(InsertOutcome, GenerationJob)> {
        let query = format!(
            r#"
            INSERT INTO generation_jobs (
                id, user_id, option_id, idempotency_key, status, provider_job_set_id,
                attempts, last_polled_at, next_poll_at, timeout_at, progress, output_urls,
                last_error_code, last_error_message, started_at, finished_at, trace_id,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17,
                $18, $19
            )
            ON CONFLICT (user_id, option_id, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, GenerationJob>(&query)
            .bind(job.id)
            .bind(&job.user_id)
            .bind(job.option_id)
            .bind(&job.idempotency_key)
            .bind(job.status)
            .bind(&job.provider_job_set_id)
            .bind(job.attempts)
            .bind(job.last_polled_at)
            .bind(job.next_poll_at)
            .bind(job.timeout_at)
            .bind(job.progress)
            .bind(&job.output_urls)
            .bind(&job.last_error_code)
            .bind(&job.last_error_message)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.trace_id)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok((InsertOutcome::Inserted, row));
        }

        // Conflict: a concurrent caller already created this job. Read it back.
        let existing = sqlx::query_as::<_, GenerationJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE user_id = $1 AND option_id = $2 AND idempotency_key = $3"
        ))
        .bind(&job.user_id)
        .bind(job.option_id)
        .bind(&job.idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok((InsertOutcome::AlreadyExists, existing))
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<GenerationJob>> {
        let job = sqlx::query_as::<_, GenerationJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_option(&self, id: Uuid) -> anyhow::Result<Option<OptionRow>> {
        let option = sqlx::query_as::<_, OptionRow>(
            r#"
            SELECT id, message_id, rank, tool_type, model_key, parameters,
                   enhanced_prompt, requires_attachment, style_id, created_at
            FROM options
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(option)
    }

    async fn update_job(&self, job: &GenerationJob) -> anyhow::Result<GenerationJob> {
        let updated = sqlx::query_as::<_, GenerationJob>(&format!(
            r#"
            UPDATE generation_jobs SET
                status = $1,
                provider_job_set_id = $2,
                attempts = $3,
                last_polled_at = $4,
                next_poll_at = $5,
                timeout_at = $6,
                progress = $7,
                output_urls = $8,
                last_error_code = $9,
                last_error_message = $10,
                started_at = $11,
                finished_at = $12,
                updated_at = NOW(),
                locked_until = NULL
            WHERE id = $13
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.status)
        .bind(&job.provider_job_set_id)
        .bind(job.attempts)
        .bind(job.last_polled_at)
        .bind(job.next_poll_at)
        .bind(job.timeout_at)
        .bind(job.progress)
        .bind(&job.output_urls)
        .bind(&job.last_error_code)
        .bind(&job.last_error_message)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn count_active(&self) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM generation_jobs WHERE status IN ('PENDING', 'RUNNING')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn scan_stalled(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM generation_jobs
            WHERE status IN ('PENDING', 'RUNNING') AND next_poll_at < $1
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn claim_ready(
        &self,
        limit: i64,
        lease: ChronoDuration,
    ) -> anyhow::Result<Vec<GenerationJob>> {
        let claimed = sqlx::query_as::<_, GenerationJob>(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM generation_jobs
                WHERE status IN ('PENDING', 'RUNNING')
                  AND next_poll_at <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY next_poll_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE generation_jobs
            SET locked_until = NOW() + ($2 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM due)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(lease.num_milliseconds().to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }
}
