//! Poller Worker — the state machine that drives a `GenerationJob` from
//! `PENDING` to a terminal status.
//!
//! Transition logic follows `_poll_generation_async` in the pre-distillation
//! Celery task line for line (load → terminal check → timeout check → start
//! generation → not-yet-due → poll → completed/failed/still-processing →
//! rate-limit/provider-error/internal-error handlers). The surrounding
//! claim/sleep/shutdown loop follows `kernel/jobs/worker.rs`'s `Service::run`
//! body; no generic `Service` trait is implemented here since one isn't
//! defined anywhere in this crate's own module tree — the loop is inlined
//! instead, same shape.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{ErrorPayload, Event, EventBus};
use super::metrics::MetricsSink;
use super::model::{GenerationJob, JobStatus, OutputUrls};
use super::provider::{NormalizedStatus, ProviderAdapter, ProviderError};
use super::store::JobStore;
use crate::kernel::clock::{Clock, Random};

/// Backoff/timeout knobs, mirroring `POLL_MIN_INTERVAL_MS` /
/// `POLL_MAX_INTERVAL_MS` / `POLL_JITTER` from the pre-distillation settings.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub min_interval_ms: i64,
    pub max_interval_ms: i64,
    pub jitter: f64,
    pub batch_size: i64,
    pub claim_lease: Duration,
    pub idle_poll_interval: StdDuration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 30_000,
            jitter: 0.2,
            batch_size: 10,
            claim_lease: Duration::seconds(30),
            idle_poll_interval: StdDuration::from_secs(5),
        }
    }
}

/// `backoff(n) = clamp(min_ms * 2^n, min_ms, max_ms) + U(-jitter*capped, +jitter*capped)`,
/// floored at 1ms. `n` should already have been adjusted by the caller for
/// the rate-limit penalty (`attempts + 5`).
pub fn backoff_ms(attempt: i32, config: &PollerConfig, random: &dyn Random) -> i64 {
    let base = (config.min_interval_ms as f64) * 2f64.powi(attempt.max(0));
    let capped = base.min(config.max_interval_ms as f64).max(config.min_interval_ms as f64);
    let jitter_range = capped * config.jitter;
    let jittered = capped + random.jitter(jitter_range);
    jittered.max(1.0) as i64
}

/// Whole-seconds scheduler delay from a millisecond backoff, matching
/// `max(1, int(ms/1000))`.
pub fn backoff_delay_seconds(ms: i64) -> i64 {
    (ms / 1000).max(1)
}

pub struct PollerWorker {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn ProviderAdapter>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    config: PollerConfig,
}

impl PollerWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn ProviderAdapter>,
        events: EventBus,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn Random>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            metrics,
            clock,
            random,
            config,
        }
    }

    /// The Service-style run loop: claim a batch, process each job
    /// concurrently, sleep when nothing is ready, stop claiming once
    /// `shutdown` fires (letting in-flight transitions finish).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(batch_size = self.config.batch_size, "poller worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .store
                .claim_ready(self.config.batch_size, self.config.claim_lease)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim ready jobs");
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                }
                continue;
            }

            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                let worker = self.clone();
                handles.push(async move { worker.process_job(job).await });
            }
            futures::future::join_all(handles).await;
        }

        info!("poller worker stopped");
    }

    /// Process a single claimed job: exactly one transition, per §4.3.
    async fn process_job(&self, job: GenerationJob) {
        let job_id = job.id;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = ?job.status, "job already terminal, dropping tick");
            return;
        }

        let now = self.clock.now();

        if now >= job.timeout_at {
            self.transition_timeout(job, now).await;
            return;
        }

        if job.provider_job_set_id.is_none() {
            self.transition_start_generation(job, now).await;
            return;
        }

        if now < job.next_poll_at {
            debug!(job_id = %job_id, next_poll_at = %job.next_poll_at, "not yet due, leaving for next tick");
            return;
        }

        self.transition_poll(job, now).await;
    }

    async fn transition_timeout(&self, mut job: GenerationJob, now: DateTime<Utc>) {
        let job_id = job.id;
        warn!(job_id = %job_id, timeout_at = %job.timeout_at, "job timed out");

        job.status = JobStatus::Timeout;
        job.finished_at = Some(now);
        job.last_error_code = Some("TIMEOUT".to_string());
        job.last_error_message = Some("job exceeded timeout".to_string());

        let updated = match self.store.update_job(&job).await {
            Ok(row) => row,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to persist timeout transition");
                return;
            }
        };

        if let Ok(Some(option)) = self.store.get_option(updated.option_id).await {
            self.metrics.inc_jobs_timeout(tool_type_label(option.tool_type), &option.model_key);
        }

        self.publish_status(&updated, None, None).await;
    }

    async fn transition_start_generation(&self, mut job: GenerationJob, now: DateTime<Utc>) {
        let job_id = job.id;

        let option = match self.store.get_option(job.option_id).await {
            Ok(Some(option)) => option,
            Ok(None) => {
                error!(job_id = %job_id, option_id = %job.option_id, "option not found");
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.last_error_code = Some("OPTION_NOT_FOUND".to_string());
                job.last_error_message = Some("associated option not found".to_string());
                if let Ok(updated) = self.store.update_job(&job).await {
                    self.publish_status(&updated, None, None).await;
                }
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load option");
                self.metrics.inc_provider_error("INTERNAL_ERROR");
                return;
            }
        };

        info!(job_id = %job_id, model_key = %option.model_key, "starting provider generation");

        match self
            .provider
            .start_generation(&option.model_key, &option.parameters, &option.enhanced_prompt)
            .await
        {
            Ok(provider_job_set_id) => {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.attempts += 1;
                job.provider_job_set_id = Some(provider_job_set_id);
                job.next_poll_at = now + Duration::milliseconds(backoff_ms(0, &self.config, self.random.as_ref()));

                match self.store.update_job(&job).await {
                    Ok(updated) => self.publish_status(&updated, None, None).await,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to persist start-generation transition");
                        self.metrics.inc_provider_error("INTERNAL_ERROR");
                    }
                }
            }
            Err(err) => self.handle_provider_error(job, option, now, err).await,
        }
    }

    async fn transition_poll(&self, mut job: GenerationJob, now: DateTime<Utc>) {
        let job_id = job.id;
        let Some(provider_job_set_id) = job.provider_job_set_id.clone() else {
            error!(job_id = %job_id, "transition_poll called without a provider_job_set_id");
            return;
        };

        let option = match self.store.get_option(job.option_id).await {
            Ok(Some(option)) => option,
            Ok(None) => {
                error!(job_id = %job_id, option_id = %job.option_id, "option not found");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load option");
                self.metrics.inc_provider_error("INTERNAL_ERROR");
                return;
            }
        };

        info!(job_id = %job_id, provider_job_set_id = %provider_job_set_id, attempt = job.attempts, "polling provider");

        match self.provider.get_job_set(&provider_job_set_id).await {
            Ok(job_set) => {
                job.last_polled_at = Some(now);
                job.attempts += 1;
                self.metrics.inc_provider_poll(&option.model_key, status_label(job_set.status));

                match job_set.status {
                    NormalizedStatus::Completed => {
                        job.status = JobStatus::Succeeded;
                        job.finished_at = Some(now);
                        job.progress = Some(100);
                        let result = job_set.results.first().map(|r| OutputUrls {
                            kind: r.kind.clone(),
                            min_url: r.min_url.clone(),
                            raw_url: r.raw_url.clone(),
                        });
                        job.output_urls = result.as_ref().and_then(|r| serde_json::to_value(r).ok());

                        let updated = match self.store.update_job(&job).await {
                            Ok(row) => row,
                            Err(e) => {
                                error!(job_id = %job_id, error = %e, "failed to persist success transition");
                                self.metrics.inc_provider_error("INTERNAL_ERROR");
                                return;
                            }
                        };
                        self.metrics.inc_jobs_succeeded(tool_type_label(option.tool_type), &option.model_key);
                        self.publish_status(&updated, result.and_then(|r| serde_json::to_value(r).ok()), None).await;
                    }
                    NormalizedStatus::Failed => {
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(now);
                        job.last_error_code = Some("PROVIDER_FAILED".to_string());
                        job.last_error_message = Some("provider reported failure".to_string());

                        let updated = match self.store.update_job(&job).await {
                            Ok(row) => row,
                            Err(e) => {
                                error!(job_id = %job_id, error = %e, "failed to persist failure transition");
                                self.metrics.inc_provider_error("INTERNAL_ERROR");
                                return;
                            }
                        };
                        self.metrics.inc_jobs_failed(
                            tool_type_label(option.tool_type),
                            &option.model_key,
                            "PROVIDER_FAILED",
                        );
                        self.publish_status(
                            &updated,
                            None,
                            Some(ErrorPayload {
                                code: "PROVIDER_FAILED".to_string(),
                                message: "provider reported failure".to_string(),
                            }),
                        )
                        .await;
                    }
                    NormalizedStatus::Queued | NormalizedStatus::Processing => {
                        job.next_poll_at = now
                            + Duration::milliseconds(backoff_ms(job.attempts, &self.config, self.random.as_ref()));

                        if let Err(e) = self.store.update_job(&job).await {
                            error!(job_id = %job_id, error = %e, "failed to persist still-processing transition");
                            self.metrics.inc_provider_error("INTERNAL_ERROR");
                        } else {
                            debug!(job_id = %job_id, next_poll_at = %job.next_poll_at, "still processing");
                        }
                    }
                }
            }
            Err(err) => self.handle_provider_error(job, option, now, err).await,
        }
    }

    async fn handle_provider_error(
        &self,
        mut job: GenerationJob,
        option: super::model::OptionRow,
        now: DateTime<Utc>,
        err: ProviderError,
    ) {
        let job_id = job.id;
        job.last_error_code = Some(err.code().to_string());
        job.last_error_message = Some(err.to_string());

        if err.retryable() {
            let penalty_attempt = if matches!(err, ProviderError::RateLimited(_)) {
                job.attempts + 5
            } else {
                job.attempts
            };
            job.next_poll_at =
                now + Duration::milliseconds(backoff_ms(penalty_attempt, &self.config, self.random.as_ref()));

            warn!(job_id = %job_id, code = err.code(), "retryable provider error, backing off");
            self.metrics.inc_provider_error(err.code());

            if let Err(e) = self.store.update_job(&job).await {
                error!(job_id = %job_id, error = %e, "failed to persist retryable-error transition");
            }
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);

            error!(job_id = %job_id, code = err.code(), "non-retryable provider error, failing job");
            self.metrics.inc_provider_error(err.code());

            let updated = match self.store.update_job(&job).await {
                Ok(row) => row,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to persist non-retryable-error transition");
                    return;
                }
            };
            self.metrics
                .inc_jobs_failed(tool_type_label(option.tool_type), &option.model_key, err.code());
            self.publish_status(
                &updated,
                None,
                Some(ErrorPayload {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            )
            .await;
        }
    }

    async fn publish_status(
        &self,
        job: &GenerationJob,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
    ) {
        self.events
            .publish(
                &Event::channel(&job.user_id),
                Event::JobUpdated {
                    job_id: job.id,
                    status: job.status,
                    result,
                    error,
                },
            )
            .await;
    }
}

fn tool_type_label(tool_type: super::model::ToolType) -> &'static str {
    use super::model::ToolType;
    match tool_type {
        ToolType::TextToImage => "text_to_image",
        ToolType::TextToVideo => "text_to_video",
        ToolType::ImageToVideo => "image_to_video",
        ToolType::Speak => "speak",
    }
}

fn status_label(status: NormalizedStatus) -> &'static str {
    match status {
        NormalizedStatus::Queued => "queued",
        NormalizedStatus::Processing => "processing",
        NormalizedStatus::Completed => "completed",
        NormalizedStatus::Failed => "failed",
    }
}

/// Stalled-job sweeper: periodically requeues `{PENDING, RUNNING}` jobs
/// whose `next_poll_at` fell in the past without a transition landing,
/// covering the gap between "scheduler redelivers" and "scheduler lost the
/// tick" per §4.3's durability note.
pub async fn sweep_stalled(store: &dyn JobStore, clock: &dyn Clock) -> anyhow::Result<usize> {
    let now = clock.now();
    let stalled = store.scan_stalled(now).await?;
    let count = stalled.len();
    if count > 0 {
        warn!(count, "found stalled jobs; relying on claim_ready to pick them back up");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clock::{FakeClock, FakeRandom};
    use crate::kernel::jobs::metrics::InMemoryMetrics;
    use crate::kernel::jobs::model::{OptionRow, ToolType};
    use crate::kernel::jobs::provider::NormalizedJobSet;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = PollerConfig::default();
        let random = FakeRandom::zero();
        assert_eq!(backoff_ms(0, &config, &random), 1_000);
        assert_eq!(backoff_ms(1, &config, &random), 2_000);
        assert_eq!(backoff_ms(2, &config, &random), 4_000);
        assert_eq!(backoff_ms(10, &config, &random), 30_000); // capped
    }

    #[test]
    fn backoff_applies_jitter_within_range() {
        let config = PollerConfig::default();
        let random = FakeRandom::fixed(200.0);
        let ms = backoff_ms(1, &config, &random);
        // base=2000, jitter_range = 2000*0.2=400, fixed clamps to 400, but we asked for 200
        assert_eq!(ms, 2_000 + 200);
    }

    #[test]
    fn backoff_delay_seconds_floors_at_one() {
        assert_eq!(backoff_delay_seconds(1), 1);
        assert_eq!(backoff_delay_seconds(999), 1);
        assert_eq!(backoff_delay_seconds(2_500), 2);
    }

    // --- In-memory JobStore fake for state-machine tests ---

    struct FakeJobStore {
        jobs: Mutex<HashMap<Uuid, GenerationJob>>,
        options: Mutex<HashMap<Uuid, OptionRow>>,
        // Mirrors the real store's separate `locked_until` column: claim_ready
        // must lease a job without mutating its `next_poll_at`, or the poller's
        // own due-check would see a freshly-claimed job as "not yet due".
        locked_until: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    }

    impl FakeJobStore {
        fn new() -> Self {
            Self {
                jobs: Mutex::new(HashMap::new()),
                options: Mutex::new(HashMap::new()),
                locked_until: Mutex::new(HashMap::new()),
            }
        }

        fn insert_option(&self, option: OptionRow) {
            self.options.lock().unwrap().insert(option.id, option);
        }

        fn insert_job(&self, job: GenerationJob) {
            self.jobs.lock().unwrap().insert(job.id, job);
        }
    }

    #[async_trait]
    impl JobStore for FakeJobStore {
        async fn insert_job_if_absent(
            &self,
            job: GenerationJob,
        ) -> anyhow::Result<(super::super::store::InsertOutcome, GenerationJob)> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.values().find(|j| {
                j.user_id == job.user_id
                    && j.option_id == job.option_id
                    && j.idempotency_key == job.idempotency_key
            }) {
                return Ok((super::super::store::InsertOutcome::AlreadyExists, existing.clone()));
            }
            jobs.insert(job.id, job.clone());
            Ok((super::super::store::InsertOutcome::Inserted, job))
        }

        async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<GenerationJob>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }

        async fn get_option(&self, id: Uuid) -> anyhow::Result<Option<OptionRow>> {
            Ok(self.options.lock().unwrap().get(&id).cloned())
        }

        async fn update_job(&self, job: &GenerationJob) -> anyhow::Result<GenerationJob> {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(job.id, job.clone());
            self.locked_until.lock().unwrap().remove(&job.id);
            Ok(job.clone())
        }

        async fn count_active(&self) -> anyhow::Result<i64> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| !j.status.is_terminal())
                .count() as i64)
        }

        async fn scan_stalled(&self, before: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| !j.status.is_terminal() && j.next_poll_at < before)
                .map(|j| j.id)
                .collect())
        }

        async fn claim_ready(&self, limit: i64, lease: Duration) -> anyhow::Result<Vec<GenerationJob>> {
            let now = Utc::now();
            let mut locks = self.locked_until.lock().unwrap();
            let claimed: Vec<GenerationJob> = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| {
                    !j.status.is_terminal()
                        && j.next_poll_at <= now
                        && locks.get(&j.id).map(|until| *until < now).unwrap_or(true)
                })
                .take(limit as usize)
                .cloned()
                .collect();
            for job in &claimed {
                locks.insert(job.id, now + lease);
            }
            Ok(claimed)
        }
    }

    // --- Scriptable fake ProviderAdapter ---

    enum ScriptedResponse {
        Start(Result<String, ProviderError>),
        Poll(Result<NormalizedJobSet, ProviderError>),
    }

    struct FakeProvider {
        responses: AsyncMutex<Vec<ScriptedResponse>>,
    }

    impl FakeProvider {
        fn new(responses: Vec<ScriptedResponse>) -> Self {
            Self {
                responses: AsyncMutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeProvider {
        async fn start_generation(
            &self,
            _model_key: &str,
            _params: &serde_json::Value,
            _prompt: &str,
        ) -> Result<String, ProviderError> {
            match self.responses.lock().await.remove(0) {
                ScriptedResponse::Start(r) => r,
                _ => panic!("expected a Start script entry"),
            }
        }

        async fn get_job_set(&self, _id: &str) -> Result<NormalizedJobSet, ProviderError> {
            match self.responses.lock().await.remove(0) {
                ScriptedResponse::Poll(r) => r,
                _ => panic!("expected a Poll script entry"),
            }
        }
    }

    fn sample_option() -> OptionRow {
        OptionRow {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            rank: 0,
            tool_type: ToolType::TextToImage,
            model_key: "model-a".to_string(),
            parameters: serde_json::json!({}),
            enhanced_prompt: "a cat".to_string(),
            requires_attachment: false,
            style_id: None,
            created_at: Utc::now(),
        }
    }

    fn sample_job(option_id: Uuid, now: DateTime<Utc>) -> GenerationJob {
        GenerationJob::builder()
            .id(Uuid::new_v4())
            .user_id("u1")
            .option_id(option_id)
            .idempotency_key("key-1")
            .status(JobStatus::Pending)
            .next_poll_at(now)
            .timeout_at(now + Duration::seconds(180))
            .trace_id(Uuid::new_v4())
            .created_at(now)
            .updated_at(now)
            .build()
    }

    fn make_worker(
        store: Arc<FakeJobStore>,
        provider: Arc<FakeProvider>,
        clock: Arc<FakeClock>,
    ) -> (Arc<PollerWorker>, EventBus) {
        let events = EventBus::new();
        let worker = Arc::new(PollerWorker::new(
            store,
            provider,
            events.clone(),
            Arc::new(InMemoryMetrics::new()),
            clock,
            Arc::new(FakeRandom::zero()),
            PollerConfig::default(),
        ));
        (worker, events)
    }

    #[tokio::test]
    async fn terminal_job_is_a_noop() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(now);
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn timeout_dominates_pending_job() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now - Duration::seconds(1));
        job.timeout_at = now - Duration::seconds(1);
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![]));
        let (worker, mut events) = make_worker(store.clone(), provider, clock);
        let mut sub = events.subscribe("chat:u1").await;

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Timeout);
        assert_eq!(after.last_error_code.as_deref(), Some("TIMEOUT"));
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn pending_job_starts_generation_and_moves_to_running() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let job = sample_job(option.id, now);
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Start(Ok("pjs-1".to_string()))]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(after.provider_job_set_id.as_deref(), Some("pjs-1"));
        assert_eq!(after.attempts, 1);
        assert!(after.started_at.is_some());
    }

    #[tokio::test]
    async fn running_job_not_yet_due_is_left_untouched() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now + Duration::seconds(30));
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        let before = loaded.clone();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.next_poll_at, before.next_poll_at);
        assert_eq!(after.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn running_job_completed_poll_succeeds() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Poll(Ok(NormalizedJobSet {
            status: NormalizedStatus::Completed,
            results: vec![super::super::provider::NormalizedResult {
                kind: "image".to_string(),
                min_url: Some("min.jpg".to_string()),
                raw_url: Some("raw.jpg".to_string()),
            }],
        }))]));
        let (worker, mut events) = make_worker(store.clone(), provider, clock);
        let mut sub = events.subscribe("chat:u1").await;

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Succeeded);
        assert_eq!(after.progress, Some(100));
        assert!(after.output_urls.is_some());
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn running_job_failed_poll_fails_job() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Poll(Ok(NormalizedJobSet {
            status: NormalizedStatus::Failed,
            results: vec![],
        }))]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.last_error_code.as_deref(), Some("PROVIDER_FAILED"));
    }

    #[tokio::test]
    async fn running_job_still_processing_reschedules() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Poll(Ok(NormalizedJobSet {
            status: NormalizedStatus::Processing,
            results: vec![],
        }))]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.next_poll_at > now);
        assert_eq!(after.attempts, 1);
    }

    #[tokio::test]
    async fn retryable_provider_error_backs_off_without_failing() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Poll(Err(
            ProviderError::RateLimited("slow down".to_string()),
        ))]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(after.last_error_code.as_deref(), Some("RATE_LIMITED"));
        assert!(after.next_poll_at > now);
    }

    #[tokio::test]
    async fn non_retryable_provider_error_fails_job() {
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![ScriptedResponse::Poll(Err(
            ProviderError::JobNotFound("gone".to_string()),
        ))]));
        let (worker, _events) = make_worker(store.clone(), provider, clock);

        let loaded = store.get_job(job_id).await.unwrap().unwrap();
        worker.process_job(loaded).await;

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.last_error_code.as_deref(), Some("JOB_NOT_FOUND"));
    }

    #[tokio::test]
    async fn claim_ready_does_not_mutate_next_poll_at() {
        // The lease must live on its own tracking field, not on next_poll_at —
        // otherwise the state machine's own due-check would see a
        // freshly-claimed job as "not yet due" and never poll it.
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let claimed = store.claim_ready(10, Duration::seconds(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].next_poll_at, now);
    }

    #[tokio::test]
    async fn running_job_is_polled_to_completion_across_repeated_claim_cycles() {
        // Regression test for a bug where the scheduler's claim lease reused
        // next_poll_at: every claim re-leased the job forward and the poll
        // transitions (completed/failed/still-processing) were never reached,
        // so a RUNNING job could only ever exit via timeout.
        let now = Utc::now();
        let store = Arc::new(FakeJobStore::new());
        let option = sample_option();
        store.insert_option(option.clone());
        let mut job = sample_job(option.id, now);
        job.status = JobStatus::Running;
        job.provider_job_set_id = Some("pjs-1".to_string());
        let job_id = job.id;
        store.insert_job(job);

        let clock = Arc::new(FakeClock::new(now));
        let provider = Arc::new(FakeProvider::new(vec![
            ScriptedResponse::Poll(Ok(NormalizedJobSet {
                status: NormalizedStatus::Processing,
                results: vec![],
            })),
            ScriptedResponse::Poll(Ok(NormalizedJobSet {
                status: NormalizedStatus::Completed,
                results: vec![super::super::provider::NormalizedResult {
                    kind: "image".to_string(),
                    min_url: Some("min.jpg".to_string()),
                    raw_url: Some("raw.jpg".to_string()),
                }],
            })),
        ]));
        let (worker, _events) = make_worker(store.clone(), provider, clock.clone());

        // First scheduler cycle: claim, poll (still processing), reschedule.
        let claimed = store.claim_ready(10, Duration::seconds(30)).await.unwrap();
        assert_eq!(claimed.len(), 1, "job should be claimable on its first due tick");
        worker.process_job(claimed.into_iter().next().unwrap()).await;

        let after_first = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after_first.status, JobStatus::Running);
        assert!(after_first.next_poll_at > now);

        // Advance the clock to the new next_poll_at and run a second cycle.
        clock.set(after_first.next_poll_at);
        let claimed = store.claim_ready(10, Duration::seconds(30)).await.unwrap();
        assert_eq!(claimed.len(), 1, "rescheduled job should be claimable once due again");
        worker.process_job(claimed.into_iter().next().unwrap()).await;

        let after_second = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after_second.status, JobStatus::Succeeded);
    }
}
