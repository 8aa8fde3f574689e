//! Counters and gauges for the generation job subsystem.
//!
//! No metrics crate appears anywhere in the example pack's Cargo.tomls, so
//! this is a hand-rolled `std::sync::atomic` implementation behind a trait —
//! consistent with the corpus-wide `Arc<dyn Trait>` dependency-injection
//! style rather than a new third-party dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Counters/gauges for jobs by status, provider polls, provider errors by
/// class, and current queue depth.
pub trait MetricsSink: Send + Sync {
    fn inc_jobs_created(&self, tool_type: &str, model_key: &str);
    fn inc_jobs_succeeded(&self, tool_type: &str, model_key: &str);
    fn inc_jobs_failed(&self, tool_type: &str, model_key: &str, error_code: &str);
    fn inc_jobs_timeout(&self, tool_type: &str, model_key: &str);
    fn inc_provider_poll(&self, model_key: &str, status: &str);
    fn inc_provider_error(&self, error_type: &str);
    fn set_queue_depth(&self, depth: i64);
}

/// In-memory counters, keyed by label tuple, for the absence of any metrics
/// crate in the corpus's dependency stack. Sufficient for unit tests and for
/// exposing a debug snapshot; a real deployment would swap this for
/// whatever scrape endpoint the operator's stack expects without touching
/// the `MetricsSink` call sites.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, AtomicU64>>,
    queue_depth: AtomicI64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: String) {
        if let Some(counter) = self.counters.read().unwrap().get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.load(Ordering::Relaxed)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn inc_jobs_created(&self, tool_type: &str, model_key: &str) {
        self.bump(format!("jobs_created_total{{tool_type={tool_type},model_key={model_key}}}"));
    }

    fn inc_jobs_succeeded(&self, tool_type: &str, model_key: &str) {
        self.bump(format!(
            "jobs_succeeded_total{{tool_type={tool_type},model_key={model_key}}}"
        ));
    }

    fn inc_jobs_failed(&self, tool_type: &str, model_key: &str, error_code: &str) {
        self.bump(format!(
            "jobs_failed_total{{tool_type={tool_type},model_key={model_key},error_code={error_code}}}"
        ));
    }

    fn inc_jobs_timeout(&self, tool_type: &str, model_key: &str) {
        self.bump(format!(
            "jobs_timeout_total{{tool_type={tool_type},model_key={model_key}}}"
        ));
    }

    fn inc_provider_poll(&self, model_key: &str, status: &str) {
        self.bump(format!(
            "provider_polls_total{{model_key={model_key},status={status}}}"
        ));
    }

    fn inc_provider_error(&self, error_type: &str) {
        self.bump(format!("provider_errors_total{{error_type={error_type}}}"));
    }

    fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }
}
