//! Process-level dependency container.
//!
//! Constructed once in `main`, handed to every component by `Arc` — never a
//! lazily-initialized global, per SPEC §5/§9. Mirrors `ServerKernel`'s shape:
//! a plain struct of `Arc<dyn Trait>` fields plus the shared resources
//! (db pool, event bus) that aren't behind a trait.

use std::sync::Arc;

use sqlx::PgPool;

use super::clock::{Clock, Random};
use super::jobs::events::EventBus;
use super::jobs::metrics::MetricsSink;
use super::jobs::orchestrator::{Orchestrator, TimeoutConfig};
use super::jobs::poller::PollerConfig;
use super::jobs::provider::ProviderAdapter;
use super::jobs::store::JobStore;

/// Everything the HTTP boundary and the poller worker need.
pub struct AppDeps {
    pub db_pool: PgPool,
    pub store: Arc<dyn JobStore>,
    pub provider: Arc<dyn ProviderAdapter>,
    pub events: EventBus,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn Random>,
    pub orchestrator: Arc<Orchestrator>,
    pub poller_config: PollerConfig,
}

impl AppDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn ProviderAdapter>,
        events: EventBus,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn Random>,
        timeouts: TimeoutConfig,
        poller_config: PollerConfig,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            metrics.clone(),
            clock.clone(),
            timeouts,
        ));

        Self {
            db_pool,
            store,
            provider,
            events,
            metrics,
            clock,
            random,
            orchestrator,
            poller_config,
        }
    }
}
