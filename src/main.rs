// Main entry point for the generation job server.

use std::sync::Arc;

use anyhow::{Context, Result};
use genjob_core::kernel::clock::{SystemClock, SystemRandom};
use genjob_core::kernel::jobs::events::EventBus;
use genjob_core::kernel::jobs::metrics::InMemoryMetrics;
use genjob_core::kernel::jobs::orchestrator::TimeoutConfig;
use genjob_core::kernel::jobs::poller::{PollerConfig, PollerWorker};
use genjob_core::kernel::jobs::provider::HttpProviderAdapter;
use genjob_core::kernel::jobs::store::PgJobStore;
use genjob_core::kernel::AppDeps;
use genjob_core::server::build_app;
use genjob_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const NUM_POLLER_WORKERS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,genjob_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting generation job server");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    tracing::info!("connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connected");

    tracing::info!("running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let store = Arc::new(PgJobStore::new(pool.clone()));
    let provider = Arc::new(
        HttpProviderAdapter::new(
            config.provider_base_url.clone(),
            config.provider_api_key.clone(),
            config.provider_secret.clone(),
        )
        .context("failed to build provider adapter")?,
    );
    let events = EventBus::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let clock = Arc::new(SystemClock);
    let random = Arc::new(SystemRandom);

    let timeouts = TimeoutConfig {
        t2i_timeout_s: config.t2i_timeout_s,
        t2v_timeout_s: config.t2v_timeout_s,
        i2v_timeout_s: config.i2v_timeout_s,
    };
    let poller_config = PollerConfig {
        min_interval_ms: config.poll_min_interval_ms,
        max_interval_ms: config.poll_max_interval_ms,
        jitter: config.poll_jitter,
        batch_size: config.poll_batch_size,
        ..PollerConfig::default()
    };

    let deps = Arc::new(AppDeps::new(
        pool,
        store.clone(),
        provider.clone(),
        events.clone(),
        metrics.clone(),
        clock.clone(),
        random.clone(),
        timeouts,
        poller_config,
    ));

    let shutdown = CancellationToken::new();

    let mut poller_handles = Vec::with_capacity(NUM_POLLER_WORKERS);
    for worker_id in 0..NUM_POLLER_WORKERS {
        let worker = Arc::new(PollerWorker::new(
            store.clone(),
            provider.clone(),
            events.clone(),
            metrics.clone(),
            clock.clone(),
            random.clone(),
            poller_config,
        ));
        let worker_shutdown = shutdown.clone();
        poller_handles.push(tokio::spawn(async move {
            tracing::info!(worker_id, "poller worker task starting");
            worker.run(worker_shutdown).await;
        }));
    }

    let app = build_app(deps);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(%addr, "starting server");
    tracing::info!("health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining in-flight poller ticks");
        server_shutdown.cancel();
    })
    .await
    .context("server error")?;

    for handle in poller_handles {
        let _ = handle.await;
    }

    Ok(())
}
