//! `GET /health` — database connectivity, pool utilization, event bus status.
//!
//! Adapted from `server/routes/health.rs`: same check shape (timed `SELECT 1`,
//! pool size/idle-connections, 503 on an unhealthy database), trimmed of the
//! GraphQL/domain checks that don't exist in this crate.

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use super::super::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
    event_bus: String,
    active_jobs: Option<i64>,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
    max_connections: Option<u32>,
}

pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let db_health = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.deps.db_pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error".to_string(),
            error: Some(format!("query failed: {e}")),
        },
        Err(_) => DatabaseHealth {
            status: "error".to_string(),
            error: Some("query timeout (>5s)".to_string()),
        },
    };

    let pool_options = state.deps.db_pool.options();
    let pool_health = ConnectionPoolHealth {
        size: state.deps.db_pool.size(),
        idle_connections: state.deps.db_pool.num_idle(),
        max_connections: Some(pool_options.get_max_connections()),
    };

    let active_jobs = state.deps.store.count_active().await.ok();
    if let Some(depth) = active_jobs {
        state.deps.metrics.set_queue_depth(depth);
    }

    let is_healthy = db_health.status == "ok";
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            database: db_health,
            connection_pool: pool_health,
            event_bus: "ok".to_string(),
            active_jobs,
        }),
    )
}
