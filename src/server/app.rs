//! Application setup and router wiring.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::AppDeps;

use super::routes::{health_handler, jobs, sse};

/// Shared state handed to every handler via `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<AppDeps>,
}

pub fn build_app(deps: Arc<AppDeps>) -> Router {
    let state = AppState { deps };

    Router::new()
        .route("/options/:option_id/generate", post(jobs::generate_option))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/sse/:chat_id", get(sse::sse_chat_events))
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}
