//! REST API surface of the pipeline.
//!
//! Mutating endpoints answer before execution finishes; clients follow a
//! run through `GET /pipeline/{run_id}/status`.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pipeline::executor::StageExecutor;
use crate::pipeline::processors::ScoringService;
use crate::registry::RunRegistry;
use crate::storage::ArtifactStore;

pub use handlers::ApiError;

/// State shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Durable run index.
    pub registry: Arc<RunRegistry>,
    /// Drives runs through the stage order.
    pub executor: StageExecutor,
    /// Per-run artifact roots.
    pub artifacts: ArtifactStore,
    /// Grader consulted by the validate endpoint.
    pub scoring: Arc<dyn ScoringService>,
}

impl ApiState {
    pub fn new(
        registry: Arc<RunRegistry>,
        executor: StageExecutor,
        artifacts: ArtifactStore,
        scoring: Arc<dyn ScoringService>,
    ) -> Self {
        Self {
            registry,
            executor,
            artifacts,
            scoring,
        }
    }
}

/// Builds the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Run lifecycle
        .route("/pipeline/start", post(handlers::start_run))
        .route("/pipeline/runs", get(handlers::list_runs))
        .route(
            "/pipeline/{run_id}",
            get(handlers::get_run).delete(handlers::hard_delete_run),
        )
        .route(
            "/pipeline/{run_id}/soft_delete",
            post(handlers::soft_delete_run),
        )
        .route("/pipeline/{run_id}/status", get(handlers::get_status))
        .route("/pipeline/{run_id}/resume", post(handlers::resume_run))
        .route("/pipeline/{run_id}/fork", post(handlers::fork_run))
        .route("/pipeline/{run_id}/rerun", post(handlers::rerun_run))
        // Mapping editor
        .route(
            "/pipeline/{run_id}/questions/{question_id}/manipulation",
            put(handlers::put_manipulation).delete(handlers::delete_manipulation),
        )
        .route(
            "/pipeline/{run_id}/questions/{question_id}/validate",
            post(handlers::validate_manipulation),
        )
        // Artifacts
        .route("/pipeline/{run_id}/files", get(handlers::list_files))
        .route("/pipeline/{run_id}/files/{*path}", get(handlers::get_file))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves the API until the process exits.
///
/// # Errors
///
/// Returns `std::io::Error` if binding or serving fails.
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    info!(addr, "Starting gradeprobe API server");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
