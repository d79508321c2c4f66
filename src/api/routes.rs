//! API route definitions

use crate::manager::ModelManager;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Catalog
        .route("/catalog", get(handlers::list_catalog))
        // Download jobs
        .route("/downloads", get(handlers::list_jobs))
        .route("/downloads", post(handlers::start_download))
        .route("/downloads/{id}", get(handlers::get_job))
        .route("/downloads/{id}/cancel", post(handlers::cancel_job))
        // Installed models
        .route("/models", get(handlers::list_installed))
        .route("/models/upload", post(handlers::upload_local))
        // Catch-all: shadow ids are `hub-cache:<org>/<name>`
        .route("/models/{*id}", delete(handlers::remove_installed))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
