//! API request handlers

use super::models::{CancelResponse, HealthResponse, StartDownloadRequest, StartDownloadResponse};
use super::routes::AppState;
use crate::catalog::{ModelDefinition, ModelFilter};
use crate::error::ManagerError;
use crate::installed::InstalledModel;
use crate::jobs::DownloadJob;
use crate::manager::UploadResult;
use crate::strategies::LocalUpload;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET /health - Depot health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let active_jobs = state.manager.jobs().active_count().await;

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            active_jobs,
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /catalog - Downloadable model definitions
pub async fn list_catalog(
    State(state): State<AppState>,
    Query(filter): Query<ModelFilter>,
) -> Json<Vec<ModelDefinition>> {
    Json(state.manager.list_catalog(&filter))
}

/// POST /downloads - Start a download job
pub async fn start_download(
    State(state): State<AppState>,
    Json(req): Json<StartDownloadRequest>,
) -> Result<(StatusCode, Json<StartDownloadResponse>), ManagerError> {
    let job_id = state
        .manager
        .start_download(&req.model_id, req.credential)
        .await?;

    tracing::info!(job_id = %job_id, model = %req.model_id, "Download requested");

    Ok((StatusCode::ACCEPTED, Json(StartDownloadResponse { job_id })))
}

/// GET /downloads - All tracked jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<DownloadJob>> {
    Json(state.manager.list_jobs().await)
}

/// GET /downloads/:id - One job's progress
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DownloadJob>, ManagerError> {
    Ok(Json(state.manager.get_job(&id).await?))
}

/// POST /downloads/:id/cancel - Cancel a live job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ManagerError> {
    let cancelled = state.manager.cancel_job(&id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

/// GET /models - Installed models, including shared-cache discoveries
pub async fn list_installed(
    State(state): State<AppState>,
    Query(filter): Query<ModelFilter>,
) -> Json<Vec<InstalledModel>> {
    Json(state.manager.list_installed(&filter).await)
}

/// DELETE /models/*id - Remove an installed model and its files
pub async fn remove_installed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstalledModel>, ManagerError> {
    Ok(Json(state.manager.remove_installed(&id).await?))
}

/// POST /models/upload - Promote a file already on this host
pub async fn upload_local(
    State(state): State<AppState>,
    Json(upload): Json<LocalUpload>,
) -> Result<(StatusCode, Json<UploadResult>), ManagerError> {
    let result = state.manager.upload_local(upload).await?;
    Ok((StatusCode::CREATED, Json(result)))
}
