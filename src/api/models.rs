//! API request and response models

use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub active_jobs: usize,
}

/// Request to start a download
#[derive(Debug, Serialize, Deserialize)]
pub struct StartDownloadRequest {
    pub model_id: String,

    /// Access token for gated sources; falls back to the stored hub token
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartDownloadResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}
