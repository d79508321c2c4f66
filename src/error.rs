//! Error types for the model depot and its API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Errors surfaced synchronously to callers of the depot operations
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown model '{id}'")]
    UnknownModel { id: String },

    #[error("Model '{id}' requires a credential but none was provided")]
    MissingCredential { id: String },

    #[error("Download job '{id}' not found")]
    JobNotFound { id: String },

    #[error("Installed model '{id}' not found")]
    ModelNotFound { id: String },

    #[error("Model '{id}' was discovered in a shared cache and is managed externally")]
    CacheManaged { id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl ManagerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownModel { .. } | Self::JobNotFound { .. } | Self::ModelNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::MissingCredential { .. } | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::CacheManaged { .. } => StatusCode::CONFLICT,
            Self::Io { .. } | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ManagerError {
    fn from(err: anyhow::Error) -> Self {
        ManagerError::Internal {
            message: format!("{:#}", err),
        }
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        ManagerError::Io {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ManagerError::Internal { .. } | ManagerError::Io { .. } => {
                tracing::error!(error = %self, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Classification of a failed transfer, recorded on the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The target volume ran out of space
    DiskFull,
    /// The source rejected the credential or the model is gated
    Unauthorized,
    /// The transfer produced output that could not be registered
    Verification,
    /// Any other transfer failure (network, remote error, crash)
    Transfer,
}

const DISK_FULL_MARKERS: &[&str] = &["No space left on device", "ENOSPC", "Errno 28"];
const UNAUTHORIZED_MARKERS: &[&str] = &[
    "401 Client Error",
    "403 Client Error",
    "401 Unauthorized",
    "403 Forbidden",
    "GatedRepoError",
    "is gated",
];

impl FailureKind {
    /// Classify a transfer's diagnostic output by substring match
    pub fn classify(diagnostics: &str) -> Self {
        if DISK_FULL_MARKERS.iter().any(|m| diagnostics.contains(m)) {
            Self::DiskFull
        } else if UNAUTHORIZED_MARKERS.iter().any(|m| diagnostics.contains(m)) {
            Self::Unauthorized
        } else {
            Self::Transfer
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiskFull => "disk_full",
            Self::Unauthorized => "unauthorized",
            Self::Verification => "verification",
            Self::Transfer => "transfer",
        }
    }

    /// Message shown to users for this category, given the raw detail line
    pub fn user_message(&self, detail: &str) -> String {
        match self {
            Self::DiskFull => {
                "Not enough disk space: the download ran out of space on the target volume. \
                 Free up disk space and start the download again."
                    .to_string()
            }
            Self::Unauthorized => format!(
                "Access denied by the model source. Check that your access token is valid \
                 and has accepted the model's terms ({})",
                detail
            ),
            Self::Verification => format!("Download finished but could not be verified: {}", detail),
            Self::Transfer => format!("Download failed: {}", detail),
        }
    }
}
