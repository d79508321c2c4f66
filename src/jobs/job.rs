//! Download job records and their state machine

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle: `pending -> downloading -> verifying -> completed | failed | cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job may move from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Downloading | Verifying) => true,
            (Downloading, Verifying) => true,
            (Verifying, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Where a job's progress numbers come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Structured progress file written by the transfer
    Reported,
    /// Heuristic scan of cache and staging directories
    Estimated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Downloading,
    Done,
}

/// Per-file sub-status of a multi-file job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub filename: String,
    pub status: FileStatus,
    pub downloaded_bytes: u64,
}

/// One installation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub model_id: String,
    pub model_name: String,
    pub status: JobStatus,
    pub downloaded_bytes: u64,
    /// Estimate when the source gives no content length
    pub total_bytes: u64,
    /// 0-100; at most 99 until the job completes
    pub percent: u8,
    /// Smoothed bytes per second
    pub speed_bps: f64,
    pub eta_secs: Option<u64>,
    pub progress_mode: ProgressMode,
    pub current_file: Option<String>,
    pub files: Vec<FileProgress>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// A client has read this job in a terminal state
    #[serde(skip)]
    pub(crate) observed: bool,
}

impl DownloadJob {
    pub fn new(
        model_id: &str,
        model_name: &str,
        total_bytes: u64,
        progress_mode: ProgressMode,
        status: JobStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            model_name: model_name.to_string(),
            status,
            downloaded_bytes: 0,
            total_bytes,
            percent: 0,
            speed_bps: 0.0,
            eta_secs: None,
            progress_mode,
            current_file: None,
            files: Vec::new(),
            error: None,
            error_kind: None,
            started_at: Utc::now(),
            completed_at: None,
            observed: false,
        }
    }

    /// Raise the percentage; never lowers it and never reaches 100
    pub fn raise_percent(&mut self, percent: u8) {
        self.percent = self.percent.max(percent.min(99));
    }

    /// Apply a status transition; refused transitions leave the job untouched
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.speed_bps = 0.0;
            self.eta_secs = None;
        }
        true
    }

    /// Mark verified and complete; the only way percent reaches 100
    pub fn complete(&mut self, installed_bytes: u64) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.percent = 100;
        if installed_bytes > 0 {
            self.downloaded_bytes = installed_bytes;
            self.total_bytes = installed_bytes;
        }
        for file in &mut self.files {
            file.status = FileStatus::Done;
        }
        true
    }

    pub fn fail(&mut self, kind: FailureKind, message: String) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.error = Some(message);
        self.error_kind = Some(kind);
        true
    }
}
