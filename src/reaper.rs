//! Periodic removal of finished jobs from memory

use crate::jobs::JobRegistry;
use std::sync::Arc;
use tokio::time::{Duration, interval};

/// Drops terminal, observed jobs once they outlive the retention window
pub struct JobReaper {
    jobs: Arc<JobRegistry>,
    reap_interval: Duration,
    retention: Duration,
}

impl JobReaper {
    pub fn new(jobs: Arc<JobRegistry>, reap_interval_secs: u64, retention_secs: u64) -> Self {
        Self {
            jobs,
            reap_interval: Duration::from_secs(reap_interval_secs.max(1)),
            retention: Duration::from_secs(retention_secs),
        }
    }

    /// Start the reaping loop
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.reap_interval);

        tracing::info!(
            interval_secs = self.reap_interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Job reaper started"
        );

        loop {
            ticker.tick().await;
            self.reap_once().await;
        }
    }

    pub async fn reap_once(&self) -> usize {
        let reaped = self.jobs.reap(self.retention).await;
        if reaped > 0 {
            tracing::debug!(reaped = reaped, remaining = self.jobs.len(), "Reaped finished jobs");
        }
        reaped
    }
}
