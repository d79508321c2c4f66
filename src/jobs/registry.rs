//! Concurrency-safe job table
//!
//! Each job lives in its own [`JobEntry`] with a private lock, so polling one
//! job never waits on another job's estimator.

use super::job::{DownloadJob, JobStatus, ProgressMode};
use crate::error::{FailureKind, ManagerError, ManagerResult};
use crate::supervisor::TransferControl;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// One job plus its cancellation plumbing
pub struct JobEntry {
    id: String,
    job: RwLock<DownloadJob>,
    cancel_tx: watch::Sender<bool>,
    control: Mutex<Option<TransferControl>>,
}

impl JobEntry {
    fn new(job: DownloadJob) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: job.id.clone(),
            job: RwLock::new(job),
            cancel_tx,
            control: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> DownloadJob {
        self.job.read().await.clone()
    }

    /// Mutate the job under its lock
    pub async fn update<R>(&self, f: impl FnOnce(&mut DownloadJob) -> R) -> R {
        let mut job = self.job.write().await;
        f(&mut job)
    }

    /// Receiver that flips to `true` when the job is cancelled
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Resolves once the job has been cancelled
    pub async fn cancelled(&self) {
        let mut token = self.cancel_token();
        while !*token.borrow_and_update() {
            if token.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub async fn transition(&self, next: JobStatus) -> bool {
        self.update(|job| job.transition(next)).await
    }

    pub async fn complete(&self, installed_bytes: u64) -> bool {
        self.update(|job| job.complete(installed_bytes)).await
    }

    pub async fn fail(&self, kind: FailureKind, message: String) -> bool {
        self.update(|job| job.fail(kind, message)).await
    }

    /// Hand the running transfer to the entry
    ///
    /// If the job was cancelled while the transfer was starting, the control
    /// is handed back and the caller must stop it.
    pub async fn attach_control(&self, control: TransferControl) -> Option<TransferControl> {
        let mut slot = self.control.lock().await;
        if self.is_cancel_requested() {
            return Some(control);
        }
        *slot = Some(control);
        None
    }

    pub async fn detach_control(&self) -> Option<TransferControl> {
        self.control.lock().await.take()
    }
}

/// Registry of all active and recent download jobs
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a job; the caller spawns its execution
    pub fn create(
        &self,
        model_id: &str,
        model_name: &str,
        total_bytes: u64,
        mode: ProgressMode,
        status: JobStatus,
    ) -> Arc<JobEntry> {
        let job = DownloadJob::new(model_id, model_name, total_bytes, mode, status);
        let entry = Arc::new(JobEntry::new(job));
        self.jobs.insert(entry.id.clone(), entry.clone());

        tracing::info!(job_id = %entry.id, model = %model_id, status = %status, "Job created");
        crate::metrics::update_tracked_jobs(self.jobs.len());
        entry
    }

    pub fn entry(&self, id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of a job; reading a terminal job marks it observed
    pub async fn get(&self, id: &str) -> Option<DownloadJob> {
        let entry = self.entry(id)?;
        Some(Self::observe(&entry).await)
    }

    /// Snapshots of every job, oldest first
    pub async fn list(&self) -> Vec<DownloadJob> {
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(Self::observe(&entry).await);
        }
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    async fn observe(entry: &JobEntry) -> DownloadJob {
        entry
            .update(|job| {
                if job.status.is_terminal() {
                    job.observed = true;
                }
                job.clone()
            })
            .await
    }

    /// Cancel a job
    ///
    /// Returns `Ok(false)` for jobs already terminal. For live jobs the status
    /// becomes `cancelled` immediately; the process tree is stopped and partial
    /// files are deleted in the background.
    pub async fn cancel(&self, id: &str) -> ManagerResult<bool> {
        let entry = self
            .entry(id)
            .ok_or_else(|| ManagerError::JobNotFound { id: id.to_string() })?;
        Ok(self.cancel_entry(&entry).await.is_some())
    }

    /// Cancel every live job and wait for their cleanup
    pub async fn cancel_all(&self) -> usize {
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();

        let mut cleanups = Vec::new();
        for entry in entries {
            if let Some(cleanup) = self.cancel_entry(&entry).await {
                cleanups.push(cleanup);
            }
        }
        let count = cleanups.len();
        futures::future::join_all(cleanups.into_iter().flatten()).await;
        count
    }

    /// None when the job was already terminal; otherwise the cleanup task, if any
    async fn cancel_entry(&self, entry: &JobEntry) -> Option<Option<JoinHandle<()>>> {
        if !entry.transition(JobStatus::Cancelled).await {
            tracing::debug!(job_id = %entry.id, "Cancel ignored; job already finished");
            return None;
        }

        entry.cancel_tx.send_replace(true);
        crate::metrics::record_job_finished(JobStatus::Cancelled);
        tracing::info!(job_id = %entry.id, "Job cancelled");

        let control = entry.detach_control().await;
        Some(control.map(|control| {
            control.request_stop();
            tokio::spawn(control.finish_cancel())
        }))
    }

    /// Drop terminal jobs that a client has seen and that are older than `retention`
    pub async fn reap(&self, retention: Duration) -> usize {
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let now = chrono::Utc::now();

        let mut reaped = 0;
        for entry in entries {
            let job = entry.snapshot().await;
            let aged = job.completed_at.is_some_and(|at| {
                (now - at).to_std().is_ok_and(|age| age >= retention)
            });
            if job.status.is_terminal() && job.observed && aged {
                self.jobs.remove(&job.id);
                reaped += 1;
                tracing::debug!(job_id = %job.id, status = %job.status, "Job reaped");
            }
        }

        if reaped > 0 {
            crate::metrics::update_tracked_jobs(self.jobs.len());
        }
        reaped
    }

    /// Jobs not yet terminal; does not mark anything observed
    pub async fn active_count(&self) -> usize {
        let entries: Vec<Arc<JobEntry>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut active = 0;
        for entry in entries {
            if !entry.job.read().await.status.is_terminal() {
                active += 1;
            }
        }
        active
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::CleanupPlan;
    use std::sync::atomic::AtomicBool;

    fn registry_with_job(status: JobStatus) -> (JobRegistry, Arc<JobEntry>) {
        let registry = JobRegistry::new();
        let entry = registry.create("sdxl-base", "SDXL", 100, ProgressMode::Estimated, status);
        (registry, entry)
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.cancel("missing").await.unwrap_err();
        assert!(matches!(err, ManagerError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_live_job() {
        let (registry, entry) = registry_with_job(JobStatus::Pending);
        entry.transition(JobStatus::Downloading).await;
        let mut token = entry.cancel_token();

        assert!(registry.cancel(entry.id()).await.unwrap());
        assert_eq!(registry.get(entry.id()).await.unwrap().status, JobStatus::Cancelled);
        assert!(token.has_changed().unwrap());
        assert!(*token.borrow_and_update());

        // Idempotent
        assert!(!registry.cancel(entry.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let (registry, entry) = registry_with_job(JobStatus::Verifying);
        entry.complete(100).await;
        assert!(!registry.cancel(entry.id()).await.unwrap());
        assert_eq!(registry.get(entry.id()).await.unwrap().status, JobStatus::Completed);

        let (registry, entry) = registry_with_job(JobStatus::Downloading);
        entry.fail(FailureKind::Transfer, "boom".to_string()).await;
        assert!(!registry.cancel(entry.id()).await.unwrap());
        assert_eq!(registry.get(entry.id()).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_runs_cleanup_plan() {
        let temp = tempfile::tempdir().unwrap();
        let partial = temp.path().join("w.safetensors.incomplete");
        std::fs::write(&partial, b"x").unwrap();

        let (registry, entry) = registry_with_job(JobStatus::Downloading);
        let control = TransferControl::new(
            None,
            Arc::new(AtomicBool::new(true)),
            CleanupPlan {
                roots: vec![temp.path().to_path_buf()],
                files: Vec::new(),
            },
            Duration::ZERO,
        );
        assert!(entry.attach_control(control).await.is_none());

        assert_eq!(registry.cancel_all().await, 1);
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_attach_after_cancel_hands_control_back() {
        let (registry, entry) = registry_with_job(JobStatus::Downloading);
        registry.cancel(entry.id()).await.unwrap();

        let control = TransferControl::new(
            None,
            Arc::new(AtomicBool::new(false)),
            CleanupPlan::default(),
            Duration::ZERO,
        );
        assert!(entry.attach_control(control).await.is_some());
    }

    #[tokio::test]
    async fn test_reap_requires_observation() {
        let (registry, entry) = registry_with_job(JobStatus::Downloading);
        entry.fail(FailureKind::Transfer, "boom".to_string()).await;

        // Terminal and aged, but no client has seen it
        assert_eq!(registry.reap(Duration::ZERO).await, 0);
        assert_eq!(registry.len(), 1);

        registry.get(entry.id()).await.unwrap();
        assert_eq!(registry.reap(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.reap(Duration::ZERO).await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reap_keeps_live_jobs() {
        let (registry, entry) = registry_with_job(JobStatus::Downloading);
        registry.get(entry.id()).await.unwrap();
        assert_eq!(registry.reap(Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn test_list_sorted_and_independent() {
        let registry = JobRegistry::new();
        let first = registry.create("a", "A", 1, ProgressMode::Reported, JobStatus::Pending);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.create("b", "B", 1, ProgressMode::Reported, JobStatus::Pending);

        // Holding one job's write lock does not block reads of another
        let _guard = first.job.write().await;
        assert_eq!(registry.get(second.id()).await.unwrap().model_id, "b");
        drop(_guard);

        let ids: Vec<_> = registry.list().await.into_iter().map(|j| j.model_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_verifying_job_wakes_waiters() {
        let (registry, entry) = registry_with_job(JobStatus::Verifying);

        let waiter = tokio::spawn({
            let entry = entry.clone();
            async move { entry.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(registry.cancel(entry.id()).await.unwrap());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already cancelled: resolves at once
        tokio::time::timeout(Duration::from_millis(100), entry.cancelled())
            .await
            .unwrap();
        assert_eq!(entry.snapshot().await.status, JobStatus::Cancelled);
    }
}
