//! Model manager: the operation surface behind the HTTP API
//!
//! Validates requests synchronously, then runs each download as its own task:
//! begin the transfer, poll progress, wait for the process, verify and
//! register the result.

use crate::catalog::{Catalog, ModelDefinition, ModelFilter, SourceKind};
use crate::config::ManagerConfig;
use crate::error::{FailureKind, ManagerError, ManagerResult};
use crate::installed::cache::stored_token;
use crate::installed::{
    InstallSource, InstalledModel, InstalledRegistry, InstalledStore, scan_directory,
};
use crate::jobs::{DownloadJob, JobEntry, JobRegistry, JobStatus, ProgressMode};
use crate::progress::run_estimator;
use crate::strategies::{
    DownloadRequest, LocalUpload, Strategy, StrategyContext, Transfer, progress_file,
    promote_local_file, strategy_for,
};
use crate::supervisor::{ProcessLauncher, TransferLauncher};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result of promoting a local upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub job_id: String,
    pub model: InstalledModel,
}

pub struct ModelManager {
    config: Arc<ManagerConfig>,
    catalog: Arc<Catalog>,
    jobs: Arc<JobRegistry>,
    installed: Arc<InstalledRegistry>,
    ctx: Arc<StrategyContext>,
}

impl ModelManager {
    /// Create a manager with a custom transfer launcher
    pub fn new(
        config: Arc<ManagerConfig>,
        catalog: Arc<Catalog>,
        launcher: Arc<dyn TransferLauncher>,
    ) -> Self {
        let installed = Arc::new(InstalledRegistry::new(
            InstalledStore::new(config.installed_db.clone()),
            catalog.clone(),
            config.scanned_cache_dirs(),
            config.min_model_file_bytes,
        ));

        Self {
            ctx: Arc::new(StrategyContext {
                config: config.clone(),
                launcher,
            }),
            config,
            catalog,
            jobs: Arc::new(JobRegistry::new()),
            installed,
        }
    }

    /// Production wiring: catalog extension file and process launcher
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        let catalog = Catalog::load(config.catalog_file.as_deref())?;
        let launcher = Arc::new(ProcessLauncher::new(
            config.transfer_program.clone(),
            config.transfer_args.clone(),
            config.hf_home.clone(),
            config.cancel_grace(),
        ));

        tracing::info!(
            catalog_models = catalog.len(),
            models_dir = ?config.models_dir,
            transfer_program = %config.transfer_program,
            "Model manager initialized"
        );

        Ok(Self::new(Arc::new(config), Arc::new(catalog), launcher))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn jobs(&self) -> Arc<JobRegistry> {
        self.jobs.clone()
    }

    pub fn installed(&self) -> Arc<InstalledRegistry> {
        self.installed.clone()
    }

    pub fn list_catalog(&self, filter: &ModelFilter) -> Vec<ModelDefinition> {
        self.catalog.list(filter)
    }

    /// Validate and start a download; returns the new job id at once
    pub async fn start_download(
        &self,
        model_id: &str,
        credential: Option<String>,
    ) -> ManagerResult<String> {
        let definition = self
            .catalog
            .get(model_id)
            .ok_or_else(|| ManagerError::UnknownModel {
                id: model_id.to_string(),
            })?
            .clone();

        let kind = definition.source.kind();
        let strategy = strategy_for(kind).ok_or_else(|| {
            ManagerError::validation(format!(
                "Model '{}' is installed by upload, not download",
                model_id
            ))
        })?;

        let credential = credential
            .filter(|c| !c.trim().is_empty())
            .or_else(|| match kind {
                SourceKind::Hub => stored_token(&self.config.hub_cache_dir()),
                _ => None,
            });
        if definition.requires_credential && credential.is_none() {
            return Err(ManagerError::MissingCredential {
                id: model_id.to_string(),
            });
        }

        let entry = self.jobs.create(
            &definition.id,
            &definition.name,
            definition.expected_size,
            strategy.progress_mode(),
            JobStatus::Pending,
        );
        let job_id = entry.id().to_string();
        crate::metrics::record_job_started(&definition.id, &kind.to_string());

        let request = DownloadRequest {
            definition,
            credential,
        };
        tokio::spawn(execute_job(
            self.ctx.clone(),
            self.installed.clone(),
            entry,
            strategy,
            request,
        ));

        Ok(job_id)
    }

    pub async fn get_job(&self, id: &str) -> ManagerResult<DownloadJob> {
        self.jobs
            .get(id)
            .await
            .ok_or_else(|| ManagerError::JobNotFound { id: id.to_string() })
    }

    pub async fn list_jobs(&self) -> Vec<DownloadJob> {
        self.jobs.list().await
    }

    pub async fn cancel_job(&self, id: &str) -> ManagerResult<bool> {
        self.jobs.cancel(id).await
    }

    pub async fn list_installed(&self, filter: &ModelFilter) -> Vec<InstalledModel> {
        self.installed.list(filter).await
    }

    pub async fn is_installed(&self, id: &str) -> bool {
        self.installed.is_installed(id).await
    }

    pub async fn remove_installed(&self, id: &str) -> ManagerResult<InstalledModel> {
        let removed = self.installed.remove(id).await?;
        crate::metrics::record_model_removed(id);
        Ok(removed)
    }

    /// Promote an uploaded file synchronously
    pub async fn upload_local(&self, upload: LocalUpload) -> ManagerResult<UploadResult> {
        let size = tokio::fs::metadata(&upload.source_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let entry = self.jobs.create(
            &upload.resolved_id(),
            &upload.name,
            size,
            ProgressMode::Reported,
            JobStatus::Verifying,
        );
        crate::metrics::record_job_started(&upload.resolved_id(), "local");

        let result = match promote_local_file(&self.config, &upload).await {
            Ok(model) => self.installed.add(model).await,
            Err(e) => Err(e),
        };

        // The response carries the terminal state, so the job counts as observed
        match result {
            Ok(model) => {
                entry
                    .update(|job| {
                        job.complete(model.size_bytes);
                        job.observed = true;
                    })
                    .await;
                crate::metrics::record_job_finished(JobStatus::Completed);
                Ok(UploadResult {
                    job_id: entry.id().to_string(),
                    model,
                })
            }
            Err(e) => {
                entry
                    .update(|job| {
                        job.fail(FailureKind::Verification, e.to_string());
                        job.observed = true;
                    })
                    .await;
                crate::metrics::record_job_finished(JobStatus::Failed);
                Err(e)
            }
        }
    }

    /// Cancel every live job and wait for partial files to be removed
    pub async fn shutdown(&self) {
        let cancelled = self.jobs.cancel_all().await;
        tracing::info!(cancelled = cancelled, "Live jobs cancelled for shutdown");
    }
}

/// Drive one download job to a terminal state
async fn execute_job(
    ctx: Arc<StrategyContext>,
    installed: Arc<InstalledRegistry>,
    entry: Arc<JobEntry>,
    strategy: Arc<dyn Strategy>,
    request: DownloadRequest,
) {
    let job_id = entry.id().to_string();
    if !entry.transition(JobStatus::Downloading).await {
        tracing::debug!(job_id = %job_id, "Job cancelled before start");
        return;
    }

    let Transfer {
        progress,
        control,
        completion,
        target_dir,
    } = match strategy.begin(&ctx, &job_id, &request).await {
        Ok(transfer) => transfer,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to start transfer");
            fail_job(&entry, FailureKind::Transfer, &format!("{:#}", e)).await;
            return;
        }
    };

    if let Some(control) = entry.attach_control(control).await {
        // Cancelled while the transfer was starting
        control.request_stop();
        control.finish_cancel().await;
        discard_output(&installed, &request.definition.id, &target_dir).await;
        return;
    }

    let estimator = tokio::spawn(run_estimator(
        entry.clone(),
        progress,
        ctx.config.poll_interval(),
        Duration::from_secs(ctx.config.stall_threshold_secs),
    ));

    let outcome = completion.wait().await;
    entry.detach_control().await;

    if entry.is_cancel_requested() {
        estimator.abort();
        discard_output(&installed, &request.definition.id, &target_dir).await;
        remove_progress_file(&ctx, &job_id).await;
        return;
    }

    if !outcome.succeeded() {
        let kind = FailureKind::classify(&outcome.diagnostics());
        tracing::warn!(
            job_id = %job_id,
            exit_code = ?outcome.exit_code,
            kind = kind.as_str(),
            "Transfer failed"
        );
        fail_job(&entry, kind, &outcome.failure_detail()).await;
        estimator.abort();
        remove_progress_file(&ctx, &job_id).await;
        return;
    }

    if !entry.transition(JobStatus::Verifying).await {
        estimator.abort();
        discard_output(&installed, &request.definition.id, &target_dir).await;
        remove_progress_file(&ctx, &job_id).await;
        return;
    }
    let _ = estimator.await;

    let finalized = tokio::select! {
        result = strategy.finalize(&ctx, &request, &target_dir, &outcome) => Some(result),
        _ = entry.cancelled() => None,
    };
    let finalized = match finalized {
        Some(result) if !entry.is_cancel_requested() => result,
        _ => {
            tracing::info!(job_id = %job_id, "Job cancelled during verification");
            discard_output(&installed, &request.definition.id, &target_dir).await;
            remove_progress_file(&ctx, &job_id).await;
            return;
        }
    };

    let registered = match finalized {
        Ok(model) => installed.add(model).await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };

    match registered {
        Ok(model) => {
            if entry.complete(model.size_bytes).await {
                crate::metrics::record_job_finished(JobStatus::Completed);
                tracing::info!(
                    job_id = %job_id,
                    model = %model.id,
                    size_bytes = model.size_bytes,
                    "Download completed"
                );
            } else {
                // Cancelled between registration and completion
                tracing::info!(job_id = %job_id, model = %model.id, "Rolling back cancelled install");
                if let Err(e) = installed.remove(&model.id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to roll back cancelled install");
                }
            }
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Verification failed");
            fail_job(&entry, FailureKind::Verification, &format!("{:#}", e)).await;
        }
    }

    remove_progress_file(&ctx, &job_id).await;
}

/// Delete what a cancelled transfer left in its target directory
///
/// Files belonging to an earlier install of the same model are kept.
async fn discard_output(installed: &InstalledRegistry, model_id: &str, target_dir: &Path) {
    let kept: Vec<PathBuf> = match installed.get(model_id).await {
        Some(model) if model.source != InstallSource::HubCache => {
            model.files.into_iter().map(|f| f.path).collect()
        }
        _ => Vec::new(),
    };

    if kept.is_empty() {
        match tokio::fs::remove_dir_all(target_dir).await {
            Ok(()) => tracing::debug!(path = ?target_dir, "Removed cancelled transfer output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = ?target_dir, error = %e, "Failed to remove cancelled transfer output"),
        }
        return;
    }

    let dir = target_dir.to_path_buf();
    let stray: Vec<PathBuf> = tokio::task::spawn_blocking(move || scan_directory(&dir, true, 0))
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|f| f.path)
        .filter(|p| !kept.contains(p))
        .collect();
    for path in stray {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = ?path, error = %e, "Failed to remove cancelled transfer file");
        }
    }
}

async fn fail_job(entry: &JobEntry, kind: FailureKind, detail: &str) {
    if entry.fail(kind, kind.user_message(detail)).await {
        crate::metrics::record_job_finished(JobStatus::Failed);
        crate::metrics::record_failure(kind.as_str());
    }
}

async fn remove_progress_file(ctx: &StrategyContext, job_id: &str) {
    let path = progress_file(&ctx.config, job_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = ?path, error = %e, "Failed to remove progress file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelType;
    use crate::installed::fixtures::sized_file;
    use crate::supervisor::TransferOutcome;
    use crate::supervisor::mocks::MockLauncher;

    struct Fixture {
        temp: tempfile::TempDir,
        launcher: Arc<MockLauncher>,
        manager: ModelManager,
    }

    fn fixture() -> Fixture {
        fixture_with_settle(0)
    }

    fn fixture_with_settle(settle_delay_ms: u64) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let config = ManagerConfig {
            models_dir: temp.path().join("models"),
            installed_db: temp.path().join("models/installed_models.json"),
            progress_dir: temp.path().join("progress"),
            hf_home: Some(temp.path().join("hf")),
            poll_interval_ms: 20,
            settle_delay_ms,
            min_model_file_bytes: 1024,
            ..Default::default()
        };
        let launcher = Arc::new(MockLauncher::new());
        let manager = ModelManager::new(
            Arc::new(config),
            Arc::new(Catalog::builtin()),
            launcher.clone(),
        );
        Fixture {
            temp,
            launcher,
            manager,
        }
    }

    async fn wait_for_status(manager: &ModelManager, job_id: &str, status: JobStatus) -> DownloadJob {
        for _ in 0..200 {
            let job = manager.get_job(job_id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", job_id, status);
    }

    async fn wait_for_launch(launcher: &MockLauncher) {
        for _ in 0..200 {
            if !launcher.launched().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer never launched");
    }

    fn exited(code: i32, stderr: &str) -> TransferOutcome {
        TransferOutcome {
            exit_code: Some(code),
            stdout: String::new(),
            stderr_tail: stderr.lines().map(str::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let fx = fixture();
        let err = fx.manager.start_download("no-such-model", None).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownModel { .. }));
        assert!(fx.manager.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_gated_model_requires_credential() {
        let fx = fixture();
        let err = fx.manager.start_download("flux1-dev", None).await.unwrap_err();
        assert!(matches!(err, ManagerError::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn test_stored_hub_token_satisfies_credential() {
        let fx = fixture();
        std::fs::create_dir_all(fx.temp.path().join("hf")).unwrap();
        std::fs::write(fx.temp.path().join("hf/token"), "hf_stored\n").unwrap();

        fx.manager.start_download("flux1-dev", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;
        let spec = &fx.launcher.launched().await[0];
        assert_eq!(spec.descriptor.credential.as_deref(), Some("hf_stored"));
    }

    #[tokio::test]
    async fn test_hub_download_completes_and_registers() {
        let fx = fixture();
        let job_id = fx.manager.start_download("sdxl-vae-fp16-fix", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;

        let target = fx.temp.path().join("models/sdxl/sdxl-vae-fp16-fix");
        sized_file(&target.join("sdxl_vae.safetensors"), 8192);
        assert!(fx.launcher.finish(&job_id, exited(0, "")).await);

        let job = wait_for_status(&fx.manager, &job_id, JobStatus::Completed).await;
        assert_eq!(job.percent, 100);
        assert!(fx.manager.is_installed("sdxl-vae-fp16-fix").await);

        // Removing it deletes the files and the record
        fx.manager.remove_installed("sdxl-vae-fp16-fix").await.unwrap();
        assert!(!target.join("sdxl_vae.safetensors").exists());
        assert!(!fx.manager.is_installed("sdxl-vae-fp16-fix").await);
    }

    #[tokio::test]
    async fn test_disk_full_failure_is_classified() {
        let fx = fixture();
        let job_id = fx.manager.start_download("4x-ultrasharp", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;

        fx.launcher
            .finish(&job_id, exited(1, "writing chunk\nOSError: [Errno 28] No space left on device"))
            .await;

        let job = wait_for_status(&fx.manager, &job_id, JobStatus::Failed).await;
        assert_eq!(job.error_kind, Some(FailureKind::DiskFull));
        assert!(job.error.unwrap().contains("disk space"));
        assert!(job.percent < 100);
    }

    #[tokio::test]
    async fn test_verification_failure_when_no_files() {
        let fx = fixture();
        let job_id = fx.manager.start_download("sdxl-base", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;
        fx.launcher.finish(&job_id, exited(0, "")).await;

        let job = wait_for_status(&fx.manager, &job_id, JobStatus::Failed).await;
        assert_eq!(job.error_kind, Some(FailureKind::Verification));
    }

    #[tokio::test]
    async fn test_launch_failure_fails_job() {
        let fx = fixture();
        fx.launcher.set_fail_launch(true);
        let job_id = fx.manager.start_download("sdxl-base", None).await.unwrap();

        let job = wait_for_status(&fx.manager, &job_id, JobStatus::Failed).await;
        assert_eq!(job.error_kind, Some(FailureKind::Transfer));
        assert!(job.error.unwrap().contains("mock launch failure"));
    }

    #[tokio::test]
    async fn test_cancel_live_download() {
        let fx = fixture();
        let job_id = fx.manager.start_download("sdxl-base", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;
        wait_for_status(&fx.manager, &job_id, JobStatus::Downloading).await;

        assert!(fx.manager.cancel_job(&job_id).await.unwrap());
        assert_eq!(
            fx.manager.get_job(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );

        // The process exiting afterwards does not revive the job
        fx.launcher.finish(&job_id, exited(0, "")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.manager.get_job(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!fx.manager.cancel_job(&job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.cancel_job("nope").await,
            Err(ManagerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_local_completes_immediately() {
        let fx = fixture();
        let source = fx.temp.path().join("upload.safetensors");
        sized_file(&source, 4096);

        let result = fx
            .manager
            .upload_local(LocalUpload {
                source_path: source,
                id: Some("my-lora".to_string()),
                name: "My LoRA".to_string(),
                family: "sdxl".to_string(),
                model_type: ModelType::Lora,
                is_default: true,
            })
            .await
            .unwrap();

        let job = fx.manager.get_job(&result.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(result.model.is_default);
        assert!(fx.manager.is_installed("my-lora").await);
        assert!(Path::new(&result.model.files[0].path).exists());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_live_jobs() {
        let fx = fixture();
        let job_id = fx.manager.start_download("sdxl-base", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;
        wait_for_status(&fx.manager, &job_id, JobStatus::Downloading).await;

        fx.manager.shutdown().await;
        assert_eq!(
            fx.manager.get_job(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_during_verification_installs_nothing() {
        let fx = fixture_with_settle(400);
        let job_id = fx.manager.start_download("sdxl-vae-fp16-fix", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;

        let target = fx.temp.path().join("models/sdxl/sdxl-vae-fp16-fix");
        let weights = target.join("sdxl_vae.safetensors");
        sized_file(&weights, 8192);
        fx.launcher.finish(&job_id, exited(0, "")).await;
        wait_for_status(&fx.manager, &job_id, JobStatus::Verifying).await;

        assert!(fx.manager.cancel_job(&job_id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(
            fx.manager.get_job(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!fx.manager.is_installed("sdxl-vae-fp16-fix").await);
        assert!(!weights.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_verification_keeps_earlier_install() {
        let fx = fixture();
        let target = fx.temp.path().join("models/upscale/4x-ultrasharp");

        // First download installs the model
        let first = fx.manager.start_download("4x-ultrasharp", None).await.unwrap();
        wait_for_launch(&fx.launcher).await;
        sized_file(&target.join("4x-UltraSharp.pth"), 4096);
        fx.launcher.finish(&first, exited(0, "")).await;
        wait_for_status(&fx.manager, &first, JobStatus::Completed).await;

        // A second download is cancelled once its transfer has exited
        let second = fx.manager.start_download("4x-ultrasharp", None).await.unwrap();
        for _ in 0..200 {
            if fx.launcher.launched().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sized_file(&target.join("extra.safetensors"), 4096);
        assert!(fx.manager.cancel_job(&second).await.unwrap());
        fx.launcher.finish(&second, exited(0, "")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(fx.manager.is_installed("4x-ultrasharp").await);
        assert!(target.join("4x-UltraSharp.pth").exists());
        assert!(!target.join("extra.safetensors").exists());
    }

    #[tokio::test]
    async fn test_cancel_while_transfer_is_starting() {
        let fx = fixture();
        fx.launcher.set_launch_delay(Duration::from_millis(300));
        let job_id = fx.manager.start_download("sdxl-base", None).await.unwrap();
        wait_for_status(&fx.manager, &job_id, JobStatus::Downloading).await;
        assert!(fx.launcher.launched().await.is_empty());

        // Cancel lands before the launcher has handed back a control
        assert!(fx.manager.cancel_job(&job_id).await.unwrap());
        let partial = fx
            .temp
            .path()
            .join("models/sdxl/sdxl-base/sd_xl_base_1.0.safetensors.incomplete");
        sized_file(&partial, 100);

        wait_for_launch(&fx.launcher).await;
        for _ in 0..100 {
            if !partial.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!partial.exists());
        assert_eq!(
            fx.manager.get_job(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!fx.manager.is_installed("sdxl-base").await);
    }
}
