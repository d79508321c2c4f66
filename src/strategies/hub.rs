//! Hub repository strategy
//!
//! The accelerated hub transfer exposes no progress feed, so progress is
//! estimated from the cache and staging directories. Registration waits a
//! short settle delay for the snapshot and symlink layout to stabilize, then
//! harvests whatever model files landed in the target directory.

use super::{DownloadRequest, Strategy, StrategyContext, Transfer, target_dir};
use crate::catalog::{SourceKind, SourceLocator};
use crate::installed::cache::repo_cache_dir;
use crate::installed::{InstalledModel, scan_directory};
use crate::jobs::ProgressMode;
use crate::progress::EstimatedProgress;
use crate::supervisor::{CleanupPlan, LaunchSpec, TransferDescriptor, TransferOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

pub struct HubStrategy;

fn hub_source(request: &DownloadRequest) -> Result<(&str, &[String])> {
    match &request.definition.source {
        SourceLocator::Hub { repo_id, files } => Ok((repo_id.as_str(), files.as_slice())),
        other => anyhow::bail!("Hub strategy cannot fetch a {} source", other.kind()),
    }
}

#[async_trait]
impl Strategy for HubStrategy {
    fn progress_mode(&self) -> ProgressMode {
        ProgressMode::Estimated
    }

    async fn begin(
        &self,
        ctx: &StrategyContext,
        job_id: &str,
        request: &DownloadRequest,
    ) -> Result<Transfer> {
        let (repo_id, files) = hub_source(request)?;
        let definition = &request.definition;
        let target = target_dir(&ctx.config, &definition.family, &definition.id);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create target directory: {:?}", target))?;

        let cache_repo_dirs: Vec<_> = ctx
            .config
            .scanned_cache_dirs()
            .iter()
            .map(|dir| repo_cache_dir(dir, repo_id))
            .collect();

        let descriptor = TransferDescriptor {
            source: Some(SourceKind::Hub),
            repo_id: Some(repo_id.to_string()),
            files: (!files.is_empty()).then(|| files.to_vec()),
            target_dir: target.clone(),
            credential: request.credential.clone(),
            accelerated: true,
            ..Default::default()
        };

        let running = ctx
            .launcher
            .launch(LaunchSpec {
                job_id: job_id.to_string(),
                descriptor,
                // The shared cache repo may hold other writers' partials; only
                // the target (including its `.cache/huggingface` staging) is ours
                cleanup: CleanupPlan {
                    roots: vec![target.clone()],
                    files: Vec::new(),
                },
            })
            .await?;

        let progress = EstimatedProgress::new(
            cache_repo_dirs,
            target.clone(),
            files.to_vec(),
            definition.expected_size,
            Duration::from_secs(ctx.config.recent_write_window_secs),
        );

        Ok(Transfer {
            progress: Box::new(progress),
            control: running.control,
            completion: running.completion,
            target_dir: target,
        })
    }

    async fn finalize(
        &self,
        ctx: &StrategyContext,
        request: &DownloadRequest,
        target_dir: &Path,
        _outcome: &TransferOutcome,
    ) -> Result<InstalledModel> {
        let (_, expected) = hub_source(request)?;

        tokio::time::sleep(ctx.config.settle_delay()).await;

        let dir = target_dir.to_path_buf();
        let min_bytes = ctx.config.min_model_file_bytes;
        let files = tokio::task::spawn_blocking(move || scan_directory(&dir, true, min_bytes))
            .await
            .context("Directory scan task failed")?;

        if files.is_empty() {
            anyhow::bail!("No model files found in {:?} after transfer", target_dir);
        }
        if let Some(missing) = expected
            .iter()
            .find(|name| !files.iter().any(|f| f.path.ends_with(name.as_str())))
        {
            anyhow::bail!("Expected file '{}' is missing after transfer", missing);
        }

        tracing::info!(
            model = %request.definition.id,
            files = files.len(),
            "Hub transfer verified"
        );
        Ok(InstalledModel::from_definition(&request.definition, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ManagerConfig;
    use crate::installed::InstallSource;
    use crate::installed::fixtures::sized_file;
    use crate::supervisor::mocks::MockLauncher;
    use std::sync::Arc;

    fn context(temp: &Path, launcher: Arc<MockLauncher>) -> StrategyContext {
        let config = ManagerConfig {
            models_dir: temp.join("models"),
            hf_home: Some(temp.join("hf")),
            settle_delay_ms: 0,
            min_model_file_bytes: 1024,
            ..Default::default()
        };
        StrategyContext {
            config: Arc::new(config),
            launcher,
        }
    }

    fn request(id: &str) -> DownloadRequest {
        DownloadRequest {
            definition: Catalog::builtin().get(id).unwrap().clone(),
            credential: Some("hf_token".to_string()),
        }
    }

    #[tokio::test]
    async fn test_begin_launches_accelerated_transfer() {
        let temp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = context(temp.path(), launcher.clone());

        let transfer = HubStrategy
            .begin(&ctx, "job-1", &request("flux1-dev"))
            .await
            .unwrap();

        assert_eq!(transfer.target_dir, temp.path().join("models/flux/flux1-dev"));
        assert!(transfer.target_dir.is_dir());
        assert_eq!(transfer.progress.mode(), ProgressMode::Estimated);

        let spec = &launcher.launched().await[0];
        assert!(spec.descriptor.accelerated);
        assert_eq!(spec.descriptor.repo_id.as_deref(), Some("black-forest-labs/FLUX.1-dev"));
        assert_eq!(spec.descriptor.files.as_ref().unwrap().len(), 2);
        assert_eq!(spec.descriptor.credential.as_deref(), Some("hf_token"));
        assert_eq!(spec.cleanup.roots, vec![temp.path().join("models/flux/flux1-dev")]);
    }

    #[tokio::test]
    async fn test_cancel_cleanup_spares_shared_cache_partials() {
        let temp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = context(temp.path(), launcher.clone());
        let shared_partial = temp
            .path()
            .join("hf/hub/models--black-forest-labs--FLUX.1-dev/blobs/abc123.incomplete");
        let staged_partial = temp
            .path()
            .join("models/flux/flux1-dev/.cache/huggingface/download/ae.safetensors.incomplete");
        sized_file(&shared_partial, 10);
        sized_file(&staged_partial, 10);

        HubStrategy
            .begin(&ctx, "job-1", &request("flux1-dev"))
            .await
            .unwrap();
        let removed = launcher.launched().await[0].cleanup.execute();

        assert_eq!(removed, 1);
        assert!(shared_partial.exists());
        assert!(!staged_partial.exists());
    }

    #[tokio::test]
    async fn test_whole_repo_omits_file_list() {
        let temp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = context(temp.path(), launcher.clone());

        HubStrategy
            .begin(&ctx, "job-1", &request("wan2.1-t2v-1.3b"))
            .await
            .unwrap();
        assert!(launcher.launched().await[0].descriptor.files.is_none());
    }

    #[tokio::test]
    async fn test_finalize_scans_target() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), Arc::new(MockLauncher::new()));
        let target = temp.path().join("models/sdxl/sdxl-vae-fp16-fix");
        sized_file(&target.join("sdxl_vae.safetensors"), 4096);
        sized_file(&target.join("config.json"), 200);

        let model = HubStrategy
            .finalize(
                &ctx,
                &request("sdxl-vae-fp16-fix"),
                &target,
                &TransferOutcome::default(),
            )
            .await
            .unwrap();
        assert_eq!(model.files.len(), 1);
        assert_eq!(model.source, InstallSource::Hub);
        assert_eq!(model.source_locator, "hub:madebyollin/sdxl-vae-fp16-fix");
    }

    #[tokio::test]
    async fn test_finalize_requires_expected_files() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), Arc::new(MockLauncher::new()));
        let target = temp.path().join("models/flux/flux1-dev");
        sized_file(&target.join("flux1-dev.safetensors"), 4096);

        let err = HubStrategy
            .finalize(&ctx, &request("flux1-dev"), &target, &TransferOutcome::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ae.safetensors"));
    }
}
