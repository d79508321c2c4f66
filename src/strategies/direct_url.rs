//! Direct URL strategy

use super::{
    DownloadRequest, Strategy, StrategyContext, Transfer, progress_file, single_file_result,
    target_dir,
};
use crate::catalog::{SourceKind, SourceLocator};
use crate::installed::InstalledModel;
use crate::jobs::ProgressMode;
use crate::progress::ReportedProgress;
use crate::supervisor::{CleanupPlan, LaunchSpec, TransferDescriptor, TransferOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

pub struct DirectUrlStrategy;

/// File name from a URL's last path segment, query and fragment stripped
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.rsplit('/').next()?;
    let decoded = urlencoding::decode(segment).ok()?;
    let name = decoded.trim();
    // Reject names that would escape the target directory
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return None;
    }
    Some(name.to_string())
}

fn resolve_filename(url: &str, explicit: Option<&str>) -> Result<String> {
    explicit
        .map(str::to_string)
        .or_else(|| filename_from_url(url))
        .with_context(|| format!("Cannot derive a file name from URL: {}", url))
}

#[async_trait]
impl Strategy for DirectUrlStrategy {
    fn progress_mode(&self) -> ProgressMode {
        ProgressMode::Reported
    }

    async fn begin(
        &self,
        ctx: &StrategyContext,
        job_id: &str,
        request: &DownloadRequest,
    ) -> Result<Transfer> {
        let SourceLocator::DirectUrl { url, filename } = &request.definition.source else {
            anyhow::bail!(
                "Direct URL strategy cannot fetch a {} source",
                request.definition.source.kind()
            );
        };
        let filename = resolve_filename(url, filename.as_deref())?;

        let definition = &request.definition;
        let target = target_dir(&ctx.config, &definition.family, &definition.id);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create target directory: {:?}", target))?;
        let progress_path = progress_file(&ctx.config, job_id);

        let descriptor = TransferDescriptor {
            source: Some(SourceKind::DirectUrl),
            url: Some(url.clone()),
            filename: Some(filename),
            target_dir: target.clone(),
            credential: request.credential.clone(),
            progress_file: Some(progress_path.clone()),
            accelerated: false,
            ..Default::default()
        };

        let running = ctx
            .launcher
            .launch(LaunchSpec {
                job_id: job_id.to_string(),
                descriptor,
                cleanup: CleanupPlan {
                    roots: vec![target.clone()],
                    files: vec![progress_path.clone()],
                },
            })
            .await?;

        Ok(Transfer {
            progress: Box::new(ReportedProgress::new(progress_path)),
            control: running.control,
            completion: running.completion,
            target_dir: target,
        })
    }

    async fn finalize(
        &self,
        _ctx: &StrategyContext,
        request: &DownloadRequest,
        target_dir: &Path,
        outcome: &TransferOutcome,
    ) -> Result<InstalledModel> {
        let expected = match &request.definition.source {
            SourceLocator::DirectUrl { url, filename } => resolve_filename(url, filename.as_deref()).ok(),
            _ => None,
        };
        single_file_result(&request.definition, target_dir, expected.as_deref(), outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ManagerConfig;
    use crate::supervisor::mocks::MockLauncher;
    use std::sync::Arc;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/files/4x-UltraSharp.pth?download=true#top"),
            Some("4x-UltraSharp.pth".to_string())
        );
        assert_eq!(
            filename_from_url("https://example.com/a/My%20Model%20v2.safetensors"),
            Some("My Model v2.safetensors".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/files/"), None);
        assert_eq!(filename_from_url("https://example.com/x/..%2F..%2Fetc"), None);
    }

    #[tokio::test]
    async fn test_begin_writes_progress_file_path() {
        let temp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let ctx = StrategyContext {
            config: Arc::new(ManagerConfig {
                models_dir: temp.path().join("models"),
                progress_dir: temp.path().join("progress"),
                ..Default::default()
            }),
            launcher: launcher.clone(),
        };
        let request = DownloadRequest {
            definition: Catalog::builtin().get("4x-ultrasharp").unwrap().clone(),
            credential: None,
        };

        let transfer = DirectUrlStrategy.begin(&ctx, "job-7", &request).await.unwrap();
        assert_eq!(transfer.progress.mode(), ProgressMode::Reported);

        let spec = &launcher.launched().await[0];
        assert_eq!(spec.descriptor.filename.as_deref(), Some("4x-UltraSharp.pth"));
        assert_eq!(
            spec.descriptor.progress_file,
            Some(temp.path().join("progress/job-7.json"))
        );
        assert!(!spec.descriptor.accelerated);
        assert!(spec.cleanup.files.contains(&temp.path().join("progress/job-7.json")));
    }
}
