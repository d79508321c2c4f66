//! Community marketplace strategy

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

pub struct MarketplaceStrategy;

/// Resolved marketplace model and version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarketplaceTarget {
    pub model_id: Option<u64>,
    pub version_id: Option<u64>,
}

/// Resolve ids from explicit values, falling back to the URL
///
/// Explicit ids win over ids parsed from the URL.
pub fn resolve_target(
    model_id: Option<u64>,
    version_id: Option<u64>,
    url: Option<&str>,
) -> Result<MarketplaceTarget> {
    let parsed = url.map(parse_marketplace_url).unwrap_or_default();
    let target = MarketplaceTarget {
        model_id: model_id.or(parsed.model_id),
        version_id: version_id.or(parsed.version_id),
    };
    if target.model_id.is_none() && target.version_id.is_none() {
        anyhow::bail!(
            "Could not determine a marketplace model or version id from {:?}",
            url.unwrap_or("<no url>")
        );
    }
    Ok(target)
}

/// Parse `/models/<id>[/slug][?modelVersionId=<v>]` and `/api/download/models/<v>`
pub fn parse_marketplace_url(url: &str) -> MarketplaceTarget {
    let without_fragment = url.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };
    let path = path
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or_default())
        .unwrap_or(path);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut target = MarketplaceTarget::default();

    match segments.as_slice() {
        ["api", "download", "models", version, ..] => {
            target.version_id = version.parse().ok();
        }
        ["models", model, ..] => {
            target.model_id = model.parse().ok();
        }
        _ => {}
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(("modelVersionId", value)) = pair.split_once('=') {
                target.version_id = target.version_id.or(value.parse().ok());
            }
        }
    }

    target
}

#[async_trait]
impl Strategy for MarketplaceStrategy {
    fn progress_mode(&self) -> ProgressMode {
        ProgressMode::Reported
    }

    async fn begin(
        &self,
        ctx: &StrategyContext,
        job_id: &str,
        request: &DownloadRequest,
    ) -> Result<Transfer> {
        let SourceLocator::Marketplace {
            model_id,
            version_id,
            url,
        } = &request.definition.source
        else {
            anyhow::bail!(
                "Marketplace strategy cannot fetch a {} source",
                request.definition.source.kind()
            );
        };
        let resolved = resolve_target(*model_id, *version_id, url.as_deref())?;

        let definition = &request.definition;
        let target = target_dir(&ctx.config, &definition.family, &definition.id);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create target directory: {:?}", target))?;
        let progress_path = progress_file(&ctx.config, job_id);

        tracing::debug!(
            model = %definition.id,
            marketplace_model = ?resolved.model_id,
            marketplace_version = ?resolved.version_id,
            "Resolved marketplace target"
        );

        let descriptor = TransferDescriptor {
            source: Some(SourceKind::Marketplace),
            model_id: resolved.model_id,
            version_id: resolved.version_id,
            url: url.clone(),
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
        single_file_result(&request.definition, target_dir, None, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_page_url() {
        assert_eq!(
            parse_marketplace_url("https://civitai.com/models/4201/realistic-vision-v60-b1"),
            MarketplaceTarget {
                model_id: Some(4201),
                version_id: None
            }
        );
    }

    #[test]
    fn test_parse_model_page_with_version() {
        assert_eq!(
            parse_marketplace_url("https://civitai.com/models/4201?modelVersionId=245598#reviews"),
            MarketplaceTarget {
                model_id: Some(4201),
                version_id: Some(245598)
            }
        );
    }

    #[test]
    fn test_parse_download_url() {
        assert_eq!(
            parse_marketplace_url("https://civitai.com/api/download/models/245598?type=Model"),
            MarketplaceTarget {
                model_id: None,
                version_id: Some(245598)
            }
        );
    }

    #[test]
    fn test_parse_unrelated_url() {
        assert_eq!(
            parse_marketplace_url("https://example.com/files/x.safetensors"),
            MarketplaceTarget::default()
        );
    }

    #[test]
    fn test_explicit_ids_win() {
        let target = resolve_target(
            Some(1),
            None,
            Some("https://civitai.com/models/4201?modelVersionId=9"),
        )
        .unwrap();
        assert_eq!(target.model_id, Some(1));
        assert_eq!(target.version_id, Some(9));
    }

    #[test]
    fn test_unresolvable_is_error() {
        assert!(resolve_target(None, None, Some("https://example.com/nothing")).is_err());
        assert!(resolve_target(None, None, None).is_err());
    }
}
