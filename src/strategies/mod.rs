//! Source strategies
//!
//! One strategy per acquisition method. A strategy starts the transfer and
//! later turns a successful transfer into an [`InstalledModel`]:
//!
//! | Source        | Progress  | Registration                          |
//! |---------------|-----------|---------------------------------------|
//! | hub           | estimated | settle delay, then directory scan     |
//! | marketplace   | reported  | single result file                    |
//! | direct URL    | reported  | single result file                    |
//! | local upload  | none      | synchronous move (see [`local`])      |

pub mod direct_url;
pub mod hub;
pub mod local;
pub mod marketplace;

use crate::catalog::{ModelDefinition, SourceKind};
use crate::config::ManagerConfig;
use crate::installed::{InstalledModel, ModelFile, scan_directory};
use crate::jobs::ProgressMode;
use crate::progress::ProgressSource;
use crate::supervisor::{TransferCompletion, TransferControl, TransferLauncher, TransferOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use direct_url::DirectUrlStrategy;
pub use hub::HubStrategy;
pub use local::{LocalUpload, promote_local_file};
pub use marketplace::MarketplaceStrategy;

/// Shared dependencies handed to every strategy
pub struct StrategyContext {
    pub config: Arc<ManagerConfig>,
    pub launcher: Arc<dyn TransferLauncher>,
}

/// A validated request to install one catalog model
#[derive(Clone)]
pub struct DownloadRequest {
    pub definition: ModelDefinition,
    pub credential: Option<String>,
}

/// A transfer in flight
pub struct Transfer {
    pub progress: Box<dyn ProgressSource>,
    pub control: TransferControl,
    pub completion: TransferCompletion,
    pub target_dir: PathBuf,
}

/// Acquisition method for one source kind
#[async_trait]
pub trait Strategy: Send + Sync {
    fn progress_mode(&self) -> ProgressMode;

    /// Start the transfer without waiting for it
    async fn begin(
        &self,
        ctx: &StrategyContext,
        job_id: &str,
        request: &DownloadRequest,
    ) -> Result<Transfer>;

    /// Build the installed record after a successful transfer
    async fn finalize(
        &self,
        ctx: &StrategyContext,
        request: &DownloadRequest,
        target_dir: &Path,
        outcome: &TransferOutcome,
    ) -> Result<InstalledModel>;
}

/// Strategy for a source kind; local uploads have no asynchronous strategy
pub fn strategy_for(kind: SourceKind) -> Option<Arc<dyn Strategy>> {
    match kind {
        SourceKind::Hub => Some(Arc::new(HubStrategy)),
        SourceKind::Marketplace => Some(Arc::new(MarketplaceStrategy)),
        SourceKind::DirectUrl => Some(Arc::new(DirectUrlStrategy)),
        SourceKind::Local => None,
    }
}

/// Install directory for a model: `<models_dir>/<family>/<id>`
pub fn target_dir(config: &ManagerConfig, family: &str, id: &str) -> PathBuf {
    config.models_dir.join(family).join(id)
}

/// Progress file path for a job
pub fn progress_file(config: &ManagerConfig, job_id: &str) -> PathBuf {
    config.progress_dir.join(format!("{}.json", job_id))
}

/// Register the single file a marketplace or URL transfer produced
///
/// Looks at the path the transfer printed, then the expected file name, then
/// the newest model file in the target directory.
pub(crate) fn single_file_result(
    definition: &ModelDefinition,
    target_dir: &Path,
    expected_name: Option<&str>,
    outcome: &TransferOutcome,
) -> Result<InstalledModel> {
    let reported = outcome
        .result()
        .and_then(|r| r.path.or_else(|| r.files.into_iter().next()))
        .filter(|p| p.is_file());

    let path = reported
        .or_else(|| {
            expected_name
                .map(|name| target_dir.join(name))
                .filter(|p| p.is_file())
        })
        .or_else(|| {
            scan_directory(target_dir, false, 0)
                .into_iter()
                .max_by_key(|f| {
                    std::fs::metadata(&f.path)
                        .and_then(|m| m.modified())
                        .ok()
                })
                .map(|f| f.path)
        })
        .with_context(|| format!("Transfer succeeded but no model file was found in {:?}", target_dir))?;

    let file = ModelFile::from_path(&path)
        .with_context(|| format!("Failed to read downloaded file: {:?}", path))?;
    if file.size_bytes == 0 {
        anyhow::bail!("Downloaded file {:?} is empty", path);
    }

    Ok(InstalledModel::from_definition(definition, vec![file]))
}
