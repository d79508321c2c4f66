//! Local upload promotion
//!
//! Moves a file that already arrived on this host into the models directory.
//! There is no transfer to poll: the job is created in `verifying` and the
//! whole operation completes within the request.

use super::target_dir;
use crate::catalog::ModelType;
use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::installed::model::{InstallSource, InstalledModel, ModelFile};
use crate::installed::scan::is_model_file;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Metadata for a file being promoted into the models directory
#[derive(Debug, Clone, Deserialize)]
pub struct LocalUpload {
    pub source_path: PathBuf,
    /// Defaults to a slug of the file stem
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub family: String,
    pub model_type: ModelType,
    #[serde(default)]
    pub is_default: bool,
}

impl LocalUpload {
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| {
                slugify(
                    &self
                        .source_path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default(),
                )
            })
    }

    fn validate(&self) -> ManagerResult<()> {
        if self.name.trim().is_empty() {
            return Err(ManagerError::validation("Model name is required"));
        }
        if !is_safe_component(&self.family) {
            return Err(ManagerError::validation(format!("Invalid family '{}'", self.family)));
        }
        if !is_safe_component(&self.resolved_id()) {
            return Err(ManagerError::validation("A valid model id is required"));
        }
        if !self.source_path.is_file() {
            return Err(ManagerError::validation(format!(
                "Uploaded file not found: {}",
                self.source_path.display()
            )));
        }
        if !is_model_file(&self.source_path) {
            return Err(ManagerError::validation(format!(
                "Unsupported model file type: {}",
                self.source_path.display()
            )));
        }
        Ok(())
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

/// Lowercase, alphanumerics kept, everything else collapsed to `-`
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Move a received file into `<models_dir>/<family>/<id>/` and describe it
pub async fn promote_local_file(
    config: &ManagerConfig,
    upload: &LocalUpload,
) -> ManagerResult<InstalledModel> {
    upload.validate()?;

    let id = upload.resolved_id();
    let target = target_dir(config, &upload.family, &id);
    tokio::fs::create_dir_all(&target)
        .await
        .with_context(|| format!("Failed to create target directory: {:?}", target))?;

    let filename = upload
        .source_path
        .file_name()
        .ok_or_else(|| ManagerError::validation("Uploaded file has no name"))?;
    let dest = target.join(filename);
    if dest.exists() {
        return Err(ManagerError::validation(format!(
            "A file named {} is already installed for '{}'",
            dest.display(),
            id
        )));
    }

    move_file(&upload.source_path, &dest).await?;
    let file = ModelFile::from_path(&dest)
        .with_context(|| format!("Failed to read promoted file: {:?}", dest))?;

    tracing::info!(model = %id, path = ?dest, size_bytes = file.size_bytes, "Local model promoted");

    Ok(InstalledModel {
        source_locator: format!("local:{}", id),
        id,
        name: upload.name.clone(),
        family: upload.family.clone(),
        model_type: upload.model_type,
        source: InstallSource::Local,
        installed_at: chrono::Utc::now(),
        size_bytes: file.size_bytes,
        files: vec![file],
        is_default: upload.is_default,
    })
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, "Rename failed, copying instead");
            tokio::fs::copy(from, to)
                .await
                .with_context(|| format!("Failed to copy {:?} to {:?}", from, to))?;
            tokio::fs::remove_file(from)
                .await
                .with_context(|| format!("Failed to remove source file {:?}", from))?;
            Ok(())
        }
    }
}
