//! Installed model records

use crate::catalog::{ModelDefinition, ModelType, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How an installed model arrived on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    Hub,
    Marketplace,
    DirectUrl,
    Local,
    /// Discovered in a shared hub cache; never registered by this service
    HubCache,
}

impl InstallSource {
    /// Source kind used when filtering listings
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Hub | Self::HubCache => SourceKind::Hub,
            Self::Marketplace => SourceKind::Marketplace,
            Self::DirectUrl => SourceKind::DirectUrl,
            Self::Local => SourceKind::Local,
        }
    }
}

impl From<SourceKind> for InstallSource {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Hub => Self::Hub,
            SourceKind::Marketplace => Self::Marketplace,
            SourceKind::DirectUrl => Self::DirectUrl,
            SourceKind::Local => Self::Local,
        }
    }
}

/// A single weight file belonging to an installed model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub filename: String,
    /// Absolute path on disk
    pub path: PathBuf,
    pub size_bytes: u64,
    /// File format derived from the extension ("safetensors", "gguf", ...)
    pub format: String,
}

impl ModelFile {
    /// Build a record for an existing file, reading its size from disk
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::with_size(path, metadata.len()))
    }

    pub(crate) fn with_size(path: &Path, size_bytes: u64) -> Self {
        Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            size_bytes,
            format: file_format(path),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Lowercased extension, or "unknown"
pub fn file_format(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Durable (or cache-synthesized) record of an installed model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledModel {
    pub id: String,
    pub name: String,
    pub family: String,
    pub model_type: ModelType,
    pub source: InstallSource,
    /// Canonical locator key; the deduplication key across sources
    pub source_locator: String,
    pub installed_at: DateTime<Utc>,
    pub files: Vec<ModelFile>,
    pub size_bytes: u64,
    #[serde(default)]
    pub is_default: bool,
}

impl InstalledModel {
    /// Record for a catalog model installed by one of the transfer strategies
    pub fn from_definition(definition: &ModelDefinition, files: Vec<ModelFile>) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            family: definition.family.clone(),
            model_type: definition.model_type,
            source: definition.source.kind().into(),
            source_locator: definition.source.key(),
            installed_at: Utc::now(),
            size_bytes: files.iter().map(|f| f.size_bytes).sum(),
            files,
            is_default: false,
        }
    }

    /// True when the record has files and every one of them is on disk
    pub fn files_present(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(ModelFile::exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn test_file_format() {
        assert_eq!(file_format(Path::new("/m/model.SafeTensors")), "safetensors");
        assert_eq!(file_format(Path::new("/m/README")), "unknown");
    }

    #[test]
    fn test_from_definition_sums_sizes() {
        let catalog = Catalog::builtin();
        let def = catalog.get("flux1-dev").unwrap();
        let files = vec![
            ModelFile::with_size(Path::new("/m/flux1-dev.safetensors"), 100),
            ModelFile::with_size(Path::new("/m/ae.safetensors"), 20),
        ];
        let model = InstalledModel::from_definition(def, files);
        assert_eq!(model.size_bytes, 120);
        assert_eq!(model.source, InstallSource::Hub);
        assert_eq!(model.source_locator, "hub:black-forest-labs/flux.1-dev");
        assert!(!model.files_present());
    }

    #[test]
    fn test_files_present_requires_files() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.gguf");
        std::fs::write(&path, b"weights").unwrap();

        let catalog = Catalog::builtin();
        let def = catalog.get("sdxl-base").unwrap();

        let empty = InstalledModel::from_definition(def, Vec::new());
        assert!(!empty.files_present());

        let present = InstalledModel::from_definition(def, vec![ModelFile::from_path(&path).unwrap()]);
        assert!(present.files_present());
        assert_eq!(present.files[0].format, "gguf");
        assert_eq!(present.size_bytes, 7);
    }
}
