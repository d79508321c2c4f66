//! Durable installed-model database
//!
//! One JSON document holds every registered model plus the locators of
//! models removed by a user, so a stale shared cache cannot resurrect them.

use super::model::InstalledModel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
#[derive(Default)]
pub struct FileSystemStorage;

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp database file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write database file")?;
        file.sync_all()
            .await
            .context("Failed to sync database file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp database file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read database file: {:?}", path)),
        }
    }
}

/// Persisted document layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledDocument {
    pub schema_version: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub models: Vec<InstalledModel>,
    /// Locator keys of removed models; suppresses their cache-discovered copies
    #[serde(default)]
    pub removed_locators: Vec<String>,
}

impl Default for InstalledDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: chrono::Utc::now(),
            models: Vec::new(),
            removed_locators: Vec::new(),
        }
    }
}

impl InstalledDocument {
    pub fn find(&self, id: &str) -> Option<&InstalledModel> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn is_suppressed(&self, locator: &str) -> bool {
        self.removed_locators.iter().any(|l| l == locator)
    }
}

/// Reads and writes the installed-model document
///
/// Callers serialize read-modify-write cycles; the store itself only
/// guarantees that each save replaces the file atomically.
pub struct InstalledStore {
    path: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl InstalledStore {
    /// Create a store with a custom storage backend
    pub fn new_with_storage(path: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self { path, storage }
    }

    /// Create a store backed by the filesystem
    pub fn new(path: PathBuf) -> Self {
        Self::new_with_storage(path, Arc::new(FileSystemStorage))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing file is an empty document
    pub async fn load(&self) -> Result<InstalledDocument> {
        let Some(content) = self.storage.load(&self.path).await? else {
            return Ok(InstalledDocument::default());
        };

        let doc: InstalledDocument = serde_json::from_str(&content).with_context(|| {
            format!(
                "Failed to parse installed-model database: {:?}. File may be corrupted.",
                self.path
            )
        })?;

        if doc.schema_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Installed-model database {:?} has schema version {} (supported: {})",
                self.path,
                doc.schema_version,
                SCHEMA_VERSION
            );
        }

        Ok(doc)
    }

    /// Persist the document atomically
    pub async fn save(&self, doc: &mut InstalledDocument) -> Result<()> {
        doc.schema_version = SCHEMA_VERSION;
        doc.updated_at = chrono::Utc::now();

        let content = serde_json::to_string_pretty(doc)
            .context("Failed to serialize installed-model database")?;
        self.storage.save(&self.path, &content).await?;

        tracing::debug!(
            path = ?self.path,
            models = doc.models.len(),
            "Installed-model database saved"
        );

        Ok(())
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// In-memory storage with error injection
    #[derive(Default)]
    pub struct MockStorage {
        files: RwLock<HashMap<PathBuf, String>>,
        save_error: RwLock<Option<String>>,
    }

    impl MockStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn get_file(&self, path: &Path) -> Option<String> {
            self.files.read().await.get(path).cloned()
        }

        pub async fn put_file(&self, path: &Path, content: &str) {
            self.files
                .write()
                .await
                .insert(path.to_path_buf(), content.to_string());
        }

        /// Fail the next save with the given message
        pub async fn set_save_error(&self, error: String) {
            *self.save_error.write().await = Some(error);
        }
    }

    #[async_trait]
    impl StorageBackend for MockStorage {
        async fn save(&self, path: &Path, content: &str) -> Result<()> {
            if let Some(error) = self.save_error.write().await.take() {
                return Err(anyhow::anyhow!(error));
            }
            self.put_file(path, content).await;
            Ok(())
        }

        async fn load(&self, path: &Path) -> Result<Option<String>> {
            Ok(self.get_file(path).await)
        }
    }
}
