//! Installed-model registry
//!
//! Merges the durable database with models found in shared hub caches.
//! Every read verifies files on disk: durable records with missing files are
//! pruned, and cache-discovered copies of durable (or removed) models are
//! suppressed by source locator.

use super::cache::{hub_repo_dir_has_models, list_cached_repos, repo_files_cached};
use super::model::{InstallSource, InstalledModel, ModelFile};
use super::scan::scan_directory;
use super::store::{InstalledDocument, InstalledStore};
use crate::catalog::{Catalog, ModelFilter, ModelType, SourceLocator, hub_locator_key};
use crate::error::{ManagerError, ManagerResult};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Id prefix for cache-discovered repositories with no catalog definition
pub const SHADOW_ID_PREFIX: &str = "hub-cache:";

/// Registry of installed models
pub struct InstalledRegistry {
    store: InstalledStore,
    /// Serializes read-modify-write cycles on the durable document
    write_lock: Mutex<()>,
    catalog: Arc<Catalog>,
    cache_dirs: Vec<PathBuf>,
    min_file_bytes: u64,
}

impl InstalledRegistry {
    pub fn new(
        store: InstalledStore,
        catalog: Arc<Catalog>,
        cache_dirs: Vec<PathBuf>,
        min_file_bytes: u64,
    ) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            catalog,
            cache_dirs,
            min_file_bytes,
        }
    }

    /// List installed models, durable and cache-discovered
    ///
    /// Never fails: an unreadable database or cache directory is logged and
    /// the listing continues with whatever could be read.
    pub async fn list(&self, filter: &ModelFilter) -> Vec<InstalledModel> {
        let (mut models, suppressed) = match self.load_reconciled().await {
            Some(doc) => {
                let suppressed: HashSet<String> = doc
                    .models
                    .iter()
                    .map(|m| m.source_locator.clone())
                    .chain(doc.removed_locators.iter().cloned())
                    .collect();
                (doc.models, suppressed)
            }
            None => (Vec::new(), HashSet::new()),
        };

        let durable_ids: HashSet<String> = models.iter().map(|m| m.id.clone()).collect();
        for shadow in self.scan_shared_caches().await {
            if suppressed.contains(&shadow.source_locator) || durable_ids.contains(&shadow.id) {
                tracing::trace!(
                    model = %shadow.id,
                    locator = %shadow.source_locator,
                    "Suppressing cache-discovered duplicate"
                );
                continue;
            }
            models.push(shadow);
        }

        models.retain(|m| filter.matches(&m.family, m.model_type, Some(m.source.kind())));
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Look up one installed model by id
    pub async fn get(&self, id: &str) -> Option<InstalledModel> {
        self.list(&ModelFilter::default())
            .await
            .into_iter()
            .find(|m| m.id == id)
    }

    /// Whether a model is installed, durably or in a shared cache
    ///
    /// Cache discovery only works for ids that map to a hub repository: the
    /// catalog's hub definitions and synthesized `hub-cache:` ids.
    pub async fn is_installed(&self, id: &str) -> bool {
        let doc = self.load_reconciled().await;
        if doc.as_ref().is_some_and(|d| d.find(id).is_some()) {
            return true;
        }

        let Some((repo_id, files)) = self.cache_lookup(id) else {
            return false;
        };
        if doc
            .as_ref()
            .is_some_and(|d| d.is_suppressed(&hub_locator_key(&repo_id)))
        {
            return false;
        }

        let dirs = self.cache_dirs.clone();
        let min_bytes = self.min_file_bytes;
        tokio::task::spawn_blocking(move || {
            dirs.iter().any(|dir| {
                if files.is_empty() {
                    hub_repo_dir_has_models(dir, &repo_id, min_bytes)
                } else {
                    repo_files_cached(dir, &repo_id, &files)
                }
            })
        })
        .await
        .unwrap_or(false)
    }

    /// Register a model, replacing any record with the same id
    pub async fn add(&self, mut model: InstalledModel) -> ManagerResult<InstalledModel> {
        if model.files.is_empty() {
            return Err(ManagerError::validation(format!(
                "Installed model '{}' has no files",
                model.id
            )));
        }
        model.size_bytes = model.files.iter().map(|f| f.size_bytes).sum();

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.load().await?;

        doc.models.retain(|m| m.id != model.id);
        if model.is_default {
            for other in doc
                .models
                .iter_mut()
                .filter(|m| m.model_type == model.model_type)
            {
                other.is_default = false;
            }
        }
        doc.removed_locators.retain(|l| l != &model.source_locator);
        doc.models.push(model.clone());

        self.store.save(&mut doc).await?;

        tracing::info!(
            model = %model.id,
            files = model.files.len(),
            size_bytes = model.size_bytes,
            source = ?model.source,
            "Installed model registered"
        );

        Ok(model)
    }

    /// Delete a model's files and its record
    ///
    /// Files are deleted before the record is dropped, so an interrupted
    /// database write still leaves a record the next listing prunes.
    pub async fn remove(&self, id: &str) -> ManagerResult<InstalledModel> {
        let guard = self.write_lock.lock().await;
        let mut doc = self.store.load().await?;

        let Some(pos) = doc.models.iter().position(|m| m.id == id) else {
            drop(guard);
            let shadowed = id.starts_with(SHADOW_ID_PREFIX)
                || self.scan_shared_caches().await.iter().any(|m| m.id == id);
            return Err(if shadowed {
                ManagerError::CacheManaged { id: id.to_string() }
            } else {
                ManagerError::ModelNotFound { id: id.to_string() }
            });
        };

        let model = doc.models[pos].clone();
        delete_model_files(&model.files).await;

        doc.models.remove(pos);
        if model.source_locator.starts_with("hub:") && !doc.is_suppressed(&model.source_locator) {
            doc.removed_locators.push(model.source_locator.clone());
        }
        self.store.save(&mut doc).await?;

        tracing::info!(model = %model.id, files = model.files.len(), "Installed model removed");
        Ok(model)
    }

    /// Load the durable document and prune records whose files are gone
    async fn load_reconciled(&self) -> Option<InstalledDocument> {
        let _guard = self.write_lock.lock().await;

        let mut doc = match self.store.load().await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(path = ?self.store.path(), error = %e, "Failed to load installed-model database");
                return None;
            }
        };

        let (present, stale): (Vec<_>, Vec<_>) =
            doc.models.drain(..).partition(InstalledModel::files_present);
        doc.models = present;

        if !stale.is_empty() {
            for model in &stale {
                tracing::warn!(
                    model = %model.id,
                    "Pruning installed model with missing files"
                );
            }
            if let Err(e) = self.store.save(&mut doc).await {
                tracing::warn!(error = %e, "Failed to persist pruned installed-model database");
            }
        }

        Some(doc)
    }

    async fn scan_shared_caches(&self) -> Vec<InstalledModel> {
        let catalog = self.catalog.clone();
        let dirs = self.cache_dirs.clone();
        let min_bytes = self.min_file_bytes;

        match tokio::task::spawn_blocking(move || discover_cached_models(&catalog, &dirs, min_bytes))
            .await
        {
            Ok(models) => models,
            Err(e) => {
                tracing::error!(error = %e, "Cache scan task failed");
                Vec::new()
            }
        }
    }

    /// Hub repository (and required files) an id resolves to in the cache
    fn cache_lookup(&self, id: &str) -> Option<(String, Vec<String>)> {
        if let Some(repo_id) = id.strip_prefix(SHADOW_ID_PREFIX) {
            return Some((repo_id.to_string(), Vec::new()));
        }
        match &self.catalog.get(id)?.source {
            SourceLocator::Hub { repo_id, files } => Some((repo_id.clone(), files.clone())),
            _ => None,
        }
    }
}

/// Synthesize installed-model records for every populated cached repository
///
/// A repository adopts its catalog id only when the snapshot holds every file
/// the definition names; otherwise it is listed under a `hub-cache:` id.
pub fn discover_cached_models(
    catalog: &Catalog,
    cache_dirs: &[PathBuf],
    min_bytes: u64,
) -> Vec<InstalledModel> {
    let mut seen = HashSet::new();
    let mut models = Vec::new();

    for dir in cache_dirs {
        for repo in list_cached_repos(dir) {
            let key = hub_locator_key(&repo.repo_id);
            if seen.contains(&key) {
                continue;
            }

            let files = scan_directory(&repo.snapshot, true, min_bytes);
            if files.is_empty() {
                continue;
            }
            seen.insert(key.clone());

            let installed_at = std::fs::metadata(&repo.snapshot)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let size_bytes = files.iter().map(|f| f.size_bytes).sum();

            let definition = catalog
                .definition_for_repo(&repo.repo_id)
                .filter(|d| snapshot_covers(d.source.clone(), &files));

            let model = match definition {
                Some(def) => InstalledModel {
                    id: def.id.clone(),
                    name: def.name.clone(),
                    family: def.family.clone(),
                    model_type: def.model_type,
                    source: InstallSource::HubCache,
                    source_locator: key,
                    installed_at,
                    files,
                    size_bytes,
                    is_default: false,
                },
                None => InstalledModel {
                    id: format!("{}{}", SHADOW_ID_PREFIX, repo.repo_id),
                    name: repo.repo_id.clone(),
                    family: "unknown".to_string(),
                    model_type: ModelType::Other,
                    source: InstallSource::HubCache,
                    source_locator: key,
                    installed_at,
                    files,
                    size_bytes,
                    is_default: false,
                },
            };
            models.push(model);
        }
    }

    models
}

fn snapshot_covers(source: SourceLocator, files: &[ModelFile]) -> bool {
    match source {
        SourceLocator::Hub { files: wanted, .. } => wanted
            .iter()
            .all(|w| files.iter().any(|f| f.path.ends_with(w))),
        _ => false,
    }
}

async fn delete_model_files(files: &[ModelFile]) {
    let mut parents = HashSet::new();

    for file in files {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => tracing::debug!(path = ?file.path, "Deleted model file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = ?file.path, "Model file already missing");
            }
            Err(e) => {
                tracing::warn!(path = ?file.path, error = %e, "Failed to delete model file");
            }
        }
        if let Some(parent) = file.path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }

    // Only succeeds for directories left empty
    for parent in parents {
        let _ = tokio::fs::remove_dir(&parent).await;
    }
}
