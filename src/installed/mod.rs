//! Installed models: durable records, hub cache discovery and disk scans

pub mod cache;
pub mod model;
pub mod registry;
pub mod scan;
pub mod store;

pub use model::{InstallSource, InstalledModel, ModelFile};
pub use registry::{InstalledRegistry, SHADOW_ID_PREFIX};
pub use scan::{DEFAULT_MIN_FILE_BYTES, scan_directory};
pub use store::{FileSystemStorage, InstalledStore, StorageBackend};

#[cfg(test)]
pub(crate) mod fixtures {
    use super::cache::repo_cache_dir;
    use std::path::{Path, PathBuf};

    /// Create a sparse file of the given size, creating parent directories
    pub fn sized_file(path: &Path, size: u64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::File::create(path).unwrap().set_len(size).unwrap();
    }

    /// Lay out a hub cache snapshot with `refs/main` pointing at it
    pub fn write_snapshot(cache: &Path, repo: &str, rev: &str, files: &[(&str, u64)]) -> PathBuf {
        let repo_dir = repo_cache_dir(cache, repo);
        let snapshot = repo_dir.join("snapshots").join(rev);
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::create_dir_all(repo_dir.join("refs")).unwrap();
        std::fs::write(repo_dir.join("refs/main"), rev).unwrap();

        for (name, size) in files {
            sized_file(&snapshot.join(name), *size);
        }
        snapshot
    }
}
