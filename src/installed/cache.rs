//! HuggingFace hub cache layout
//!
//! External tooling shares this cache with the depot, so its layout is parsed
//! here but never created:
//! ```text
//! ~/.cache/huggingface/hub/
//! ├── models--black-forest-labs--FLUX.1-dev/
//! │   ├── blobs/
//! │   │   ├── 3f2a...           (complete blob)
//! │   │   └── 9c1e....incomplete (in-flight download)
//! │   ├── refs/
//! │   │   └── main
//! │   └── snapshots/
//! │       └── {revision}/
//! │           └── flux1-dev.safetensors -> ../../blobs/3f2a...
//! └── models--madebyollin--sdxl-vae-fp16-fix/
//!     └── ...
//! ```

use super::scan::scan_directory;
use std::path::{Path, PathBuf};

/// Get the HuggingFace hub cache directory
///
/// Checks in order:
/// 1. `$HF_HUB_CACHE`
/// 2. `$HF_HOME/hub`
/// 3. `$XDG_CACHE_HOME/huggingface/hub`
/// 4. `~/.cache/huggingface/hub`
pub fn get_cache_dir() -> PathBuf {
    if let Ok(cache) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(cache);
    }

    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return PathBuf::from(hf_home).join("hub");
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("huggingface/hub");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache/huggingface/hub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/huggingface/hub"))
}

/// Convert a repository id to its cache directory name
///
/// e.g., "black-forest-labs/FLUX.1-dev" -> "models--black-forest-labs--FLUX.1-dev"
pub fn repo_to_cache_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

/// Convert a cache directory name back to a repository id
///
/// e.g., "models--black-forest-labs--FLUX.1-dev" -> "black-forest-labs/FLUX.1-dev"
pub fn cache_name_to_repo(cache_name: &str) -> Option<String> {
    cache_name
        .strip_prefix("models--")
        .filter(|s| !s.is_empty())
        .map(|s| s.replacen("--", "/", 1))
}

/// Directory holding a repository inside a cache root
pub fn repo_cache_dir(cache_dir: &Path, repo_id: &str) -> PathBuf {
    cache_dir.join(repo_to_cache_name(repo_id))
}

/// Resolve the snapshot directory for a cached repository
///
/// Prefers the revision `refs/main` points at, falling back to the most
/// recently modified snapshot.
pub fn resolve_snapshot(repo_dir: &Path) -> Option<PathBuf> {
    let refs_main = repo_dir.join("refs/main");
    if let Ok(revision) = std::fs::read_to_string(&refs_main) {
        let snapshot = repo_dir.join("snapshots").join(revision.trim());
        if snapshot.is_dir() {
            return Some(snapshot);
        }
    }

    let entries = std::fs::read_dir(repo_dir.join("snapshots")).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())
        .map(|e| e.path())
}

/// A repository found in a cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRepo {
    pub repo_id: String,
    pub repo_dir: PathBuf,
    pub snapshot: PathBuf,
}

/// List every model repository with a resolvable snapshot in a cache root
pub fn list_cached_repos(cache_dir: &Path) -> Vec<CachedRepo> {
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(cache_dir = ?cache_dir, error = %e, "Cache directory not readable");
            return Vec::new();
        }
    };

    let mut repos = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(repo_id) = cache_name_to_repo(&name) else {
            continue;
        };
        let repo_dir = entry.path();
        if let Some(snapshot) = resolve_snapshot(&repo_dir) {
            repos.push(CachedRepo {
                repo_id,
                repo_dir,
                snapshot,
            });
        }
    }

    repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
    repos
}

/// True when every named file of a repository resolves in the cache
pub fn repo_files_cached(cache_dir: &Path, repo_id: &str, files: &[String]) -> bool {
    let repo = hf_hub::Cache::new(cache_dir.to_path_buf()).model(repo_id.to_string());
    !files.is_empty() && files.iter().all(|f| repo.get(f).is_some_and(|p| p.exists()))
}

/// True when a whole-repository download left model files in its snapshot
pub fn hub_repo_dir_has_models(cache_dir: &Path, repo_id: &str, min_bytes: u64) -> bool {
    resolve_snapshot(&repo_cache_dir(cache_dir, repo_id))
        .is_some_and(|s| !scan_directory(&s, true, min_bytes).is_empty())
}

/// Access token stored by hub tooling next to the cache (`<hf_home>/token`)
pub fn stored_token(cache_dir: &Path) -> Option<String> {
    hf_hub::Cache::new(cache_dir.to_path_buf())
        .token()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installed::fixtures::write_snapshot;

    #[test]
    fn test_repo_to_cache_name() {
        assert_eq!(
            repo_to_cache_name("black-forest-labs/FLUX.1-dev"),
            "models--black-forest-labs--FLUX.1-dev"
        );
    }

    #[test]
    fn test_cache_name_to_repo() {
        assert_eq!(
            cache_name_to_repo("models--madebyollin--sdxl-vae-fp16-fix"),
            Some("madebyollin/sdxl-vae-fp16-fix".to_string())
        );
        assert_eq!(cache_name_to_repo("datasets--foo--bar"), None);
        assert_eq!(cache_name_to_repo("models--"), None);
    }

    #[test]
    fn test_resolve_snapshot_via_refs_main() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = write_snapshot(temp.path(), "org/name", "abc123", &[("w.safetensors", 10)]);
        std::fs::create_dir_all(repo_cache_dir(temp.path(), "org/name").join("snapshots/zzz")).unwrap();

        assert_eq!(
            resolve_snapshot(&repo_cache_dir(temp.path(), "org/name")),
            Some(snapshot)
        );
    }

    #[test]
    fn test_resolve_snapshot_without_refs() {
        let temp = tempfile::tempdir().unwrap();
        let repo_dir = repo_cache_dir(temp.path(), "org/name");
        std::fs::create_dir_all(repo_dir.join("snapshots/only")).unwrap();

        assert_eq!(
            resolve_snapshot(&repo_dir),
            Some(repo_dir.join("snapshots/only"))
        );
    }

    #[test]
    fn test_list_cached_repos_skips_non_models() {
        let temp = tempfile::tempdir().unwrap();
        write_snapshot(temp.path(), "b/model", "r1", &[]);
        write_snapshot(temp.path(), "a/model", "r1", &[]);
        std::fs::create_dir_all(temp.path().join("datasets--x--y/snapshots/r1")).unwrap();
        std::fs::create_dir_all(temp.path().join("models--no--snapshots")).unwrap();

        let repos: Vec<_> = list_cached_repos(temp.path())
            .into_iter()
            .map(|r| r.repo_id)
            .collect();
        assert_eq!(repos, vec!["a/model", "b/model"]);
    }

    #[test]
    fn test_list_cached_repos_missing_dir() {
        assert!(list_cached_repos(Path::new("/nonexistent/hub-cache-12345")).is_empty());
    }

    #[test]
    fn test_repo_files_cached() {
        let temp = tempfile::tempdir().unwrap();
        write_snapshot(
            temp.path(),
            "org/name",
            "rev1",
            &[("a.safetensors", 5), ("b.safetensors", 5)],
        );

        let both = vec!["a.safetensors".to_string(), "b.safetensors".to_string()];
        let missing = vec!["a.safetensors".to_string(), "c.safetensors".to_string()];
        assert!(repo_files_cached(temp.path(), "org/name", &both));
        assert!(!repo_files_cached(temp.path(), "org/name", &missing));
        assert!(!repo_files_cached(temp.path(), "org/name", &[]));
    }

    #[test]
    fn test_get_cache_dir_default() {
        let cache_dir = get_cache_dir();
        assert!(cache_dir.to_string_lossy().contains("hub"));
    }
}
