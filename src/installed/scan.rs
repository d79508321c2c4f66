//! Model file discovery in installation and cache directories

use super::model::ModelFile;
use std::path::Path;

/// Extensions recognised as model weights
pub const MODEL_EXTENSIONS: &[&str] = &[
    "safetensors",
    "sft",
    "ckpt",
    "pt",
    "pth",
    "bin",
    "gguf",
    "onnx",
];

/// Default minimum size; smaller files are configs and metadata
pub const DEFAULT_MIN_FILE_BYTES: u64 = 1024 * 1024;

/// True when the path carries a model weight extension
pub fn is_model_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| MODEL_EXTENSIONS.contains(&ext.as_str()))
}

/// Find model weight files in a directory
///
/// Filters by extension allow-list and drops files below `min_bytes`. When
/// `recursive`, descends into subdirectories (some families split weights
/// across nested folders) but skips hidden ones such as the `.cache` staging
/// area. Symlinks are followed, so hub snapshots report blob sizes.
pub fn scan_directory(path: &Path, recursive: bool, min_bytes: u64) -> Vec<ModelFile> {
    let mut files = Vec::new();
    scan_into(path, recursive, min_bytes, &mut files);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn scan_into(dir: &Path, recursive: bool, min_bytes: u64, out: &mut Vec<ModelFile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = ?dir, error = %e, "Skipping unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = std::fs::metadata(&path) else {
            // Dangling symlink
            continue;
        };

        if metadata.is_dir() {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if recursive && !hidden {
                scan_into(&path, recursive, min_bytes, out);
            }
            continue;
        }

        if metadata.len() >= min_bytes && is_model_file(&path) {
            out.push(ModelFile::with_size(&path, metadata.len()));
        }
    }
}
