//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main depot configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,

    /// Root directory models are installed into (`<models_dir>/<family>/<id>`)
    pub models_dir: PathBuf,

    /// Durable installed-model database (JSON)
    pub installed_db: PathBuf,

    /// Directory for structured progress files written by transfers
    pub progress_dir: PathBuf,

    /// Overrides `$HF_HOME`; the hub cache is `<hf_home>/hub`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_home: Option<PathBuf>,

    /// Additional hub-layout caches populated by external tooling
    pub shared_cache_dirs: Vec<PathBuf>,

    /// External transfer program (required, no default)
    ///
    /// Receives one JSON descriptor on stdin (`source`, `target_dir`, plus
    /// `repo_id`/`files`, `model_id`/`version_id` or `url`/`filename`, and an
    /// optional `credential`). `TRANSFER_JOB_ID`, `TRANSFER_TARGET_DIR` and,
    /// when progress is reported, `TRANSFER_PROGRESS_FILE` are set in its
    /// environment. It prints a result record as its last JSON stdout line:
    /// `{"success": bool, "path" or "files", "error"}`.
    pub transfer_program: String,
    pub transfer_args: Vec<String>,

    /// Extra catalog definitions appended to the builtin catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<PathBuf>,

    pub poll_interval_ms: u64,
    pub stall_threshold_secs: u64,
    pub recent_write_window_secs: u64,
    pub settle_delay_ms: u64,
    pub min_model_file_bytes: u64,
    pub cancel_grace_secs: u64,
    pub job_retention_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            models_dir: default_models_dir(),
            installed_db: default_installed_db(),
            progress_dir: default_progress_dir(),
            hf_home: None,
            shared_cache_dirs: Vec::new(),
            transfer_program: String::new(),
            transfer_args: Vec::new(),
            catalog_file: None,
            poll_interval_ms: 1000,
            stall_threshold_secs: 30,
            recent_write_window_secs: 10,
            settle_delay_ms: 500,
            min_model_file_bytes: 1024 * 1024,
            cancel_grace_secs: 5,
            job_retention_secs: 600,
            reap_interval_secs: 60,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("MODEL_DEPOT_API_PORT") {
            config.api_port = port.parse().context("Invalid MODEL_DEPOT_API_PORT value")?;
        }
        if let Ok(dir) = std::env::var("MODEL_DEPOT_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(db) = std::env::var("MODEL_DEPOT_INSTALLED_DB") {
            config.installed_db = PathBuf::from(db);
        }
        if let Ok(dir) = std::env::var("MODEL_DEPOT_PROGRESS_DIR") {
            config.progress_dir = PathBuf::from(dir);
        }
        if let Ok(program) = std::env::var("MODEL_DEPOT_TRANSFER_PROGRAM") {
            config.transfer_program = program;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.transfer_program.trim().is_empty() {
            anyhow::bail!(
                "transfer_program must be set (config file or MODEL_DEPOT_TRANSFER_PROGRAM)"
            );
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if self.reap_interval_secs == 0 {
            anyhow::bail!("reap_interval_secs must be greater than zero");
        }

        for dir in [&self.models_dir, &self.progress_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create directory: {:?}", dir))?;
        }
        if let Some(parent) = self.installed_db.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create database directory: {:?}", parent))?;
        }

        Ok(())
    }

    /// Hub cache that hub-repository transfers populate
    pub fn hub_cache_dir(&self) -> PathBuf {
        match &self.hf_home {
            Some(home) => home.join("hub"),
            None => crate::installed::cache::get_cache_dir(),
        }
    }

    /// Every hub-layout cache scanned for externally downloaded models
    pub fn scanned_cache_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.hub_cache_dir()];
        for dir in &self.shared_cache_dirs {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        dirs
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_models_dir() -> PathBuf {
    PathBuf::from("/workspace/models")
}
fn default_installed_db() -> PathBuf {
    PathBuf::from("/workspace/models/installed_models.json")
}
fn default_progress_dir() -> PathBuf {
    std::env::temp_dir().join("model-depot/progress")
}
