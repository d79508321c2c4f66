//! Model depot - artifact lifecycle for large ML models
//!
//! Downloads model weights from hub repositories, a model marketplace or plain
//! URLs through a supervised external transfer process, tracks progress per
//! job, and keeps a durable registry of what is installed on this host.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod installed;
pub mod jobs;
pub mod manager;
pub mod metrics;
pub mod progress;
pub mod reaper;
pub mod strategies;
pub mod supervisor;

pub use catalog::{Catalog, ModelDefinition, ModelFilter, ModelType, SourceKind, SourceLocator};
pub use config::ManagerConfig;
pub use error::{FailureKind, ManagerError, ManagerResult};
pub use installed::{InstalledModel, InstalledRegistry};
pub use jobs::{DownloadJob, JobRegistry, JobStatus, ProgressMode};
pub use manager::{ModelManager, UploadResult};
pub use reaper::JobReaper;
