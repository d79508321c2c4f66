//! Download jobs and the in-memory job registry

pub mod job;
pub mod registry;

pub use job::{DownloadJob, FileProgress, FileStatus, JobStatus, ProgressMode};
pub use registry::{JobEntry, JobRegistry};
