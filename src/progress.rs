//! Progress estimation for running transfers
//!
//! Two sources feed the same estimator:
//! - [`ReportedProgress`] reads the structured progress file a transfer writes
//! - [`EstimatedProgress`] derives bytes from partial files in the hub cache
//!   and the target directory, for transfers with no structured feed
//!
//! The estimator folds samples into the job: percent only moves forward and
//! stays below 100, speed is smoothed, and stalls are logged once per episode.

use crate::jobs::{DownloadJob, FileProgress, FileStatus, JobEntry, JobStatus, ProgressMode};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Smoothing factor for the speed moving average
const SPEED_ALPHA: f64 = 0.3;

/// Highest activity percentage shown before any bytes are observed
const MAX_ACTIVITY_PERCENT: u8 = 3;

/// One observation of a transfer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSample {
    pub downloaded_bytes: u64,
    /// Zero when the source does not know
    pub total_bytes: u64,
    pub current_file: Option<String>,
    /// Rate and ETA computed by the transfer itself
    pub reported_speed: Option<f64>,
    pub reported_eta: Option<u64>,
    pub files: Vec<FileProgress>,
    /// Time since the newest write among observed files
    pub idle_for: Option<Duration>,
}

/// Something that can be polled for progress
#[async_trait]
pub trait ProgressSource: Send + Sync {
    fn mode(&self) -> ProgressMode;

    /// None when nothing is observable yet
    async fn sample(&self) -> Option<ProgressSample>;
}

// ============================================================================
// Reported progress (structured file)
// ============================================================================

/// Progress file layout
#[derive(Debug, Deserialize)]
struct ProgressRecord {
    #[serde(default)]
    downloaded: u64,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    current_file: Option<String>,
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    eta: f64,
}

/// Reads the progress file a transfer rewrites atomically
pub struct ReportedProgress {
    path: PathBuf,
}

impl ReportedProgress {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ProgressSource for ReportedProgress {
    fn mode(&self) -> ProgressMode {
        ProgressMode::Reported
    }

    async fn sample(&self) -> Option<ProgressSample> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let record: ProgressRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(path = ?self.path, error = %e, "Unreadable progress file");
                return None;
            }
        };

        let idle_for = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());

        Some(ProgressSample {
            downloaded_bytes: record.downloaded,
            total_bytes: record.total,
            current_file: record.current_file.filter(|f| !f.is_empty()),
            reported_speed: (record.speed > 0.0).then_some(record.speed),
            reported_eta: (record.eta > 0.0).then(|| record.eta.ceil() as u64),
            files: Vec::new(),
            idle_for,
        })
    }
}

// ============================================================================
// Estimated progress (directory scan)
// ============================================================================

/// Estimates hub transfer progress from files on disk
///
/// Counts `.incomplete` partials under the repository's cache directories and
/// the target directory's `.cache/huggingface` staging area, plus files in the
/// target directory that are expected or were written within the recent
/// window. The total is the catalog's expected size.
#[derive(Debug, Clone)]
pub struct EstimatedProgress {
    cache_repo_dirs: Vec<PathBuf>,
    target_dir: PathBuf,
    expected_files: Vec<String>,
    expected_total: u64,
    recent_window: Duration,
}

impl EstimatedProgress {
    pub fn new(
        cache_repo_dirs: Vec<PathBuf>,
        target_dir: PathBuf,
        expected_files: Vec<String>,
        expected_total: u64,
        recent_window: Duration,
    ) -> Self {
        Self {
            cache_repo_dirs,
            target_dir,
            expected_files,
            expected_total,
            recent_window,
        }
    }

    /// Synchronous scan; the trait impl runs it on the blocking pool
    pub fn scan(&self) -> Option<ProgressSample> {
        let now = SystemTime::now();
        let mut observed = Observed::default();

        for dir in &self.cache_repo_dirs {
            walk(dir, true, &mut |path, meta| {
                if is_incomplete(path) {
                    observed.add(path, meta);
                }
            });
        }
        walk(&self.target_dir.join(".cache/huggingface"), true, &mut |path, meta| {
            if is_incomplete(path) {
                observed.add(path, meta);
            }
        });

        let mut completed = Vec::new();
        walk(&self.target_dir, false, &mut |path, meta| {
            let relative = path.strip_prefix(&self.target_dir).unwrap_or(path);
            let expected = self.expected_files.is_empty()
                || self.expected_files.iter().any(|f| relative == Path::new(f));
            let recent = meta
                .modified()
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age <= self.recent_window);
            if expected || recent {
                observed.add(path, meta);
                completed.push((relative.to_path_buf(), meta.len(), recent));
            }
        });

        if observed.files == 0 {
            return None;
        }

        let files: Vec<FileProgress> = self
            .expected_files
            .iter()
            .map(|name| match completed.iter().find(|(p, _, _)| p == Path::new(name)) {
                Some((_, size, recent)) => FileProgress {
                    filename: name.clone(),
                    status: if *recent {
                        FileStatus::Downloading
                    } else {
                        FileStatus::Done
                    },
                    downloaded_bytes: *size,
                },
                None => FileProgress {
                    filename: name.clone(),
                    status: FileStatus::Pending,
                    downloaded_bytes: 0,
                },
            })
            .collect();

        let current_file = files
            .iter()
            .find(|f| f.status != FileStatus::Done)
            .map(|f| f.filename.clone())
            .or(observed.newest_name);

        Some(ProgressSample {
            downloaded_bytes: observed.bytes,
            total_bytes: self.expected_total,
            current_file,
            reported_speed: None,
            reported_eta: None,
            files,
            idle_for: observed
                .newest
                .and_then(|t| now.duration_since(t).ok()),
        })
    }
}

#[async_trait]
impl ProgressSource for EstimatedProgress {
    fn mode(&self) -> ProgressMode {
        ProgressMode::Estimated
    }

    async fn sample(&self) -> Option<ProgressSample> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .ok()
            .flatten()
    }
}

#[derive(Default)]
struct Observed {
    bytes: u64,
    files: usize,
    newest: Option<SystemTime>,
    newest_name: Option<String>,
}

impl Observed {
    fn add(&mut self, path: &Path, meta: &std::fs::Metadata) {
        self.bytes += meta.len();
        self.files += 1;
        if let Ok(modified) = meta.modified()
            && self.newest.is_none_or(|n| modified > n)
        {
            self.newest = Some(modified);
            self.newest_name = path.file_name().map(|n| {
                n.to_string_lossy()
                    .trim_end_matches(".incomplete")
                    .to_string()
            });
        }
    }
}

fn is_incomplete(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(".incomplete"))
}

/// Visit regular files under `dir`; hidden directories are entered only when asked
fn walk(dir: &Path, include_hidden: bool, visit: &mut dyn FnMut(&Path, &std::fs::Metadata)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            if include_hidden || !entry.file_name().to_string_lossy().starts_with('.') {
                walk(&path, include_hidden, visit);
            }
        } else {
            visit(&path, &meta);
        }
    }
}

// ============================================================================
// Estimator
// ============================================================================

/// Folds samples into a job
pub struct ProgressEstimator {
    interval: Duration,
    stall_threshold: Duration,
    last: (u64, Instant),
    speed: Option<f64>,
    activity: u8,
    stalled: bool,
}

impl ProgressEstimator {
    pub fn new(interval: Duration, stall_threshold: Duration, started: Instant) -> Self {
        Self {
            interval,
            stall_threshold,
            last: (0, started),
            speed: None,
            activity: 0,
            stalled: false,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Apply one sample taken at `now`
    pub fn observe(
        &mut self,
        job: &mut DownloadJob,
        sample: Option<ProgressSample>,
        now: Instant,
    ) {
        let Some(sample) = sample else {
            self.advance_activity(job);
            return;
        };

        if sample.total_bytes > 0 {
            job.total_bytes = sample.total_bytes;
        }
        if sample.current_file.is_some() {
            job.current_file = sample.current_file.clone();
        }
        if !sample.files.is_empty() {
            job.files = sample.files.clone();
        }

        if sample.downloaded_bytes == 0 {
            self.advance_activity(job);
            return;
        }

        job.downloaded_bytes = job.downloaded_bytes.max(sample.downloaded_bytes);
        if job.total_bytes > 0 {
            let percent = job.downloaded_bytes as f64 / job.total_bytes as f64 * 100.0;
            job.raise_percent(percent.floor().min(99.0) as u8);
        }

        let (last_bytes, last_at) = self.last;
        let elapsed = now.saturating_duration_since(last_at).max(self.interval);
        let instant = sample.downloaded_bytes.saturating_sub(last_bytes) as f64 / elapsed.as_secs_f64();
        let smoothed = match self.speed {
            Some(prev) => SPEED_ALPHA * instant + (1.0 - SPEED_ALPHA) * prev,
            None => instant,
        };
        self.speed = Some(smoothed);
        self.last = (sample.downloaded_bytes.max(last_bytes), now);

        job.speed_bps = sample.reported_speed.unwrap_or(smoothed);
        let remaining = job.total_bytes.saturating_sub(job.downloaded_bytes);
        job.eta_secs = sample.reported_eta.or_else(|| {
            if remaining == 0 {
                Some(0)
            } else if job.speed_bps > 0.0 {
                Some((remaining as f64 / job.speed_bps).ceil() as u64)
            } else {
                None
            }
        });

        self.check_stall(job, sample.idle_for);
    }

    fn advance_activity(&mut self, job: &mut DownloadJob) {
        self.activity = (self.activity + 1).min(MAX_ACTIVITY_PERCENT);
        job.raise_percent(self.activity);
    }

    fn check_stall(&mut self, job: &DownloadJob, idle_for: Option<Duration>) {
        let idle = idle_for.unwrap_or_default();
        if idle > self.stall_threshold && job.percent < 99 {
            if !self.stalled {
                self.stalled = true;
                tracing::warn!(
                    job_id = %job.id,
                    model = %job.model_id,
                    idle_secs = idle.as_secs(),
                    percent = job.percent,
                    "Transfer appears stalled; no file written recently"
                );
            }
        } else if self.stalled {
            self.stalled = false;
            tracing::info!(job_id = %job.id, "Transfer resumed writing");
        }
    }
}

/// Poll a job's progress source until it leaves `downloading` or is cancelled
pub async fn run_estimator(
    entry: Arc<JobEntry>,
    source: Box<dyn ProgressSource>,
    interval: Duration,
    stall_threshold: Duration,
) {
    let mut cancelled = entry.cancel_token();
    let mut estimator = ProgressEstimator::new(interval, stall_threshold, Instant::now());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::debug!(job_id = %entry.id(), mode = ?source.mode(), "Progress estimator started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled.changed() => break,
        }
        if *cancelled.borrow() {
            break;
        }

        let sample = source.sample().await;
        let downloading = entry
            .update(|job| {
                if job.status != JobStatus::Downloading {
                    return false;
                }
                estimator.observe(job, sample, Instant::now());
                true
            })
            .await;
        if !downloading {
            break;
        }
    }

    tracing::debug!(job_id = %entry.id(), "Progress estimator stopped");
}
