//! Transfer process supervision
//!
//! Each job's bytes are moved by an external program. The supervisor spawns
//! it in its own process group, hands it a JSON descriptor on stdin, collects
//! its output, and on cancellation tears down the whole process tree and
//! deletes the partial files it left behind.

use crate::catalog::SourceKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

/// Lines of stderr kept for failure diagnostics
pub const STDERR_TAIL_LINES: usize = 40;

/// File name markers of partially written downloads
pub const PARTIAL_MARKERS: &[&str] = &[".incomplete", ".part", ".lock", ".tmp"];

// ============================================================================
// Transfer Descriptor and Outcome
// ============================================================================

/// JSON document written to the transfer program's stdin
#[derive(Clone, Default, Serialize)]
pub struct TransferDescriptor {
    pub source: Option<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub target_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<PathBuf>,
    pub accelerated: bool,
}

// Hand-written so the credential never reaches logs
impl std::fmt::Debug for TransferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferDescriptor")
            .field("source", &self.source)
            .field("repo_id", &self.repo_id)
            .field("url", &self.url)
            .field("target_dir", &self.target_dir)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("accelerated", &self.accelerated)
            .finish()
    }
}

/// Paths swept for partial files when a transfer is cancelled
#[derive(Debug, Clone, Default)]
pub struct CleanupPlan {
    /// Directories searched recursively for partial-file markers
    pub roots: Vec<PathBuf>,
    /// Files deleted unconditionally (progress files)
    pub files: Vec<PathBuf>,
}

/// Everything a launcher needs to start one transfer
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub job_id: String,
    pub descriptor: TransferDescriptor,
    pub cleanup: CleanupPlan,
}

/// Final line a transfer may print on stdout
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransferResult {
    #[serde(default)]
    pub success: bool,
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub error: Option<String>,
}

/// How a transfer process ended
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    /// None when killed by a signal or never waited on
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr_tail: Vec<String>,
}

impl TransferOutcome {
    /// Last stdout line that parses as a result record
    pub fn result(&self) -> Option<TransferResult> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .find_map(|l| serde_json::from_str(l).ok())
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.result().is_none_or(|r| r.success)
    }

    /// All diagnostic text, for classification
    pub fn diagnostics(&self) -> String {
        let mut text = self.stderr_tail.join("\n");
        if let Some(error) = self.result().and_then(|r| r.error) {
            text.push('\n');
            text.push_str(&error);
        }
        text
    }

    /// The most specific single line describing the failure
    pub fn failure_detail(&self) -> String {
        if let Some(error) = self.result().and_then(|r| r.error) {
            return error;
        }
        self.stderr_tail
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("transfer exited with code {}", code),
                None => "transfer was terminated".to_string(),
            })
    }
}

/// Resolves once the transfer process has exited and its output is drained
pub struct TransferCompletion {
    rx: oneshot::Receiver<TransferOutcome>,
}

impl TransferCompletion {
    pub fn new(rx: oneshot::Receiver<TransferOutcome>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> TransferOutcome {
        self.rx.await.unwrap_or_else(|_| TransferOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr_tail: vec!["transfer supervisor ended without reporting an exit status".into()],
        })
    }
}

// ============================================================================
// Transfer Control (stop and cleanup)
// ============================================================================

/// Stop handle for one running transfer
pub struct TransferControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    cleanup: CleanupPlan,
    grace: Duration,
}

impl TransferControl {
    pub fn new(pid: Option<u32>, exited: Arc<AtomicBool>, cleanup: CleanupPlan, grace: Duration) -> Self {
        Self {
            pid,
            exited,
            cleanup,
            grace,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask the process tree to terminate (SIGTERM); returns immediately
    pub fn request_stop(&self) {
        if let Some(pid) = self.pid
            && !self.has_exited()
        {
            tracing::info!(pid = pid, "Stopping transfer process tree");
            signal_tree(pid, TreeSignal::Terminate);
        }
    }

    /// Wait out the grace period, force-kill survivors, delete partial files
    ///
    /// Safe to call after the process has exited.
    pub async fn finish_cancel(self) {
        if let Some(pid) = self.pid {
            let deadline = tokio::time::Instant::now() + self.grace;
            while !self.has_exited() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if !self.has_exited() {
                tracing::warn!(pid = pid, "Transfer ignored SIGTERM, sending SIGKILL");
                signal_tree(pid, TreeSignal::Kill);
            }
        }

        let plan = self.cleanup;
        let removed = tokio::task::spawn_blocking(move || plan.execute())
            .await
            .unwrap_or(0);
        tracing::info!(removed = removed, "Partial transfer files cleaned up");
    }
}

impl CleanupPlan {
    /// Delete partial files; returns how many were removed
    pub fn execute(&self) -> usize {
        let mut removed = 0;
        for root in &self.roots {
            removed += remove_partials(root);
        }
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?file, error = %e, "Failed to delete file"),
            }
        }
        removed
    }
}

pub fn is_partial_file(name: &str) -> bool {
    PARTIAL_MARKERS.iter().any(|m| name.ends_with(m))
}

fn remove_partials(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            removed += remove_partials(&path);
        } else if is_partial_file(&entry.file_name().to_string_lossy()) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = ?path, "Deleted partial file");
                    removed += 1;
                }
                Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to delete partial file"),
            }
        }
    }
    removed
}

#[derive(Debug, Clone, Copy)]
enum TreeSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid` plus every descendant found in /proc
///
/// Helpers that moved to their own process group are still reached through
/// the descendant walk. ESRCH (already gone) is ignored.
#[cfg(unix)]
fn signal_tree(pid: u32, which: TreeSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let signal = match which {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    let descendants = descendant_pids(pid);

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid = pid, error = %e, "killpg failed"),
    }
    for child in descendants {
        match kill(Pid::from_raw(child as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pid = child, error = %e, "kill failed"),
        }
    }
}

#[cfg(not(unix))]
fn signal_tree(_pid: u32, _which: TreeSignal) {}

/// All transitive children of `root`, read from /proc (empty elsewhere)
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut parents: Vec<(u32, u32)> = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Some(ppid) = std::fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| parse_ppid(&stat))
        {
            parents.push((pid, ppid));
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in &parents {
            if ppid == parent && pid != root && !found.contains(&pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }
    found
}

/// Parent pid from a /proc/<pid>/stat line; the command name may contain spaces
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

// ============================================================================
// Launcher Trait and Production Implementation
// ============================================================================

/// A started transfer
pub struct RunningTransfer {
    pub control: TransferControl,
    pub completion: TransferCompletion,
}

/// Trait for starting transfer processes
#[async_trait]
pub trait TransferLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<RunningTransfer>;
}

/// Launches the configured transfer program with tokio::process
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    hf_home: Option<PathBuf>,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: String, args: Vec<String>, hf_home: Option<PathBuf>, grace: Duration) -> Self {
        Self {
            program,
            args,
            hf_home,
            grace,
        }
    }
}

#[async_trait]
impl TransferLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<RunningTransfer> {
        let payload =
            serde_json::to_vec(&spec.descriptor).context("Failed to encode transfer descriptor")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TRANSFER_JOB_ID", &spec.job_id)
            .env("TRANSFER_TARGET_DIR", &spec.descriptor.target_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(progress_file) = &spec.descriptor.progress_file {
            cmd.env("TRANSFER_PROGRESS_FILE", progress_file);
        }
        if spec.descriptor.accelerated {
            cmd.env("HF_HUB_ENABLE_HF_TRANSFER", "1");
        }
        if let Some(hf_home) = &self.hf_home {
            cmd.env("HF_HOME", hf_home);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn transfer process '{}'", self.program))?;
        let pid = child.id().context("Failed to get transfer process PID")?;

        tracing::info!(
            job_id = %spec.job_id,
            pid = pid,
            descriptor = ?spec.descriptor,
            "Transfer process spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading stdin is judged by its exit code
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(job_id = %spec.job_id, error = %e, "Transfer did not read its descriptor");
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let exited = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let exited_flag = exited.clone();
        let job_id = spec.job_id.clone();
        tokio::spawn(async move {
            let stdout_task = tokio::spawn(read_all(stdout));
            let stderr_task = tokio::spawn(read_tail(stderr, STDERR_TAIL_LINES, job_id.clone()));

            let status = child.wait().await;
            exited_flag.store(true, Ordering::SeqCst);

            let stdout = stdout_task.await.unwrap_or_default();
            let mut stderr_tail = stderr_task.await.unwrap_or_default();

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    stderr_tail.push(format!("failed to wait for transfer process: {}", e));
                    None
                }
            };

            tracing::info!(job_id = %job_id, exit_code = ?exit_code, "Transfer process exited");
            let _ = tx.send(TransferOutcome {
                exit_code,
                stdout,
                stderr_tail,
            });
        });

        Ok(RunningTransfer {
            control: TransferControl::new(Some(pid), exited, spec.cleanup, self.grace),
            completion: TransferCompletion::new(rx),
        })
    }
}

async fn read_all(stdout: Option<tokio::process::ChildStdout>) -> String {
    let mut out = String::new();
    if let Some(mut stdout) = stdout {
        let _ = stdout.read_to_string(&mut out).await;
    }
    out
}

async fn read_tail(
    stderr: Option<tokio::process::ChildStderr>,
    keep: usize,
    job_id: String,
) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(keep);
    let Some(stderr) = stderr else {
        return Vec::new();
    };

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(job_id = %job_id, "transfer: {}", line);
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use tokio::sync::Mutex;

    /// Launcher whose transfers finish when the test says so
    #[derive(Default)]
    pub struct MockLauncher {
        launched: Mutex<Vec<LaunchSpec>>,
        pending: Mutex<Vec<(String, oneshot::Sender<TransferOutcome>, Arc<AtomicBool>)>>,
        fail_launch: AtomicBool,
        launch_delay_ms: std::sync::atomic::AtomicU64,
    }

    impl MockLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_launch(&self, fail: bool) {
            self.fail_launch.store(fail, Ordering::SeqCst);
        }

        /// Make `launch` take this long, as a slow process spawn would
        pub fn set_launch_delay(&self, delay: Duration) {
            self.launch_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        pub async fn launched(&self) -> Vec<LaunchSpec> {
            self.launched.lock().await.clone()
        }

        /// Finish the transfer for a job; false if none is pending
        pub async fn finish(&self, job_id: &str, outcome: TransferOutcome) -> bool {
            let mut pending = self.pending.lock().await;
            let Some(pos) = pending.iter().position(|(id, _, _)| id == job_id) else {
                return false;
            };
            let (_, tx, exited) = pending.remove(pos);
            exited.store(true, Ordering::SeqCst);
            tx.send(outcome).is_ok()
        }
    }

    #[async_trait]
    impl TransferLauncher for MockLauncher {
        async fn launch(&self, spec: LaunchSpec) -> Result<RunningTransfer> {
            if self.fail_launch.load(Ordering::SeqCst) {
                anyhow::bail!("mock launch failure");
            }
            let delay = self.launch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let (tx, rx) = oneshot::channel();
            let exited = Arc::new(AtomicBool::new(false));
            self.pending
                .lock()
                .await
                .push((spec.job_id.clone(), tx, exited.clone()));
            let control = TransferControl::new(None, exited, spec.cleanup.clone(), Duration::ZERO);
            self.launched.lock().await.push(spec);
            Ok(RunningTransfer {
                control,
                completion: TransferCompletion::new(rx),
            })
        }
    }
}
