//! Sandbox executor: one fresh context per execution.
//!
//! Lifecycle of [`SandboxExecutor::execute`]:
//! provision scratch → stage files → launch via backend in a fresh process
//! group → wait with hard timeout → kill the group → collect bounded output
//! → measure scratch → destroy scratch. The context is destroyed on every
//! path, including errors and cancellation, because the scratch `TempDir`
//! and the process group are owned by the call.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics::METRICS;
use crate::obs;

use super::backend::{IsolationBackend, LaunchSpec};
use super::error::{SandboxError, SandboxResult};
use super::request::{
    ExitInfo, OutputStream, ResourceUsage, SandboxExecutionResult, SandboxLimits, SandboxRequest,
    SandboxTask, Violation,
};

/// How long output readers may keep running after the group was killed.
const READER_GRACE: Duration = Duration::from_secs(2);

const SIGXCPU: i32 = 24;
const SIGXFSZ: i32 = 25;

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        request: &SandboxRequest,
        limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult>;

    /// Contexts currently provisioned and not yet destroyed.
    fn live_contexts(&self) -> usize;

    /// Whether the underlying backend confines the task.
    fn is_isolating(&self) -> bool;
}

/// The task's process group. Every member gets `SIGKILL` when the group is
/// killed or dropped, so background children cannot outlive the task.
struct ProcessGroup(Option<i32>);

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self(child.id().and_then(|id| i32::try_from(id).ok()))
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    // SAFETY: killpg only sends a signal to the group this call created.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: every member already exited.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "failed to kill sandbox process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Decrements the live-context counter when the context goes away.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SandboxExecutor {
    backend: Arc<dyn IsolationBackend>,
    scratch_root: Option<PathBuf>,
    live: Arc<AtomicUsize>,
    diagnostics: Arc<Semaphore>,
}

impl SandboxExecutor {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend,
            scratch_root: None,
            live: Arc::new(AtomicUsize::new(0)),
            diagnostics: Arc::new(Semaphore::new(4)),
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_max_concurrent_diagnostics(mut self, n: usize) -> Self {
        self.diagnostics = Arc::new(Semaphore::new(n.max(1)));
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Ad hoc execution outside a cycle. At most
    /// `max_concurrent_diagnostics` run at once; each gets its own context.
    pub async fn execute_diagnostic(
        &self,
        request: &SandboxRequest,
        limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult> {
        let _permit = self
            .diagnostics
            .acquire()
            .await
            .map_err(|e| SandboxError::BackendUnavailable(e.to_string()))?;
        self.run(request, limits).await
    }

    fn provision(&self) -> SandboxResult<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ratchet-sbx-");
        match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(SandboxError::Provision)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Provision)
    }

    async fn run(
        &self,
        request: &SandboxRequest,
        limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult> {
        limits.validate()?;
        request.validate()?;

        let _live = LiveGuard::new(&self.live);
        let scratch = self.provision()?;
        let result = self.run_in(scratch.path(), request, limits).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), error = %e, "failed to remove sandbox scratch");
        }
        result
    }

    async fn run_in(
        &self,
        scratch: &Path,
        request: &SandboxRequest,
        limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult> {
        request.files.write_to(scratch)?;

        let argv = match &request.task {
            SandboxTask::Command { argv } => argv.clone(),
            SandboxTask::Script {
                interpreter,
                file_name,
                source,
            } => {
                let path = scratch.join(file_name);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| SandboxError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                std::fs::write(&path, source).map_err(|source| SandboxError::Io {
                    path: path.clone(),
                    source,
                })?;
                vec![interpreter.clone(), file_name.clone()]
            }
        };

        let spec = LaunchSpec {
            scratch,
            argv: &argv,
            limits,
            env: &request.env,
        };
        let mut cmd = self.backend.command(&spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Launch {
            program: argv.first().cloned().unwrap_or_default(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);
        METRICS.inc_sandbox_runs();
        debug!(backend = self.backend.name(), argv = ?argv, "sandbox task launched");

        let limit = limits.max_output_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit)));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit)));

        let timeout = Duration::from_millis(limits.timeout_ms);
        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status.ok(), false),
            Err(_) => {
                group.kill();
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out sandbox task");
                }
                (child.wait().await.ok(), true)
            }
        };
        group.kill();
        let duration_ms = start.elapsed().as_millis() as u64;

        let (stdout, out_truncated) = collect(stdout).await;
        let (stderr, err_truncated) = collect(stderr).await;

        let mut violations = Vec::new();
        if timed_out {
            METRICS.inc_sandbox_timeouts();
            violations.push(Violation::Timeout {
                limit_ms: limits.timeout_ms,
            });
        }
        if out_truncated {
            violations.push(Violation::OutputTruncated {
                stream: OutputStream::Stdout,
                limit_bytes: limit,
            });
        }
        if err_truncated {
            violations.push(Violation::OutputTruncated {
                stream: OutputStream::Stderr,
                limit_bytes: limit,
            });
        }

        let mut exit = ExitInfo {
            code: status.and_then(|s| s.code()),
            signal: None,
            timed_out,
        };
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            exit.signal = status.and_then(|s| s.signal());
        }
        if !timed_out {
            match exit.signal {
                Some(SIGXCPU) => violations.push(Violation::ResourceLimit {
                    resource: "cpu".to_string(),
                    signal: SIGXCPU,
                }),
                Some(SIGXFSZ) => violations.push(Violation::ResourceLimit {
                    resource: "file_size".to_string(),
                    signal: SIGXFSZ,
                }),
                _ => {}
            }
        }

        let scratch_bytes = dir_size(scratch);
        let quota_bytes = limits.scratch_quota_mb * 1024 * 1024;
        if scratch_bytes > quota_bytes {
            violations.push(Violation::ScratchQuotaExceeded {
                used_bytes: scratch_bytes,
                quota_bytes,
            });
        }

        let success = status.is_some_and(|s| s.success()) && violations.is_empty();
        obs::emit_sandbox_run(success, timed_out, duration_ms, violations.len());

        Ok(SandboxExecutionResult {
            success,
            resource_usage: ResourceUsage {
                scratch_bytes,
                stdout_bytes: stdout.len() as u64,
                stderr_bytes: stderr.len() as u64,
            },
            stdout,
            stderr,
            exit,
            duration_ms,
            violations,
        })
    }
}

#[async_trait]
impl Sandbox for SandboxExecutor {
    async fn execute(
        &self,
        request: &SandboxRequest,
        limits: &SandboxLimits,
    ) -> SandboxResult<SandboxExecutionResult> {
        self.run(request, limits).await
    }

    fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn is_isolating(&self) -> bool {
        self.backend.is_isolating()
    }
}

/// Keep the first `limit` bytes; drain and drop the rest so the task never
/// blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

/// Await a reader, giving up after [`READER_GRACE`] (a process that left the
/// task's group may still hold the pipe open).
async fn collect(
    handle: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
) -> (String, bool) {
    let Some(mut handle) = handle else {
        return (String::new(), false);
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(e)) => {
            warn!(error = %e, "sandbox output reader failed");
            (String::new(), false)
        }
        Err(_) => {
            handle.abort();
            warn!("sandbox output reader did not finish; output dropped");
            (String::new(), false)
        }
    }
}

fn dir_size(root: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.metadata() {
                Ok(m) if m.is_dir() => stack.push(entry.path()),
                Ok(m) => total += m.len(),
                Err(_) => {}
            }
        }
    }
    total
}
