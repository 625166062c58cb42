//! Scoped subprocess execution.
//!
//! `run_shell` owns the child for its whole lifetime: the child is spawned
//! with `kill_on_drop` as the leader of its own process group, and on timeout
//! or cancellation the whole group is killed and the shell reaped before the
//! call returns. Pipe readers are detached tasks that get a short grace
//! period once the child is gone; a group member still holding a pipe after
//! that is killed too.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for pipe readers after a normal exit.
const EXIT_DRAIN: Duration = Duration::from_secs(2);
/// Grace period for pipe readers after a kill.
const KILL_DRAIN: Duration = Duration::from_millis(250);

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_000_000;

/// A `sh -c` invocation.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub max_output_bytes: usize,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout: Duration::from_secs(600),
            env: Vec::new(),
            stdin: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exit code, `None` when terminated by a signal
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited(Some(0))
    }
}

enum Waited {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run a shell command to completion, timeout or cancellation.
pub async fn run_shell(spec: &ShellCommand, cancel: &CancellationToken) -> ProcessOutput {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.cwd)
        .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("spawn failed for {:?}: {}", spec.command, e);
            return ProcessOutput {
                exit: ProcessExit::SpawnFailed(e.to_string()),
                stdout: String::new(),
                stderr: String::new(),
                duration: start.elapsed(),
            };
        }
    };
    let pid = child.id();
    debug!("spawned pid={:?}: {}", pid, spec.command);

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, stdout_buf.clone(), spec.max_output_bytes)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, stderr_buf.clone(), spec.max_output_bytes)));

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // a child that exits without reading stdin is not an error here
            if let Err(e) = stdin.write_all(&input).await {
                debug!("stdin write ended early: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Status(status),
        _ = tokio::time::sleep(spec.timeout) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let (exit, grace) = match waited {
        Waited::Status(Ok(status)) => (ProcessExit::Exited(status.code()), EXIT_DRAIN),
        Waited::Status(Err(e)) => {
            terminate(&mut child, pid).await;
            (ProcessExit::SpawnFailed(e.to_string()), KILL_DRAIN)
        }
        Waited::TimedOut => {
            warn!("timed out after {:?}: {}", spec.timeout, spec.command);
            terminate(&mut child, pid).await;
            (ProcessExit::TimedOut, KILL_DRAIN)
        }
        Waited::Cancelled => {
            warn!("cancelled: {}", spec.command);
            terminate(&mut child, pid).await;
            (ProcessExit::Cancelled, KILL_DRAIN)
        }
    };

    let lingering_out = !drain(stdout_task, grace).await;
    let lingering_err = !drain(stderr_task, grace).await;
    if lingering_out || lingering_err {
        // a backgrounded grandchild outlived the shell
        kill_group(pid);
    }

    ProcessOutput {
        exit,
        stdout: snapshot(&stdout_buf),
        stderr: snapshot(&stderr_buf),
        duration: start.elapsed(),
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        warn!("failed to kill pid={:?}: {}", child.id(), e);
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>, cap: usize) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut out) = sink.lock() {
                    let room = cap.saturating_sub(out.len());
                    out.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill process group {}: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Wait for a pipe reader; false when it had to be aborted.
async fn drain(task: Option<JoinHandle<()>>, grace: Duration) -> bool {
    let Some(mut task) = task else {
        return true;
    };
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        // a grandchild still holds the pipe open
        task.abort();
        return false;
    }
    true
}

fn snapshot(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    match buf.lock() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}
