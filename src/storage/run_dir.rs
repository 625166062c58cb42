//! The run directory: one per run, written only through `RunContext`.
//!
//! Every artifact is opened with create-new semantics. `events.jsonl` is the
//! only file that grows, and only by appending.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::domain::{RunEvent, RunStatus, ScopeApproval, Task};
use crate::error::{DevloopError, Result};
use crate::id::{attempt_dir_name, generate_run_id};

pub const RUN_HEADER_FILE: &str = "run.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const RESULT_FILE: &str = "result.json";

/// Attempts at claiming a fresh run directory before giving up.
const CLAIM_RETRIES: usize = 16;

/// Snapshot of what a run started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub repo_root: PathBuf,
    pub task: Task,
    pub max_attempts: u32,
    pub generator: String,
    #[serde(default)]
    pub approvals: Vec<ScopeApproval>,
    /// Effective configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub summary: String,
    #[serde(flatten)]
    pub status: RunStatus,
}

/// Writer for a single run directory.
pub struct RunContext {
    run_id: String,
    dir: PathBuf,
    events: File,
    next_seq: u64,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Claim a new run directory under `runs_dir`.
    ///
    /// `create_dir` is atomic, so two concurrent runs never share a
    /// directory; on a collision a fresh id is drawn.
    pub fn create(runs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(runs_dir)?;

        for _ in 0..CLAIM_RETRIES {
            let run_id = generate_run_id();
            let dir = runs_dir.join(&run_id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let events = OpenOptions::new()
                        .create_new(true)
                        .append(true)
                        .open(dir.join(EVENTS_FILE))?;
                    debug!("run dir claimed: {:?}", dir);
                    return Ok(Self {
                        run_id,
                        dir,
                        events,
                        next_seq: 1,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(DevloopError::Storage(format!(
            "could not claim a run directory under {:?}",
            runs_dir
        )))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory for an attempt's artifacts, created on first use.
    pub fn attempt_dir(&self, attempt: u32) -> Result<PathBuf> {
        let dir = self.dir.join(attempt_dir_name(attempt));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Append an event, stamping its sequence number.
    pub fn append_event(&mut self, mut event: RunEvent) -> Result<RunEvent> {
        event.seq = self.next_seq;
        let line = serde_json::to_string(&event)?;
        writeln!(self.events, "{}", line)?;
        self.events.flush()?;
        self.next_seq += 1;
        Ok(event)
    }

    /// Write an artifact. `attempt` selects the attempt subdirectory; `name`
    /// may contain subdirectories. Fails if the artifact already exists.
    pub fn write_artifact(&self, attempt: Option<u32>, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(DevloopError::Storage(format!("invalid artifact name: {:?}", name)));
        }
        let base = match attempt {
            Some(n) => self.attempt_dir(n)?,
            None => self.dir.clone(),
        };
        let path = base.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DevloopError::Storage(format!("artifact already exists: {:?}", path)));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(content)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Write a pretty-printed JSON artifact.
    pub fn write_json<T: Serialize>(&self, attempt: Option<u32>, name: &str, value: &T) -> Result<PathBuf> {
        let mut content = serde_json::to_vec_pretty(value)?;
        content.push(b'\n');
        self.write_artifact(attempt, name, &content)
    }

    pub fn write_header(&self, header: &RunHeader) -> Result<PathBuf> {
        self.write_json(None, RUN_HEADER_FILE, header)
    }

    pub fn write_result(&self, result: &RunResult) -> Result<PathBuf> {
        self.write_json(None, RESULT_FILE, result)
    }
}

/// File-name-safe form of a step name.
pub fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "step".to_string() } else { cleaned }
}
