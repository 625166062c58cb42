//! Reading past runs back from the runs directory.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::warn;
use serde::de::DeserializeOwned;

use super::run_dir::{EVENTS_FILE, RESULT_FILE, RUN_HEADER_FILE, RunHeader, RunResult};
use crate::domain::RunEvent;
use crate::error::{DevloopError, Result};

/// One line of `devloop runs list`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub dir: PathBuf,
    pub header: Option<RunHeader>,
    /// `None` while the run is in progress, or if it died
    pub result: Option<RunResult>,
}

/// Everything recorded for a run.
#[derive(Debug, Clone)]
pub struct RunDetails {
    pub summary: RunSummary,
    pub events: Vec<RunEvent>,
    /// Attempt directory names, in order
    pub attempts: Vec<String>,
}

/// All runs under `runs_dir`, oldest first.
pub fn list_runs(runs_dir: &Path) -> Result<Vec<RunSummary>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        runs.push(summarize(run_id, entry.path()));
    }

    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(runs)
}

/// Load one run by id.
pub fn load_run(runs_dir: &Path, run_id: &str) -> Result<RunDetails> {
    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
        return Err(DevloopError::Storage(format!("invalid run id: {:?}", run_id)));
    }
    let dir = runs_dir.join(run_id);
    if !dir.is_dir() {
        return Err(DevloopError::Storage(format!("run not found: {}", run_id)));
    }

    let events = read_events(&dir.join(EVENTS_FILE))?;
    let mut attempts: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.starts_with("attempt-"))
        .collect();
    attempts.sort();

    Ok(RunDetails {
        summary: summarize(run_id.to_string(), dir),
        events,
        attempts,
    })
}

/// Parse an `events.jsonl` file. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            events.push(serde_json::from_str(&line)?);
        }
    }
    Ok(events)
}

fn summarize(run_id: String, dir: PathBuf) -> RunSummary {
    RunSummary {
        header: read_optional(&dir.join(RUN_HEADER_FILE)),
        result: read_optional(&dir.join(RESULT_FILE)),
        run_id,
        dir,
    }
}

/// A missing or unreadable file is reported as absent; listing never fails
/// because of one broken run.
fn read_optional<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring unreadable {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, Task};
    use crate::storage::RunContext;
    use chrono::Utc;
    use tempfile::TempDir;

    fn finished_run(runs_dir: &Path) -> String {
        let mut ctx = RunContext::create(runs_dir).unwrap();
        ctx.write_header(&RunHeader {
            run_id: ctx.run_id().to_string(),
            started_at: Utc::now(),
            repo_root: PathBuf::from("/repo"),
            task: Task::new("fix", ["a.rs"]),
            max_attempts: 3,
            generator: "scripted".to_string(),
            approvals: vec![],
            config: serde_json::Value::Null,
        })
        .unwrap();
        ctx.append_event(RunEvent::state_changed(1, "plan", "generate")).unwrap();
        ctx.write_artifact(Some(1), "patch.raw.diff", b"").unwrap();
        let status = RunStatus::Success { attempts: 1, noop: false };
        ctx.write_result(&RunResult {
            run_id: ctx.run_id().to_string(),
            finished_at: Utc::now(),
            exit_code: 0,
            summary: status.summary(),
            status,
        })
        .unwrap();
        ctx.run_id().to_string()
    }

    #[test]
    fn test_list_runs_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert!(list_runs(&temp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_list_and_load() {
        let temp = TempDir::new().unwrap();
        let id = finished_run(temp.path());
        fs::write(temp.path().join("stray.txt"), "x").unwrap();

        let runs = list_runs(temp.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, id);
        assert_eq!(runs[0].header.as_ref().unwrap().task.description, "fix");
        assert!(runs[0].result.as_ref().unwrap().status.is_success());

        let details = load_run(temp.path(), &id).unwrap();
        assert_eq!(details.events.len(), 1);
        assert_eq!(details.events[0].seq, 1);
        assert_eq!(details.attempts, vec!["attempt-01"]);
    }

    #[test]
    fn test_in_progress_run_has_no_result() {
        let temp = TempDir::new().unwrap();
        let ctx = RunContext::create(temp.path()).unwrap();
        let runs = list_runs(temp.path()).unwrap();
        assert_eq!(runs[0].run_id, ctx.run_id());
        assert!(runs[0].result.is_none());
        assert!(runs[0].header.is_none());
    }

    #[test]
    fn test_load_run_rejects_bad_ids() {
        let temp = TempDir::new().unwrap();
        assert!(load_run(temp.path(), "../etc").is_err());
        assert!(load_run(temp.path(), "").is_err());
        assert!(load_run(temp.path(), "20990101-000000000-ffff").is_err());
    }
}
