//! Verify Runner: executes the configured check chain in order.
//!
//! Stops at the first step that does not succeed. Timeouts fail the step
//! they happened in; cancellation stops the chain without counting as a
//! failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::failure::ToolKind;
use crate::process::{DEFAULT_MAX_OUTPUT_BYTES, ProcessExit, ShellCommand, run_shell};

/// A configured check, before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyStepSpec {
    pub name: String,
    pub command: String,
    pub tool: ToolKind,
    pub timeout: Duration,
    /// Repo-relative working directory
    pub cwd: Option<PathBuf>,
}

impl VerifyStepSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            tool: ToolKind::Generic,
            timeout: Duration::from_secs(600),
            cwd: None,
        }
    }

    pub fn with_tool(mut self, tool: ToolKind) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepExit {
    Code { code: i32 },
    Signal,
    TimedOut { after_ms: u64 },
    Cancelled,
    SpawnFailed { message: String },
}

impl StepExit {
    pub fn is_success(&self) -> bool {
        matches!(self, StepExit::Code { code: 0 })
    }

    pub fn describe(&self) -> String {
        match self {
            StepExit::Code { code } => format!("exit code {}", code),
            StepExit::Signal => "killed by signal".to_string(),
            StepExit::TimedOut { after_ms } => format!("timed out after {}ms", after_ms),
            StepExit::Cancelled => "cancelled".to_string(),
            StepExit::SpawnFailed { message } => format!("failed to start: {}", message),
        }
    }
}

/// A check that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyStep {
    pub name: String,
    pub command: String,
    pub tool: ToolKind,
    /// Repo-relative working directory the step ran in
    #[serde(default)]
    pub cwd: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit: StepExit,
    pub duration_ms: u64,
}

impl VerifyStep {
    pub fn succeeded(&self) -> bool {
        self.exit.is_success()
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyStatus {
    Passed,
    /// Index into `steps` of the failing step
    Failed { step: usize },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub steps: Vec<VerifyStep>,
    pub status: VerifyStatus,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.status == VerifyStatus::Passed
    }

    pub fn failed_step(&self) -> Option<&VerifyStep> {
        match self.status {
            VerifyStatus::Failed { step } => self.steps.get(step),
            _ => None,
        }
    }
}

pub struct VerifyRunner {
    steps: Vec<VerifyStepSpec>,
    max_output_bytes: usize,
}

impl VerifyRunner {
    pub fn new(steps: Vec<VerifyStepSpec>) -> Self {
        Self {
            steps,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn steps(&self) -> &[VerifyStepSpec] {
        &self.steps
    }

    /// Run the chain against `repo_root`.
    pub async fn run(&self, repo_root: &Path, cancel: &CancellationToken) -> VerifyReport {
        let mut steps = Vec::new();

        for spec in &self.steps {
            if cancel.is_cancelled() {
                info!("verify: cancelled before step '{}'", spec.name);
                return VerifyReport {
                    steps,
                    status: VerifyStatus::Cancelled,
                };
            }

            let cwd = match &spec.cwd {
                Some(sub) => repo_root.join(sub),
                None => repo_root.to_path_buf(),
            };
            let shell = ShellCommand::new(spec.command.clone(), cwd)
                .with_timeout(spec.timeout)
                .with_max_output_bytes(self.max_output_bytes);

            info!("verify: running '{}': {}", spec.name, spec.command);
            let output = run_shell(&shell, cancel).await;
            let exit = match output.exit {
                ProcessExit::Exited(Some(code)) => StepExit::Code { code },
                ProcessExit::Exited(None) => StepExit::Signal,
                ProcessExit::TimedOut => StepExit::TimedOut {
                    after_ms: spec.timeout.as_millis() as u64,
                },
                ProcessExit::Cancelled => StepExit::Cancelled,
                ProcessExit::SpawnFailed(message) => StepExit::SpawnFailed { message },
            };

            let step = VerifyStep {
                name: spec.name.clone(),
                command: spec.command.clone(),
                tool: spec.tool,
                cwd: spec.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                stdout: output.stdout,
                stderr: output.stderr,
                exit,
                duration_ms: output.duration.as_millis() as u64,
            };
            let index = steps.len();
            let status = match &step.exit {
                StepExit::Cancelled => Some(VerifyStatus::Cancelled),
                exit if exit.is_success() => None,
                exit => {
                    warn!("verify: step '{}' failed: {}", step.name, exit.describe());
                    Some(VerifyStatus::Failed { step: index })
                }
            };
            steps.push(step);

            if let Some(status) = status {
                return VerifyReport { steps, status };
            }
        }

        VerifyReport {
            steps,
            status: VerifyStatus::Passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_all_steps_pass() {
        let dir = TempDir::new().unwrap();
        let runner = VerifyRunner::new(vec![VerifyStepSpec::new("one", "true"), VerifyStepSpec::new("two", "echo ok")]);
        let report = runner.run(dir.path(), &CancellationToken::new()).await;
        assert!(report.passed());
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let runner = VerifyRunner::new(vec![
            VerifyStepSpec::new("lint", "echo bad >&2; exit 1"),
            VerifyStepSpec::new("test", "touch ran"),
        ]);
        let report = runner.run(dir.path(), &CancellationToken::new()).await;
        assert_eq!(report.status, VerifyStatus::Failed { step: 0 });
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.failed_step().unwrap().exit, StepExit::Code { code: 1 });
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_step_and_skips_rest() {
        let dir = TempDir::new().unwrap();
        let runner = VerifyRunner::new(vec![
            VerifyStepSpec::new("slow", "sleep 30").with_timeout(Duration::from_millis(200)),
            VerifyStepSpec::new("after", "touch ran"),
        ]);
        let report = runner.run(dir.path(), &CancellationToken::new()).await;
        assert_eq!(report.status, VerifyStatus::Failed { step: 0 });
        assert_eq!(report.steps[0].exit, StepExit::TimedOut { after_ms: 200 });
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = VerifyRunner::new(vec![VerifyStepSpec::new("one", "true")]);
        let report = runner.run(dir.path(), &cancel).await;
        assert_eq!(report.status, VerifyStatus::Cancelled);
        assert!(report.steps.is_empty());
    }

    #[tokio::test]
    async fn test_step_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let runner = VerifyRunner::new(vec![VerifyStepSpec::new("pwd", "touch here").with_cwd("sub")]);
        let report = runner.run(dir.path(), &CancellationToken::new()).await;
        assert!(report.passed());
        assert!(dir.path().join("sub/here").exists());
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let dir = TempDir::new().unwrap();
        let report = VerifyRunner::new(vec![]).run(dir.path(), &CancellationToken::new()).await;
        assert!(report.passed());
    }

    #[test]
    fn test_combined_output() {
        let step = VerifyStep {
            name: "x".to_string(),
            command: "x".to_string(),
            tool: ToolKind::Generic,
            cwd: None,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit: StepExit::Code { code: 1 },
            duration_ms: 1,
        };
        assert_eq!(step.combined_output(), "out\nerr");
        assert_eq!(step.exit.describe(), "exit code 1");
    }
}
