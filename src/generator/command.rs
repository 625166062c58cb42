//! External-command generator.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use super::{GenerateRequest, PatchGenerator};
use crate::error::{DevloopError, Result};
use crate::patch::RawPatch;
use crate::process::{ProcessExit, ShellCommand, run_shell};

/// Stderr kept in a generator error message.
const STDERR_TAIL_CHARS: usize = 2000;

/// Runs a shell command per attempt.
///
/// The command receives the request as JSON on stdin, plus `DEVLOOP_ATTEMPT`
/// and `DEVLOOP_MODE` in its environment, and prints a unified diff on
/// stdout.
pub struct CommandGenerator {
    command: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PatchGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerateRequest, cancel: &CancellationToken) -> Result<RawPatch> {
        let input = serde_json::to_vec(request)?;
        let shell = ShellCommand::new(self.command.clone(), self.cwd.clone())
            .with_timeout(self.timeout)
            .with_env("DEVLOOP_ATTEMPT", request.attempt.to_string())
            .with_env("DEVLOOP_MODE", request.mode.as_str())
            .with_stdin(input);

        info!("generator: attempt {} ({}) via '{}'", request.attempt, request.mode.as_str(), self.command);
        let output = run_shell(&shell, cancel).await;
        debug!(
            "generator: {:?} in {}ms, {} bytes",
            output.exit,
            output.duration.as_millis(),
            output.stdout.len()
        );

        match output.exit {
            ProcessExit::Exited(Some(0)) => Ok(RawPatch::new(output.stdout)),
            ProcessExit::Cancelled => Ok(RawPatch::new(String::new())),
            ProcessExit::TimedOut => Err(DevloopError::Generator(format!(
                "'{}' timed out after {}s",
                self.command,
                self.timeout.as_secs()
            ))),
            ProcessExit::SpawnFailed(msg) => {
                Err(DevloopError::Generator(format!("failed to start '{}': {}", self.command, msg)))
            }
            ProcessExit::Exited(code) => {
                let stderr = output.stderr.trim();
                let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
                let tail: String = stderr.chars().skip(skip).collect();
                Err(DevloopError::Generator(format!(
                    "'{}' exited with {}: {}",
                    self.command,
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    tail
                )))
            }
        }
    }

    fn description(&self) -> String {
        format!("command: {}", self.command)
    }
}
