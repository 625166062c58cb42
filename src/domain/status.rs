//! Loop states and the terminal status of a run.

use serde::{Deserialize, Serialize};

use crate::verify::FailureReport;

/// State of the orchestrator's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Plan,
    Generate,
    Validate,
    Apply,
    Verify,
    Fix,
    Success,
    MaxAttemptsExceeded,
    Halt,
    Cancelled,
}

impl LoopState {
    /// Check if this state ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Success | LoopState::MaxAttemptsExceeded | LoopState::Halt | LoopState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Plan => "plan",
            LoopState::Generate => "generate",
            LoopState::Validate => "validate",
            LoopState::Apply => "apply",
            LoopState::Verify => "verify",
            LoopState::Fix => "fix",
            LoopState::Success => "success",
            LoopState::MaxAttemptsExceeded => "max_attempts_exceeded",
            LoopState::Halt => "halt",
            LoopState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a run ended. Persisted as `result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Verification passed, or the change was already present
    Success { attempts: u32, noop: bool },
    /// An environment failure no code change can fix
    Halted {
        attempt: u32,
        signature: String,
        line: String,
        step: Option<String>,
    },
    MaxAttemptsExceeded {
        attempts: u32,
        last_failure: Option<FailureReport>,
    },
    Cancelled { attempt: u32 },
}

impl RunStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success { .. } => 0,
            RunStatus::Halted { .. } => 2,
            RunStatus::MaxAttemptsExceeded { .. } => 3,
            RunStatus::Cancelled { .. } => 4,
        }
    }

    pub fn state(&self) -> LoopState {
        match self {
            RunStatus::Success { .. } => LoopState::Success,
            RunStatus::Halted { .. } => LoopState::Halt,
            RunStatus::MaxAttemptsExceeded { .. } => LoopState::MaxAttemptsExceeded,
            RunStatus::Cancelled { .. } => LoopState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success { .. })
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        match self {
            RunStatus::Success { attempts, noop: true } => {
                format!("SUCCESS after {} attempt(s): patch was already applied", attempts)
            }
            RunStatus::Success { attempts, noop: false } => format!("SUCCESS after {} attempt(s)", attempts),
            RunStatus::Halted {
                attempt,
                signature,
                step,
                ..
            } => match step {
                Some(step) => format!(
                    "HALT on attempt {}: infrastructure failure in step '{}' (signature: {})",
                    attempt, step, signature
                ),
                None => format!("HALT on attempt {}: infrastructure failure (signature: {})", attempt, signature),
            },
            RunStatus::MaxAttemptsExceeded { attempts, last_failure } => match last_failure {
                Some(report) => format!("MAX_ATTEMPTS_EXCEEDED after {}: last failure {}", attempts, report.summary()),
                None => format!("MAX_ATTEMPTS_EXCEEDED after {}", attempts),
            },
            RunStatus::Cancelled { attempt } => format!("CANCELLED during attempt {}", attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::FailureTag;

    #[test]
    fn test_terminal_states() {
        assert!(LoopState::Success.is_terminal());
        assert!(LoopState::Halt.is_terminal());
        assert!(LoopState::Cancelled.is_terminal());
        assert!(LoopState::MaxAttemptsExceeded.is_terminal());
        assert!(!LoopState::Fix.is_terminal());
        assert!(!LoopState::Plan.is_terminal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success { attempts: 1, noop: false }.exit_code(), 0);
        let halted = RunStatus::Halted {
            attempt: 1,
            signature: "connection refused".to_string(),
            line: "dial tcp: connection refused".to_string(),
            step: Some("tests".to_string()),
        };
        assert_eq!(halted.exit_code(), 2);
        assert!(halted.summary().contains("connection refused"));
        assert_eq!(
            RunStatus::MaxAttemptsExceeded {
                attempts: 3,
                last_failure: None
            }
            .exit_code(),
            3
        );
        assert_eq!(RunStatus::Cancelled { attempt: 2 }.exit_code(), 4);
    }

    #[test]
    fn test_max_attempts_summary_names_last_failure() {
        let status = RunStatus::MaxAttemptsExceeded {
            attempts: 3,
            last_failure: Some(FailureReport::new(3, FailureTag::CodeFailure, "boom")),
        };
        assert!(status.summary().contains("attempt 3: code"));
        assert_eq!(status.state(), LoopState::MaxAttemptsExceeded);
    }

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_value(RunStatus::Success { attempts: 2, noop: true }).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["noop"], true);
    }
}
