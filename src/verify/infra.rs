//! Infra Guard: recognizes environment failures that no code change fixes.

use serde::{Deserialize, Serialize};

use super::runner::{StepExit, VerifyStep};

/// Signatures used when configuration supplies none.
pub const DEFAULT_INFRA_SIGNATURES: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "Error response from daemon",
    "no such service",
    "port is already allocated",
    "address already in use",
    "connection refused",
    "dial tcp",
    "context deadline exceeded",
    "i/o timeout",
    "no such host",
    "No rule to make target",
    "command not found",
];

/// Signature recorded for a step that never started.
pub const SPAWN_FAILED_SIGNATURE: &str = "spawn failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraMatch {
    pub signature: String,
    /// First output line containing the signature
    pub line: String,
}

#[derive(Debug, Clone)]
pub struct InfraGuard {
    signatures: Vec<String>,
    lowered: Vec<String>,
}

impl Default for InfraGuard {
    fn default() -> Self {
        Self::new(DEFAULT_INFRA_SIGNATURES.iter().copied())
    }
}

impl InfraGuard {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let signatures: Vec<String> = signatures
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        let lowered = signatures.iter().map(|s| s.to_lowercase()).collect();
        Self { signatures, lowered }
    }

    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Earliest output line matching any signature, case-insensitively.
    pub fn detect(&self, output: &str) -> Option<InfraMatch> {
        for line in output.lines() {
            let lower = line.to_lowercase();
            for (idx, sig) in self.lowered.iter().enumerate() {
                if lower.contains(sig.as_str()) {
                    return Some(InfraMatch {
                        signature: self.signatures[idx].clone(),
                        line: line.trim().to_string(),
                    });
                }
            }
        }
        None
    }

    /// Inspect a failed step. A step that never started is always infra.
    pub fn inspect(&self, step: &VerifyStep) -> Option<InfraMatch> {
        if let StepExit::SpawnFailed { message } = &step.exit {
            return Some(InfraMatch {
                signature: SPAWN_FAILED_SIGNATURE.to_string(),
                line: message.clone(),
            });
        }
        self.detect(&step.stderr).or_else(|| self.detect(&step.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::failure::ToolKind;

    fn step(stdout: &str, stderr: &str, exit: StepExit) -> VerifyStep {
        VerifyStep {
            name: "test".to_string(),
            command: "make test".to_string(),
            tool: ToolKind::Generic,
            cwd: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit,
            duration_ms: 5,
        }
    }

    #[test]
    fn test_detect_case_insensitive() {
        let guard = InfraGuard::default();
        let found = guard
            .detect("starting db\npsycopg2.OperationalError: Connection Refused on 5432\n")
            .unwrap();
        assert_eq!(found.signature, "connection refused");
        assert!(found.line.contains("5432"));
    }

    #[test]
    fn test_detect_none_for_code_failures() {
        let guard = InfraGuard::default();
        assert!(guard.detect("AssertionError: 1 != 2").is_none());
    }

    #[test]
    fn test_custom_signatures_replace_defaults() {
        let guard = InfraGuard::new(["quota exceeded", "  "]);
        assert_eq!(guard.signatures().len(), 1);
        assert!(guard.detect("connection refused").is_none());
        assert!(guard.detect("API Quota Exceeded").is_some());
    }

    #[test]
    fn test_spawn_failure_is_infra() {
        let guard = InfraGuard::new(Vec::<String>::new());
        let found = guard
            .inspect(&step(
                "",
                "",
                StepExit::SpawnFailed {
                    message: "No such file or directory".to_string(),
                },
            ))
            .unwrap();
        assert_eq!(found.signature, SPAWN_FAILED_SIGNATURE);
    }

    #[test]
    fn test_inspect_checks_both_streams() {
        let guard = InfraGuard::default();
        let found = guard
            .inspect(&step("sh: 1: pytest: command not found", "", StepExit::Code { code: 127 }))
            .unwrap();
        assert_eq!(found.signature, "command not found");
    }
}
