//! Run event records, appended to `events.jsonl`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::now_ms;

/// Event type constants
pub mod event_types {
    pub const RUN_STARTED: &str = "run_started";
    pub const TREE_DIRTY: &str = "tree_dirty";
    pub const STATE_CHANGED: &str = "state_changed";
    pub const PATCH_GENERATED: &str = "patch_generated";
    pub const PATCH_REJECTED: &str = "patch_rejected";
    pub const PATCH_VALIDATED: &str = "patch_validated";
    pub const SCOPE_EXPANSION_APPROVED: &str = "scope_expansion_approved";
    pub const APPLY_COMPLETE: &str = "apply_complete";
    pub const VERIFY_STEP: &str = "verify_step";
    pub const FAILURE_CLASSIFIED: &str = "failure_classified";
    pub const RUN_FINISHED: &str = "run_finished";
}

/// One line of the run's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    /// Position in the log, assigned on append
    #[serde(default)]
    pub seq: u64,
    pub event_type: String,
    pub attempt: Option<u32>,
    pub payload: Value,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl RunEvent {
    pub fn new(event_type: &str, attempt: Option<u32>, payload: Value) -> Self {
        Self {
            seq: 0,
            event_type: event_type.to_string(),
            attempt,
            payload,
            created_at: now_ms(),
        }
    }

    pub fn run_started(run_id: &str, task: &str, allowed_files: &[String], max_attempts: u32) -> Self {
        Self::new(
            event_types::RUN_STARTED,
            None,
            serde_json::json!({
                "run_id": run_id,
                "task": task,
                "allowed_files": allowed_files,
                "max_attempts": max_attempts
            }),
        )
    }

    pub fn tree_dirty(status: &str) -> Self {
        Self::new(event_types::TREE_DIRTY, None, serde_json::json!({ "status": status }))
    }

    pub fn state_changed(attempt: u32, from: &str, to: &str) -> Self {
        Self::new(
            event_types::STATE_CHANGED,
            Some(attempt),
            serde_json::json!({ "from": from, "to": to }),
        )
    }

    pub fn patch_generated(attempt: u32, mode: &str, bytes: usize) -> Self {
        Self::new(
            event_types::PATCH_GENERATED,
            Some(attempt),
            serde_json::json!({ "mode": mode, "bytes": bytes }),
        )
    }

    pub fn patch_rejected(attempt: u32, violations: &[String]) -> Self {
        Self::new(
            event_types::PATCH_REJECTED,
            Some(attempt),
            serde_json::json!({ "violations": violations }),
        )
    }

    pub fn patch_validated(attempt: u32, files: &[String]) -> Self {
        Self::new(
            event_types::PATCH_VALIDATED,
            Some(attempt),
            serde_json::json!({ "files": files }),
        )
    }

    pub fn scope_expansion_approved(attempt: u32, paths: &[String], approved_by: &[String]) -> Self {
        Self::new(
            event_types::SCOPE_EXPANSION_APPROVED,
            Some(attempt),
            serde_json::json!({ "paths": paths, "approved_by": approved_by }),
        )
    }

    pub fn apply_complete(attempt: u32, outcome: &str, files: &[String]) -> Self {
        Self::new(
            event_types::APPLY_COMPLETE,
            Some(attempt),
            serde_json::json!({ "outcome": outcome, "files": files }),
        )
    }

    pub fn verify_step(attempt: u32, step: &str, exit: &str, duration_ms: u64) -> Self {
        Self::new(
            event_types::VERIFY_STEP,
            Some(attempt),
            serde_json::json!({
                "step": step,
                "exit": exit,
                "duration_ms": duration_ms
            }),
        )
    }

    pub fn failure_classified(attempt: u32, tag: &str, summary: &str) -> Self {
        Self::new(
            event_types::FAILURE_CLASSIFIED,
            Some(attempt),
            serde_json::json!({ "tag": tag, "summary": summary }),
        )
    }

    pub fn run_finished(attempt: u32, status: &str, summary: &str) -> Self {
        Self::new(
            event_types::RUN_FINISHED,
            Some(attempt),
            serde_json::json!({ "status": status, "summary": summary }),
        )
    }

    pub fn is_attempt_event(&self) -> bool {
        self.attempt.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_event_new() {
        let event = RunEvent::new("custom", Some(2), Value::Null);
        assert_eq!(event.seq, 0);
        assert_eq!(event.event_type, "custom");
        assert_eq!(event.attempt, Some(2));
        assert!(event.created_at > 0);
        assert!(event.is_attempt_event());
    }

    #[test]
    fn test_run_started() {
        let files = vec!["src/lib.rs".to_string()];
        let event = RunEvent::run_started("20261018-142501000-abcd", "fix it", &files, 3);
        assert_eq!(event.event_type, event_types::RUN_STARTED);
        assert!(!event.is_attempt_event());
        assert_eq!(event.payload["allowed_files"][0], "src/lib.rs");
        assert_eq!(event.payload["max_attempts"], 3);
    }

    #[test]
    fn test_state_changed() {
        let event = RunEvent::state_changed(1, "generate", "validate");
        assert_eq!(event.event_type, event_types::STATE_CHANGED);
        assert_eq!(event.payload["from"], "generate");
        assert_eq!(event.payload["to"], "validate");
    }

    #[test]
    fn test_scope_expansion_approved() {
        let paths = vec!["docs/a.md".to_string()];
        let by = vec!["reviewer".to_string()];
        let event = RunEvent::scope_expansion_approved(2, &paths, &by);
        assert_eq!(event.attempt, Some(2));
        assert_eq!(event.payload["paths"][0], "docs/a.md");
        assert_eq!(event.payload["approved_by"][0], "reviewer");
    }

    #[test]
    fn test_event_roundtrips_through_json_line() {
        let mut event = RunEvent::verify_step(1, "pytest", "exit code 1", 40);
        event.seq = 7;
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        let back: RunEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }
}
