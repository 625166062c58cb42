//! End-to-end DevLoop runs
//!
//! Drives full runs against a scratch repository with a scripted generator
//! and shell verify steps.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use devloop::domain::{ApprovalSet, RunStatus, ScopeApproval, Task, event_types};
use devloop::generator::{GenerateMode, ScriptedGenerator};
use devloop::prompt::PromptRenderer;
use devloop::runner::{DevLoop, DevLoopConfig, RunOutcome};
use devloop::storage::{list_runs, load_run, read_events};
use devloop::verify::{FailureTag, ToolKind, VerifyStepSpec};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CALC: &str = "def add(a, b):\n    return a + b\n# end\n";

const INSERT_DOC: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,3 +1,4 @@
 def add(a, b):
+    \"\"\"Sum two numbers.\"\"\"
     return a + b
 # end
";

const TOUCH_SECRETS: &str = "\
--- /dev/null
+++ b/secrets/keys.env
@@ -0,0 +1 @@
+TOKEN=abc
";

struct Fixture {
    repo: TempDir,
    runs: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let repo = TempDir::new().unwrap();
        fs::write(repo.path().join("calc.py"), CALC).unwrap();
        Self {
            repo,
            runs: TempDir::new().unwrap(),
        }
    }

    fn config(&self, steps: Vec<VerifyStepSpec>) -> DevLoopConfig {
        let mut config = DevLoopConfig::new(self.repo.path(), self.runs.path());
        config.verify_steps = steps;
        config
    }

    fn read(&self, path: &str) -> String {
        fs::read_to_string(self.repo.path().join(path)).unwrap()
    }
}

async fn run(devloop: &DevLoop, task: Task) -> RunOutcome {
    devloop.run(task, &CancellationToken::new()).await.unwrap()
}

fn transitions_to(run_dir: &Path, state: &str) -> usize {
    read_events(&run_dir.join("events.jsonl"))
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_types::STATE_CHANGED && e.payload["to"] == state)
        .count()
}

fn new_file_patch(path: &str, line: &str) -> String {
    format!("--- /dev/null\n+++ b/{}\n@@ -0,0 +1 @@\n+{}\n", path, line)
}

#[tokio::test]
async fn test_single_hunk_applies_and_verifies() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::new([INSERT_DOC]));
    let config = fx.config(vec![VerifyStepSpec::new("doc", "grep -q 'Sum two numbers' calc.py")]);
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

    let outcome = run(&devloop, Task::new("document add", ["calc.py"])).await;

    assert_eq!(outcome.status, RunStatus::Success { attempts: 1, noop: false });
    assert_eq!(outcome.status.exit_code(), 0);
    assert_eq!(fx.read("calc.py").lines().count(), 4);
    assert_eq!(generator.calls(), 1);

    let attempt = outcome.run_dir.join("attempt-01");
    for artifact in [
        "request.json",
        "patch.raw.diff",
        "patch.normalized.diff",
        "validation.json",
        "apply.json",
        "verify/01-doc.log",
    ] {
        assert!(attempt.join(artifact).exists(), "missing {}", artifact);
    }
    assert!(!attempt.join("failure.json").exists());
}

#[tokio::test]
async fn test_resubmitted_patch_is_noop() {
    let fx = Fixture::new();
    let config = fx.config(vec![VerifyStepSpec::new("ok", "true")]);

    let first = DevLoop::new(
        Arc::new(ScriptedGenerator::new([INSERT_DOC])),
        PromptRenderer::new().unwrap(),
        config.clone(),
    );
    run(&first, Task::new("document add", ["calc.py"])).await;
    let modified = fx.read("calc.py");
    let mtime = fs::metadata(fx.repo.path().join("calc.py")).unwrap().modified().unwrap();

    let second = DevLoop::new(
        Arc::new(ScriptedGenerator::new([INSERT_DOC])),
        PromptRenderer::new().unwrap(),
        config,
    );
    let outcome = run(&second, Task::new("document add", ["calc.py"])).await;

    assert_eq!(outcome.status, RunStatus::Success { attempts: 1, noop: true });
    assert_eq!(fx.read("calc.py"), modified);
    assert_eq!(
        fs::metadata(fx.repo.path().join("calc.py")).unwrap().modified().unwrap(),
        mtime
    );

    let apply: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(outcome.run_dir.join("attempt-01/apply.json")).unwrap()).unwrap();
    assert_eq!(apply["outcome"], "already_applied_noop");
    assert!(!outcome.run_dir.join("attempt-01/verify").exists());
}

#[tokio::test]
async fn test_infra_failure_halts_without_fix() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::repeating(INSERT_DOC));
    let config = fx.config(vec![VerifyStepSpec::new(
        "db",
        "echo 'psycopg2.OperationalError: connection refused' >&2; exit 1",
    )]);
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

    let outcome = run(&devloop, Task::new("document add", ["calc.py"])).await;

    match &outcome.status {
        RunStatus::Halted {
            attempt,
            signature,
            line,
            step,
        } => {
            assert_eq!(*attempt, 1);
            assert_eq!(signature, "connection refused");
            assert!(line.contains("OperationalError"));
            assert_eq!(step.as_deref(), Some("db"));
        }
        other => panic!("expected halt, got {:?}", other),
    }
    assert_eq!(outcome.status.exit_code(), 2);
    assert_eq!(generator.calls(), 1);
    assert_eq!(transitions_to(&outcome.run_dir, "fix"), 0);
    assert_eq!(transitions_to(&outcome.run_dir, "halt"), 1);
}

#[tokio::test]
async fn test_out_of_scope_patch_never_touches_disk() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::repeating(TOUCH_SECRETS));
    let mut config = fx.config(vec![VerifyStepSpec::new("ok", "true")]);
    config.max_attempts = 2;
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

    let outcome = run(&devloop, Task::new("rotate token", ["calc.py"])).await;

    match &outcome.status {
        RunStatus::MaxAttemptsExceeded { attempts, last_failure } => {
            assert_eq!(*attempts, 2);
            assert_eq!(last_failure.as_ref().unwrap().tag, FailureTag::ScopeFailure);
        }
        other => panic!("expected max attempts, got {:?}", other),
    }
    assert!(!fx.repo.path().join("secrets").exists());
    assert!(!outcome.run_dir.join("attempt-01/apply.json").exists());
    assert!(outcome.run_dir.join("attempt-01/validation.json").exists());

    let fix = &generator.requests()[1];
    assert_eq!(fix.mode, GenerateMode::Fix);
    let context = fix.fix.as_ref().unwrap();
    assert_eq!(context.out_of_scope, vec!["secrets/keys.env"]);
    assert!(fix.files.iter().all(|f| f.path != "secrets/keys.env"));
    assert!(fix.prompt.contains("secrets/keys.env"));
}

#[tokio::test]
async fn test_budget_exhausted_after_exact_attempts() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::new([
        new_file_patch("notes1.txt", "one"),
        new_file_patch("notes2.txt", "two"),
        new_file_patch("notes3.txt", "three"),
    ]));
    let config = fx.config(vec![VerifyStepSpec::new(
        "tests",
        "echo 'calc.py:2: AssertionError: expected 3'; exit 1",
    )]);
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

    let task = Task::new("fix add", ["calc.py", "notes1.txt", "notes2.txt", "notes3.txt"]);
    let outcome = run(&devloop, task).await;

    match &outcome.status {
        RunStatus::MaxAttemptsExceeded { attempts, last_failure } => {
            assert_eq!(*attempts, 3);
            let last = last_failure.as_ref().unwrap();
            assert_eq!(last.tag, FailureTag::CodeFailure);
            assert_eq!(last.attempt, 3);
        }
        other => panic!("expected max attempts, got {:?}", other),
    }
    assert_eq!(outcome.status.exit_code(), 3);
    assert_eq!(generator.calls(), 3);
    assert_eq!(transitions_to(&outcome.run_dir, "fix"), 3);
    for n in 1..=3 {
        assert!(outcome.run_dir.join(format!("attempt-{:02}/failure.json", n)).exists());
    }
    assert!(!outcome.run_dir.join("attempt-04").exists());

    let requests = generator.requests();
    assert_eq!(requests[0].mode, GenerateMode::Initial);
    let third = requests[2].fix.as_ref().unwrap();
    assert!(third.feedback.contains("Previous Attempt Results"));
    assert!(requests[2].files.iter().any(|f| f.path == "calc.py"));
}

#[tokio::test]
async fn test_fix_context_narrows_to_failing_files() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::new([INSERT_DOC, ""]));
    let mut config = fx.config(vec![
        VerifyStepSpec::new(
            "pytest",
            "echo 'calc.py:2: AssertionError'; echo 'lib/helpers.py:9: ValueError'; exit 1",
        )
        .with_tool(ToolKind::Pytest),
    ]);
    config.max_attempts = 2;
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

    run(&devloop, Task::new("fix add", ["calc.py", "README.md"])).await;

    let fix = &generator.requests()[1];
    let paths: Vec<&str> = fix.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["calc.py"]);
    assert_eq!(fix.fix.as_ref().unwrap().out_of_scope, vec!["lib/helpers.py"]);
    assert_eq!(fix.allowed_files, vec!["README.md", "calc.py"]);
}

#[tokio::test]
async fn test_scope_approval_widens_one_attempt_only() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::repeating(TOUCH_SECRETS));
    let mut config = fx.config(vec![VerifyStepSpec::new("ok", "true")]);
    config.max_attempts = 2;
    let approvals = ApprovalSet::new(vec![ScopeApproval {
        attempt: 2,
        paths: vec!["secrets/keys.env".to_string()],
        approved_by: "ops".to_string(),
        reason: "token rotation".to_string(),
    }])
    .unwrap();
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config).with_approvals(approvals);

    let outcome = run(&devloop, Task::new("rotate token", ["calc.py"])).await;

    assert_eq!(outcome.status, RunStatus::Success { attempts: 2, noop: false });
    assert_eq!(fx.read("secrets/keys.env"), "TOKEN=abc\n");
    assert!(!outcome.run_dir.join("attempt-01/scope-approval.json").exists());
    assert!(outcome.run_dir.join("attempt-02/scope-approval.json").exists());

    let requests = generator.requests();
    assert!(!requests[0].allowed_files.contains(&"secrets/keys.env".to_string()));
    assert!(requests[1].allowed_files.contains(&"secrets/keys.env".to_string()));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::new([INSERT_DOC]));
    let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), fx.config(Vec::new()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = devloop.run(Task::new("document add", ["calc.py"]), &cancel).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled { attempt: 1 });
    assert_eq!(outcome.status.exit_code(), 4);
    assert_eq!(generator.calls(), 0);
    assert_eq!(fx.read("calc.py"), CALC);
    assert!(outcome.run_dir.join("result.json").exists());
}

#[tokio::test]
async fn test_cancelled_during_verify() {
    let fx = Fixture::new();
    let generator = Arc::new(ScriptedGenerator::new([INSERT_DOC]));
    let config = fx.config(vec![VerifyStepSpec::new("slow", "sleep 30")]);
    let devloop = DevLoop::new(generator, PromptRenderer::new().unwrap(), config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let outcome = devloop.run(Task::new("document add", ["calc.py"]), &cancel).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled { attempt: 1 });
    assert!(!outcome.run_dir.join("attempt-01/failure.json").exists());
}

#[tokio::test]
async fn test_run_record_is_listable() {
    let fx = Fixture::new();
    let config = fx.config(vec![VerifyStepSpec::new("ok", "true")]);
    let devloop = DevLoop::new(
        Arc::new(ScriptedGenerator::new([INSERT_DOC])),
        PromptRenderer::new().unwrap(),
        config,
    );

    let outcome = run(&devloop, Task::new("document add", ["calc.py"])).await;

    let runs = list_runs(fx.runs.path()).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, outcome.run_id);
    assert_eq!(runs[0].header.as_ref().unwrap().task.description, "document add");
    assert!(runs[0].result.as_ref().unwrap().status.is_success());

    let details = load_run(fx.runs.path(), &outcome.run_id).unwrap();
    assert_eq!(details.attempts, vec!["attempt-01"]);
    let first = details.events.first().unwrap();
    let last = details.events.last().unwrap();
    assert_eq!(first.event_type, event_types::RUN_STARTED);
    assert_eq!(last.event_type, event_types::RUN_FINISHED);
    assert!(details.events.windows(2).all(|w| w[0].seq < w[1].seq));
}
