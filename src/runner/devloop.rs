//! The DevLoop orchestrator.
//!
//! One run, one attempt at a time:
//! PLAN -> GENERATE -> VALIDATE -> APPLY -> VERIFY, with every failure
//! routed through `Classifier::classify` to FIX (retry), HALT (infra) or
//! MAX_ATTEMPTS_EXCEEDED. Every transition and artifact lands in the run
//! directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::domain::{ApprovalSet, LoopState, RunEvent, RunStatus, Task};
use crate::error::Result;
use crate::generator::{FileContext, FixContext, GenerateMode, GenerateRequest, PatchGenerator};
use crate::patch::{
    ApplyOutcome, PatchApplier, PatchValidator, RawPatch, ScopeGuard, ValidatedPatch, ValidationResult,
    Verdict, Violation, parse_patch,
};
use crate::process::{ShellCommand, run_shell};
use crate::prompt::PromptRenderer;
use crate::storage::{RunContext, RunHeader, RunResult, safe_name};
use crate::tree::WorkingTree;
use crate::verify::{
    Classifier, Evidence, FailureKind, FailureReport, FeedbackFormatter, InfraGuard, PathScope, VerifyRunner,
    VerifyStatus, VerifyStep, VerifyStepSpec,
};

/// Placeholder content for an allowed file that does not exist yet.
pub const MISSING_FILE: &str = "<missing>";

/// Settings for a DevLoop.
#[derive(Debug, Clone)]
pub struct DevLoopConfig {
    pub repo_root: PathBuf,
    pub runs_dir: PathBuf,
    pub max_attempts: u32,
    /// Per-file cap on content handed to the generator
    pub max_file_chars: usize,
    pub verify_steps: Vec<VerifyStepSpec>,
    pub infra_signatures: Vec<String>,
    /// Effective configuration, recorded in `run.json`
    pub snapshot: serde_json::Value,
}

impl DevLoopConfig {
    pub fn new(repo_root: impl Into<PathBuf>, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            runs_dir: runs_dir.into(),
            max_attempts: 3,
            max_file_chars: 120_000,
            verify_steps: Vec::new(),
            infra_signatures: crate::verify::DEFAULT_INFRA_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            snapshot: serde_json::Value::Null,
        }
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub attempts: u32,
}

/// Mutable state of one run.
struct Run {
    ctx: RunContext,
    task: Task,
    attempt: u32,
    raw: Option<RawPatch>,
    validated: Option<ValidatedPatch>,
    scope: ScopeGuard,
    history: Vec<FailureReport>,
    last_failure: Option<FailureKind>,
    noop: bool,
}

impl Run {
    fn event(&mut self, event: RunEvent) -> Result<()> {
        self.ctx.append_event(event).map(|_| ())
    }
}

pub struct DevLoop {
    generator: Arc<dyn PatchGenerator>,
    prompt: PromptRenderer,
    approvals: ApprovalSet,
    config: DevLoopConfig,
    feedback: FeedbackFormatter,
}

impl DevLoop {
    pub fn new(generator: Arc<dyn PatchGenerator>, prompt: PromptRenderer, config: DevLoopConfig) -> Self {
        Self {
            generator,
            prompt,
            approvals: ApprovalSet::default(),
            config,
            feedback: FeedbackFormatter::new(),
        }
    }

    pub fn with_approvals(mut self, approvals: ApprovalSet) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn config(&self) -> &DevLoopConfig {
        &self.config
    }

    fn tree(&self) -> WorkingTree {
        WorkingTree::new(self.config.repo_root.clone())
    }

    fn classifier(&self) -> Classifier {
        Classifier::new(
            InfraGuard::new(self.config.infra_signatures.iter().cloned()),
            PathScope::new(self.config.repo_root.clone()),
        )
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Drive one run to a terminal state.
    ///
    /// Errors are operational (run directory I/O, generator failures);
    /// every patch or verification problem is routed inside the loop.
    pub async fn run(&self, task: Task, cancel: &CancellationToken) -> Result<RunOutcome> {
        let ctx = RunContext::create(&self.config.runs_dir)?;
        info!("run {}: {}", ctx.run_id(), task.description);

        ctx.write_header(&RunHeader {
            run_id: ctx.run_id().to_string(),
            started_at: Utc::now(),
            repo_root: self.config.repo_root.clone(),
            task: task.clone(),
            max_attempts: self.max_attempts(),
            generator: self.generator.description(),
            approvals: self.approvals.all().to_vec(),
            config: self.config.snapshot.clone(),
        })?;

        let mut run = Run {
            scope: ScopeGuard::new(task.allowed_files.iter()),
            ctx,
            task,
            attempt: 1,
            raw: None,
            validated: None,
            history: Vec::new(),
            last_failure: None,
            noop: false,
        };
        let event = RunEvent::run_started(
            run.ctx.run_id(),
            &run.task.description,
            &run.task.allowed_files,
            self.max_attempts(),
        );
        run.event(event)?;

        let mut state = LoopState::Plan;
        while !state.is_terminal() {
            let next = if cancel.is_cancelled() {
                LoopState::Cancelled
            } else {
                match state {
                    LoopState::Plan => self.plan(&mut run, cancel).await?,
                    LoopState::Generate => self.generate(&mut run, cancel).await?,
                    LoopState::Validate => self.validate(&mut run)?,
                    LoopState::Apply => self.apply(&mut run)?,
                    LoopState::Verify => self.verify(&mut run, cancel).await?,
                    LoopState::Fix => self.fix(&mut run),
                    terminal => terminal,
                }
            };
            debug!("attempt {}: {} -> {}", run.attempt, state, next);
            run.event(RunEvent::state_changed(run.attempt, state.as_str(), next.as_str()))?;
            state = next;
        }

        self.finish(run, state)
    }

    async fn plan(&self, run: &mut Run, cancel: &CancellationToken) -> Result<LoopState> {
        let git = ShellCommand::new("git status --short", self.config.repo_root.clone())
            .with_timeout(Duration::from_secs(30));
        let output = run_shell(&git, cancel).await;
        if output.success() {
            let status = output.stdout.trim();
            if !status.is_empty() {
                let excerpt: String = status.chars().take(500).collect();
                warn!("working tree has uncommitted changes:\n{}", excerpt);
                run.event(RunEvent::tree_dirty(&excerpt))?;
            }
        } else {
            debug!("plan: git status unavailable ({:?})", output.exit);
        }
        Ok(LoopState::Generate)
    }

    async fn generate(&self, run: &mut Run, cancel: &CancellationToken) -> Result<LoopState> {
        let attempt = run.attempt;
        run.raw = None;
        run.validated = None;

        let mut scope = ScopeGuard::new(run.task.allowed_files.iter());
        let approvals = self.approvals.for_attempt(attempt);
        if !approvals.is_empty() {
            for approval in &approvals {
                scope = scope.with_expansion(approval);
            }
            let paths: Vec<String> = approvals.iter().flat_map(|a| a.paths.iter().cloned()).collect();
            let by: Vec<String> = approvals.iter().map(|a| a.approved_by.clone()).collect();
            info!("attempt {}: scope expanded by {:?} to include {:?}", attempt, by, paths);
            run.ctx.write_json(Some(attempt), "scope-approval.json", &approvals)?;
            run.event(RunEvent::scope_expansion_approved(attempt, &paths, &by))?;
        }
        run.scope = scope;

        let allowed = run.scope.allowed_paths();
        let (mode, fix, focus) = match &run.last_failure {
            None => (GenerateMode::Initial, None, allowed.clone()),
            Some(kind) => {
                let (focus, out_of_scope) = fix_files(kind, &run.scope);
                let fix = FixContext {
                    failure: kind.report().clone(),
                    feedback: self.feedback.format_history(&run.history),
                    out_of_scope,
                };
                let focus = if focus.is_empty() { allowed.clone() } else { focus };
                (GenerateMode::Fix, Some(fix), focus)
            }
        };

        let tree = self.tree();
        let files = focus
            .iter()
            .map(|path| FileContext {
                path: path.clone(),
                content: file_context(&tree, path, self.config.max_file_chars),
            })
            .collect();

        let mut request = GenerateRequest {
            task: run.task.description.clone(),
            attempt,
            mode,
            allowed_files: allowed,
            files,
            fix,
            prompt: String::new(),
        };
        request.prompt = self.prompt.render(&request)?;
        run.ctx.write_json(Some(attempt), "request.json", &request)?;

        let raw = self.generator.generate(&request, cancel).await?;
        if cancel.is_cancelled() {
            // whatever came back is not a proposal; nothing is classified
            info!("attempt {}: cancelled during generation", attempt);
            return Ok(LoopState::Cancelled);
        }
        run.ctx.write_artifact(Some(attempt), "patch.raw.diff", raw.text.as_bytes())?;
        run.event(RunEvent::patch_generated(attempt, mode.as_str(), raw.text.len()))?;

        if raw.is_blank() {
            if mode == GenerateMode::Initial {
                info!("attempt {}: generator proposed no change, verifying as-is", attempt);
                return Ok(LoopState::Verify);
            }
            let kind = FailureKind::syntax(attempt, "generator returned an empty patch for a fix attempt");
            return self.route(run, kind);
        }

        run.raw = Some(raw);
        Ok(LoopState::Validate)
    }

    fn validate(&self, run: &mut Run) -> Result<LoopState> {
        let attempt = run.attempt;
        let text = run.raw.as_ref().map(|r| r.text.clone()).unwrap_or_default();

        let verdict = match parse_patch(&text) {
            Ok(parsed) => {
                run.ctx
                    .write_artifact(Some(attempt), "patch.normalized.diff", parsed.to_unified().as_bytes())?;
                let tree = self.tree();
                PatchValidator::new(run.scope.clone()).validate(parsed, &tree)?
            }
            Err(e) => Verdict::Rejected(ValidationResult::fail(Violation::syntax(None, e.to_string()))),
        };
        let result = verdict.result();
        run.ctx.write_json(Some(attempt), "validation.json", &result)?;

        match verdict {
            Verdict::Accepted(validated) => {
                run.event(RunEvent::patch_validated(attempt, &validated.files()))?;
                run.validated = Some(validated);
                Ok(LoopState::Apply)
            }
            Verdict::Rejected(result) => {
                let violations: Vec<String> = result.violations.iter().map(|v| v.to_string()).collect();
                warn!("attempt {}: patch rejected: {}", attempt, result.summary());
                run.event(RunEvent::patch_rejected(attempt, &violations))?;
                match self.classifier().classify(attempt, Evidence::Validation(&result))? {
                    Some(kind) => self.route(run, kind),
                    None => Ok(LoopState::Fix),
                }
            }
        }
    }

    fn apply(&self, run: &mut Run) -> Result<LoopState> {
        let attempt = run.attempt;
        let Some(validated) = run.validated.take() else {
            return Ok(LoopState::Verify);
        };

        let tree = self.tree();
        let outcome = PatchApplier::new(&tree).apply(&validated)?;
        run.ctx.write_json(Some(attempt), "apply.json", &outcome)?;

        let (name, files) = match &outcome {
            ApplyOutcome::Applied { files } => ("applied", files.clone()),
            ApplyOutcome::AlreadyAppliedNoop => ("already_applied_noop", validated.files()),
            ApplyOutcome::Rejected { path, .. } => ("rejected", vec![path.clone()]),
        };
        run.event(RunEvent::apply_complete(attempt, name, &files))?;

        match outcome {
            ApplyOutcome::AlreadyAppliedNoop => {
                info!("attempt {}: patch already applied", attempt);
                run.noop = true;
                Ok(LoopState::Success)
            }
            ApplyOutcome::Applied { .. } => Ok(LoopState::Verify),
            ApplyOutcome::Rejected { .. } => match self.classifier().classify(attempt, Evidence::Apply(&outcome))? {
                Some(kind) => self.route(run, kind),
                None => Ok(LoopState::Fix),
            },
        }
    }

    async fn verify(&self, run: &mut Run, cancel: &CancellationToken) -> Result<LoopState> {
        let attempt = run.attempt;
        let runner = VerifyRunner::new(self.config.verify_steps.clone());
        let report = runner.run(&self.config.repo_root, cancel).await;

        for (idx, step) in report.steps.iter().enumerate() {
            let name = format!("verify/{:02}-{}.log", idx + 1, safe_name(&step.name));
            run.ctx.write_artifact(Some(attempt), &name, step_log(step).as_bytes())?;
            run.event(RunEvent::verify_step(attempt, &step.name, &step.exit.describe(), step.duration_ms))?;
        }

        match report.status {
            VerifyStatus::Passed => Ok(LoopState::Success),
            VerifyStatus::Cancelled => Ok(LoopState::Cancelled),
            VerifyStatus::Failed { .. } => match self.classifier().classify(attempt, Evidence::Verify(&report))? {
                Some(kind) => self.route(run, kind),
                None => Ok(LoopState::Fix),
            },
        }
    }

    /// Each FIX transition consumes one attempt. `run.attempt` always names the
    /// last attempt that ran, so the final transition leaves it unchanged.
    fn fix(&self, run: &mut Run) -> LoopState {
        if run.attempt >= self.max_attempts() {
            return LoopState::MaxAttemptsExceeded;
        }
        run.attempt += 1;
        LoopState::Generate
    }

    /// Record a classified failure and pick the next state.
    fn route(&self, run: &mut Run, kind: FailureKind) -> Result<LoopState> {
        let attempt = run.attempt;
        let report = kind.report().clone();
        run.ctx.write_json(Some(attempt), "failure.json", &kind)?;
        run.event(RunEvent::failure_classified(attempt, report.tag.as_str(), &report.summary()))?;
        info!("{}", report.summary());

        let next = match kind {
            FailureKind::Infra { .. } => LoopState::Halt,
            _ => LoopState::Fix,
        };
        run.history.push(report);
        run.last_failure = Some(kind);
        Ok(next)
    }

    fn finish(&self, mut run: Run, state: LoopState) -> Result<RunOutcome> {
        let attempts = run.attempt;
        let status = match state {
            LoopState::Success => RunStatus::Success {
                attempts,
                noop: run.noop,
            },
            LoopState::Halt => match &run.last_failure {
                Some(FailureKind::Infra { signature, line, report }) => RunStatus::Halted {
                    attempt: attempts,
                    signature: signature.clone(),
                    line: line.clone(),
                    step: report.step.clone(),
                },
                _ => RunStatus::Halted {
                    attempt: attempts,
                    signature: String::new(),
                    line: String::new(),
                    step: None,
                },
            },
            LoopState::MaxAttemptsExceeded => RunStatus::MaxAttemptsExceeded {
                attempts,
                last_failure: run.history.last().cloned(),
            },
            _ => RunStatus::Cancelled { attempt: attempts },
        };

        let summary = status.summary();
        info!("run {}: {}", run.ctx.run_id(), summary);
        run.ctx.write_result(&RunResult {
            run_id: run.ctx.run_id().to_string(),
            finished_at: Utc::now(),
            exit_code: status.exit_code(),
            summary: summary.clone(),
            status: status.clone(),
        })?;
        run.event(RunEvent::run_finished(attempts, status.state().as_str(), &summary))?;

        Ok(RunOutcome {
            run_id: run.ctx.run_id().to_string(),
            run_dir: run.ctx.dir().to_path_buf(),
            status,
            attempts,
        })
    }
}

/// Files to show on a fix attempt, and referenced files that may not be
/// touched. Out-of-scope files are never added to the context.
fn fix_files(kind: &FailureKind, scope: &ScopeGuard) -> (Vec<String>, Vec<String>) {
    let mut referenced: Vec<String> = kind.report().files().into_iter().map(str::to_string).collect();
    if let FailureKind::Scope { paths, .. } = kind {
        for path in paths {
            if !referenced.contains(path) {
                referenced.push(path.clone());
            }
        }
    }

    referenced.into_iter().partition(|path| scope.is_allowed(path))
}

/// File content for the generator, capped at `max_chars`.
fn file_context(tree: &WorkingTree, path: &str, max_chars: usize) -> String {
    match tree.read_text(path) {
        Ok(Some(text)) => {
            if text.chars().count() <= max_chars {
                text
            } else {
                let mut capped: String = text.chars().take(max_chars).collect();
                capped.push_str("\n... (truncated)");
                capped
            }
        }
        Ok(None) => MISSING_FILE.to_string(),
        Err(e) => {
            warn!("cannot read {} for context: {}", path, e);
            format!("<unreadable: {}>", e)
        }
    }
}

fn step_log(step: &VerifyStep) -> String {
    format!(
        "$ {}\n[{}] in {}ms\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        step.command,
        step.exit.describe(),
        step.duration_ms,
        step.stdout,
        step.stderr
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScriptedGenerator;
    use crate::verify::FailureTag;
    use tempfile::TempDir;

    #[test]
    fn test_fix_files_partitions_by_scope() {
        let scope = ScopeGuard::new(["src/a.py"]);
        let mut report = FailureReport::new(1, FailureTag::CodeFailure, "");
        report.failures = vec![
            crate::verify::AttributableFailure::new("src/a.py", "boom"),
            crate::verify::AttributableFailure::new("src/b.py", "boom"),
        ];
        let (focus, out) = fix_files(&FailureKind::Code { report }, &scope);
        assert_eq!(focus, vec!["src/a.py"]);
        assert_eq!(out, vec!["src/b.py"]);
    }

    #[test]
    fn test_fix_files_lists_scope_violations_as_out_of_scope() {
        let scope = ScopeGuard::new(["src/a.py"]);
        let kind = FailureKind::Scope {
            paths: vec!["secrets/keys.env".to_string()],
            report: FailureReport::new(1, FailureTag::ScopeFailure, ""),
        };
        let (focus, out) = fix_files(&kind, &scope);
        assert!(focus.is_empty());
        assert_eq!(out, vec!["secrets/keys.env"]);
    }

    #[test]
    fn test_file_context_caps_and_marks_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "abcdef").unwrap();
        let tree = WorkingTree::new(dir.path());
        assert_eq!(file_context(&tree, "big.txt", 3), "abc\n... (truncated)");
        assert_eq!(file_context(&tree, "big.txt", 10), "abcdef");
        assert_eq!(file_context(&tree, "nope.txt", 10), MISSING_FILE);
    }

    #[tokio::test]
    async fn test_blank_first_patch_goes_straight_to_verify() {
        let repo = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        std::fs::write(repo.path().join("a.txt"), "one\n").unwrap();

        let generator = Arc::new(ScriptedGenerator::new([""]));
        let mut config = DevLoopConfig::new(repo.path(), runs.path());
        config.verify_steps = vec![VerifyStepSpec::new("check", "grep -q one a.txt")];
        let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

        let outcome = devloop
            .run(Task::new("nothing to do", ["a.txt"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Success { attempts: 1, noop: false });
        assert_eq!(generator.calls(), 1);
        assert!(outcome.run_dir.join("attempt-01/verify/01-check.log").exists());
        assert!(!outcome.run_dir.join("attempt-01/apply.json").exists());
    }

    /// Cancels the token while answering a fix request.
    struct CancellingGenerator {
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl PatchGenerator for CancellingGenerator {
        async fn generate(&self, request: &GenerateRequest, _cancel: &CancellationToken) -> Result<RawPatch> {
            if request.mode == GenerateMode::Fix {
                self.cancel.cancel();
            }
            Ok(RawPatch::new(String::new()))
        }

        fn description(&self) -> String {
            "cancelling".to_string()
        }
    }

    #[tokio::test]
    async fn test_cancel_during_fix_generation_is_not_a_failure() {
        let repo = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let generator = Arc::new(CancellingGenerator { cancel: cancel.clone() });
        let mut config = DevLoopConfig::new(repo.path(), runs.path());
        config.verify_steps = vec![VerifyStepSpec::new("fail", "exit 1")];
        let devloop = DevLoop::new(generator, PromptRenderer::new().unwrap(), config);

        let outcome = devloop.run(Task::new("t", ["a.txt"]), &cancel).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled { attempt: 2 });
        assert!(outcome.run_dir.join("attempt-01/failure.json").exists());
        assert!(!outcome.run_dir.join("attempt-02/failure.json").exists());
        assert!(!outcome.run_dir.join("attempt-02/patch.raw.diff").exists());

        let events = crate::storage::read_events(&outcome.run_dir.join("events.jsonl")).unwrap();
        let classified = events
            .iter()
            .filter(|e| e.event_type == crate::domain::event_types::FAILURE_CLASSIFIED)
            .count();
        assert_eq!(classified, 1);
    }

    #[tokio::test]
    async fn test_blank_fix_patch_is_a_syntax_failure() {
        let repo = TempDir::new().unwrap();
        let runs = TempDir::new().unwrap();

        let generator = Arc::new(ScriptedGenerator::new(["", ""]));
        let mut config = DevLoopConfig::new(repo.path(), runs.path());
        config.max_attempts = 2;
        config.verify_steps = vec![VerifyStepSpec::new("fail", "exit 1")];
        let devloop = DevLoop::new(generator.clone(), PromptRenderer::new().unwrap(), config);

        let outcome = devloop
            .run(Task::new("t", ["a.txt"]), &CancellationToken::new())
            .await
            .unwrap();
        match outcome.status {
            RunStatus::MaxAttemptsExceeded { attempts, last_failure } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_failure.unwrap().tag, FailureTag::PatchSyntaxFailure);
            }
            other => panic!("unexpected {:?}", other),
        }
        let second = &generator.requests()[1];
        assert_eq!(second.mode, GenerateMode::Fix);
        assert_eq!(second.files[0].content, MISSING_FILE);
    }
}
