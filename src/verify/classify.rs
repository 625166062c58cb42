//! Failure classification.
//!
//! `Classifier::classify` is the only place a failure gets its kind. Every
//! downstream decision in the loop matches on the returned `FailureKind`.

use serde::{Deserialize, Serialize};

use super::failure::{AttributableFailure, PathScope, extract_failures};
use super::infra::{InfraGuard, InfraMatch};
use super::runner::{StepExit, VerifyReport, VerifyStatus, VerifyStep};
use crate::error::Result;
use crate::patch::{ApplyOutcome, ValidationResult, ViolationKind};

/// Output tail kept with a report.
const EXCERPT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    CodeFailure,
    InfraFailure,
    ScopeFailure,
    PatchSyntaxFailure,
    ApplyConflict,
}

impl FailureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureTag::CodeFailure => "code",
            FailureTag::InfraFailure => "infra",
            FailureTag::ScopeFailure => "scope",
            FailureTag::PatchSyntaxFailure => "patch-syntax",
            FailureTag::ApplyConflict => "apply-conflict",
        }
    }
}

impl std::fmt::Display for FailureTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized description of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub attempt: u32,
    /// Verify step that failed, if the failure came from verification
    pub step: Option<String>,
    pub tag: FailureTag,
    pub failures: Vec<AttributableFailure>,
    pub signature: Option<String>,
    pub exit: Option<StepExit>,
    pub excerpt: String,
}

impl FailureReport {
    pub fn new(attempt: u32, tag: FailureTag, excerpt: impl Into<String>) -> Self {
        Self {
            attempt,
            step: None,
            tag,
            failures: Vec::new(),
            signature: None,
            exit: None,
            excerpt: excerpt.into(),
        }
    }

    /// Distinct repo files the failures point at, in order.
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for failure in &self.failures {
            if !files.contains(&failure.file.as_str()) {
                files.push(&failure.file);
            }
        }
        files
    }

    pub fn summary(&self) -> String {
        let mut line = format!("attempt {}: {}", self.attempt, self.tag);
        if let Some(step) = &self.step {
            line.push_str(&format!(" in step '{}'", step));
        }
        if let Some(sig) = &self.signature {
            line.push_str(&format!(" (signature: {})", sig));
        }
        if !self.failures.is_empty() {
            line.push_str(&format!(", {} attributable failure(s)", self.failures.len()));
        }
        line
    }
}

/// The closed set of failure kinds the loop routes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Infra { signature: String, line: String, report: FailureReport },
    Scope { paths: Vec<String>, report: FailureReport },
    Syntax { detail: String, report: FailureReport },
    ApplyConflict { detail: String, report: FailureReport },
    Code { report: FailureReport },
}

impl FailureKind {
    pub fn tag(&self) -> FailureTag {
        self.report().tag
    }

    pub fn report(&self) -> &FailureReport {
        match self {
            FailureKind::Infra { report, .. }
            | FailureKind::Scope { report, .. }
            | FailureKind::Syntax { report, .. }
            | FailureKind::ApplyConflict { report, .. }
            | FailureKind::Code { report } => report,
        }
    }

    /// Generator-side failures: nothing was applied this attempt.
    pub fn syntax(attempt: u32, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        FailureKind::Syntax {
            report: FailureReport::new(attempt, FailureTag::PatchSyntaxFailure, detail.clone()),
            detail,
        }
    }
}

/// What the classifier is looking at.
#[derive(Debug, Clone, Copy)]
pub enum Evidence<'a> {
    Validation(&'a ValidationResult),
    Apply(&'a ApplyOutcome),
    Verify(&'a VerifyReport),
}

pub struct Classifier {
    guard: InfraGuard,
    scope: PathScope,
}

impl Classifier {
    pub fn new(guard: InfraGuard, scope: PathScope) -> Self {
        Self { guard, scope }
    }

    /// `None` when the evidence shows no failure (passed, applied, no-op,
    /// or cancelled).
    pub fn classify(&self, attempt: u32, evidence: Evidence<'_>) -> Result<Option<FailureKind>> {
        match evidence {
            Evidence::Validation(result) => Ok(classify_validation(attempt, result)),
            Evidence::Apply(outcome) => Ok(classify_apply(attempt, outcome)),
            Evidence::Verify(report) => match (report.status, report.failed_step()) {
                (VerifyStatus::Failed { .. }, Some(step)) => self.classify_step(attempt, step).map(Some),
                _ => Ok(None),
            },
        }
    }

    fn classify_step(&self, attempt: u32, step: &VerifyStep) -> Result<FailureKind> {
        let output = step.combined_output();
        let mut report = FailureReport::new(attempt, FailureTag::CodeFailure, tail(&output, EXCERPT_CHARS));
        report.step = Some(step.name.clone());
        report.exit = Some(step.exit.clone());

        // infra first: a dead daemon must never reach fix generation
        if let Some(InfraMatch { signature, line }) = self.guard.inspect(step) {
            report.tag = FailureTag::InfraFailure;
            report.signature = Some(signature.clone());
            return Ok(FailureKind::Infra { signature, line, report });
        }

        let scope = self.scope.clone().with_step_cwd(step.cwd.as_deref().map(std::path::Path::new));
        report.failures = extract_failures(step.tool, &output, &scope)?;
        Ok(FailureKind::Code { report })
    }
}

fn classify_validation(attempt: u32, result: &ValidationResult) -> Option<FailureKind> {
    if result.passed {
        return None;
    }

    let scope: Vec<String> = result
        .of_kind(ViolationKind::Scope)
        .into_iter()
        .filter_map(|v| v.file.clone())
        .collect();
    let summary = result.summary();

    if !scope.is_empty() {
        let report = FailureReport::new(attempt, FailureTag::ScopeFailure, summary);
        return Some(FailureKind::Scope { paths: scope, report });
    }
    Some(FailureKind::Syntax {
        report: FailureReport::new(attempt, FailureTag::PatchSyntaxFailure, summary.clone()),
        detail: summary,
    })
}

fn classify_apply(attempt: u32, outcome: &ApplyOutcome) -> Option<FailureKind> {
    match outcome {
        ApplyOutcome::Rejected {
            path,
            hunk_index,
            detail,
        } => {
            let detail = match hunk_index {
                Some(idx) => format!("{} hunk {}: {}", path, idx + 1, detail),
                None => format!("{}: {}", path, detail),
            };
            Some(FailureKind::ApplyConflict {
                report: FailureReport::new(attempt, FailureTag::ApplyConflict, detail.clone()),
                detail,
            })
        }
        ApplyOutcome::Applied { .. } | ApplyOutcome::AlreadyAppliedNoop => None,
    }
}

/// Last `max` characters, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}
