//! Patch Validator.
//!
//! Runs every structural, path, existence and scope check against a parsed
//! patch and collects all violations before returning. Only a clean result
//! produces a `ValidatedPatch`, the sole input the applier accepts.

use std::collections::{BTreeMap, HashSet};

use log::debug;
use serde::{Deserialize, Serialize};

use super::apply::added_content;
use super::{ChangeKind, FileChange, Hunk, ParsedPatch, ScopeGuard};
use crate::error::Result;
use crate::tree::{Fingerprint, RepoOracle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Syntax,
    Path,
    Existence,
    Scope,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Syntax => "syntax",
            ViolationKind::Path => "path",
            ViolationKind::Existence => "existence",
            ViolationKind::Scope => "scope",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub file: Option<String>,
    pub detail: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, file: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.map(str::to_string),
            detail: detail.into(),
        }
    }

    pub fn syntax(file: Option<&str>, detail: impl Into<String>) -> Self {
        Self::new(ViolationKind::Syntax, file, detail)
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "[{}] {}: {}", self.kind, file, self.detail),
            None => write!(f, "[{}] {}", self.kind, self.detail),
        }
    }
}

/// Result of validating a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether validation passed
    pub passed: bool,
    /// Every problem found, in check order
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// Create a passing result
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    /// Create a failing result with a single violation
    pub fn fail(violation: Violation) -> Self {
        Self {
            passed: false,
            violations: vec![violation],
        }
    }

    /// Create a result from collected violations
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Add a violation to this result
    pub fn add(&mut self, violation: Violation) {
        self.violations.push(violation);
        self.passed = false;
    }

    pub fn has_kind(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn of_kind(&self, kind: ViolationKind) -> Vec<&Violation> {
        self.violations.iter().filter(|v| v.kind == kind).collect()
    }

    /// One line per violation.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::pass()
    }
}

/// A patch that passed validation, with the pre-image fingerprint of every
/// touched path (`None` = absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPatch {
    patch: ParsedPatch,
    fingerprints: BTreeMap<String, Option<Fingerprint>>,
}

impl ValidatedPatch {
    pub fn patch(&self) -> &ParsedPatch {
        &self.patch
    }

    pub fn fingerprints(&self) -> &BTreeMap<String, Option<Fingerprint>> {
        &self.fingerprints
    }

    pub fn files(&self) -> Vec<String> {
        self.patch.files.iter().map(|f| f.path().to_string()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(ValidatedPatch),
    Rejected(ValidationResult),
}

impl Verdict {
    pub fn result(&self) -> ValidationResult {
        match self {
            Verdict::Accepted(_) => ValidationResult::pass(),
            Verdict::Rejected(result) => result.clone(),
        }
    }
}

/// Bare names producers emit when they did not know the real file.
const PLACEHOLDER_NAMES: &[&str] = &[
    "file.py",
    "example.py",
    "your_script.py",
    "your_file.py",
    "filename.ext",
    "file.ext",
];

pub struct PatchValidator {
    scope: ScopeGuard,
}

impl PatchValidator {
    pub fn new(scope: ScopeGuard) -> Self {
        Self { scope }
    }

    pub fn validate(&self, patch: ParsedPatch, oracle: &dyn RepoOracle) -> Result<Verdict> {
        let (result, fingerprints) = self.check(&patch, oracle)?;
        if result.passed {
            debug!("validate: {} file(s) accepted", patch.files.len());
            Ok(Verdict::Accepted(ValidatedPatch { patch, fingerprints }))
        } else {
            debug!("validate: {} violation(s)", result.violations.len());
            Ok(Verdict::Rejected(result))
        }
    }

    fn check(
        &self,
        patch: &ParsedPatch,
        oracle: &dyn RepoOracle,
    ) -> Result<(ValidationResult, BTreeMap<String, Option<Fingerprint>>)> {
        let mut result = ValidationResult::pass();
        let mut fingerprints = BTreeMap::new();

        if patch.is_empty() {
            result.add(Violation::syntax(None, "patch contains no file changes"));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for file in &patch.files {
            for path in file.touched_paths() {
                if !seen.insert(path) {
                    result.add(Violation::syntax(Some(path), "path appears in more than one file change"));
                }
            }
        }

        for file in &patch.files {
            check_structure(file, &mut result);

            let mut paths_safe = true;
            for path in file.touched_paths() {
                if let Some(reason) = path_problem(path) {
                    result.add(Violation::new(ViolationKind::Path, Some(path), reason));
                    paths_safe = false;
                }
            }
            // never touch the filesystem for an unsafe path
            if paths_safe {
                self.check_existence(file, oracle, &mut result, &mut fingerprints)?;
            }
        }

        for denied in self.scope.check(patch).denied() {
            result.add(Violation::new(
                ViolationKind::Scope,
                Some(denied),
                "path is outside the allowed file set",
            ));
        }

        Ok((result, fingerprints))
    }

    fn check_existence(
        &self,
        file: &FileChange,
        oracle: &dyn RepoOracle,
        result: &mut ValidationResult,
        fingerprints: &mut BTreeMap<String, Option<Fingerprint>>,
    ) -> Result<()> {
        let mut lookup = |path: &str| -> Result<Option<Fingerprint>> {
            let fp = oracle.fingerprint(path)?;
            fingerprints.insert(path.to_string(), fp.clone());
            Ok(fp)
        };

        match file.kind {
            ChangeKind::Modify => {
                let path = file.path();
                if lookup(path)?.is_none() {
                    result.add(Violation::new(ViolationKind::Existence, Some(path), "file to modify does not exist"));
                }
            }
            ChangeKind::Delete => {
                // an already-deleted file is left for the applier to report as a no-op
                lookup(file.path())?;
            }
            ChangeKind::Add => {
                let path = file.path();
                if let Some(existing) = lookup(path)? {
                    let identical = added_content(file)
                        .map(|content| Fingerprint::of(content.as_bytes()) == existing)
                        .unwrap_or(false);
                    if !identical {
                        result.add(Violation::new(ViolationKind::Existence, Some(path), "file to add already exists"));
                    }
                }
            }
            ChangeKind::Rename => {
                if let Some(old) = file.old_path.as_deref()
                    && lookup(old)?.is_none()
                {
                    result.add(Violation::new(ViolationKind::Existence, Some(old), "rename source does not exist"));
                }
                if let Some(new) = file.new_path.as_deref()
                    && lookup(new)?.is_some()
                {
                    result.add(Violation::new(
                        ViolationKind::Existence,
                        Some(new),
                        "rename destination already exists",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_structure(file: &FileChange, result: &mut ValidationResult) {
    let path = Some(file.path());

    if file.kind == ChangeKind::Modify && file.hunks.is_empty() {
        result.add(Violation::syntax(path, "modification has no hunks"));
    }

    for (idx, hunk) in file.hunks.iter().enumerate() {
        if !hunk.counts_match() {
            result.add(Violation::syntax(
                path,
                format!(
                    "hunk {} declares -{},{} +{},{} but contains {} old / {} new lines",
                    idx + 1,
                    hunk.old_start,
                    hunk.old_len,
                    hunk.new_start,
                    hunk.new_len,
                    hunk.counted_old(),
                    hunk.counted_new()
                ),
            ));
        }
        if hunk.lines.is_empty() {
            result.add(Violation::syntax(path, format!("hunk {} is empty", idx + 1)));
        }
        match file.kind {
            ChangeKind::Add if hunk.old_len != 0 => {
                result.add(Violation::syntax(path, format!("hunk {} of a new file has old lines", idx + 1)));
            }
            ChangeKind::Delete if hunk.new_len != 0 => {
                result.add(Violation::syntax(path, format!("hunk {} of a deleted file has new lines", idx + 1)));
            }
            _ => {}
        }
    }

    for (idx, pair) in file.hunks.windows(2).enumerate() {
        if hunk_begin(&pair[1]) < hunk_end(&pair[0]) {
            result.add(Violation::syntax(
                path,
                format!("hunk {} overlaps or precedes hunk {}", idx + 2, idx + 1),
            ));
        }
    }
}

/// First pre-image line index (1-based) a hunk covers.
fn hunk_begin(hunk: &Hunk) -> u32 {
    if hunk.old_len == 0 {
        hunk.old_start + 1
    } else {
        hunk.old_start
    }
}

fn hunk_end(hunk: &Hunk) -> u32 {
    hunk_begin(hunk) + hunk.old_len
}

/// Why a path cannot be written, if it cannot.
fn path_problem(path: &str) -> Option<String> {
    if path.is_empty() {
        return Some("empty path".to_string());
    }
    if path.contains('\0') {
        return Some("path contains a NUL byte".to_string());
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Some("absolute path".to_string());
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some("path has a drive prefix".to_string());
    }
    for component in path.split('/') {
        if component == ".." {
            return Some("path escapes the repository root".to_string());
        }
        if component == ".git" {
            return Some("path is inside .git".to_string());
        }
    }
    placeholder_problem(path).map(|token| format!("placeholder path ({})", token))
}

fn placeholder_problem(path: &str) -> Option<&'static str> {
    if path.contains('<') || path.contains('>') {
        return Some("angle-bracket template");
    }
    if path.contains("{{") || path.contains("}}") || path.contains("${") {
        return Some("template variable");
    }
    if path.starts_with("path/to/") || path.contains("/path/to/") {
        return Some("path/to/");
    }
    if path.split('/').any(|c| c == "..." || c == "\u{2026}") {
        return Some("ellipsis");
    }
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    if name.starts_with("your_") || name.starts_with("your-") {
        return Some("your_ name");
    }
    if PLACEHOLDER_NAMES.contains(&path) {
        return Some("generic file name");
    }
    None
}
