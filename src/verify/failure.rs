//! Failure Parser: tool output to repository-attributable failures.
//!
//! One parser per tool, selected by the step's declared `ToolKind`. Paths
//! that resolve outside the repository or into dependency trees are dropped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::patch::normalize_path;

/// Failures kept per step; tool output past this is noise for a fix prompt.
const MAX_FAILURES: usize = 50;

/// Path fragments that mark third-party or toolchain code.
const VENDOR_MARKERS: &[&str] = &[
    "/site-packages/",
    "/dist-packages/",
    "/.venv/",
    "/venv/",
    "/node_modules/",
    "/.cargo/registry/",
    "/.cargo/git/",
    "/rustc/",
    "/.rustup/",
    "/vendor/",
    "/usr/lib/",
    "/usr/local/lib/",
];

/// Which parser a verify step's output goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Cargo,
    Ruff,
    Pytest,
    Playwright,
    #[default]
    Generic,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Cargo => "cargo",
            ToolKind::Ruff => "ruff",
            ToolKind::Pytest => "pytest",
            ToolKind::Playwright => "playwright",
            ToolKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure pinned to a repository file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributableFailure {
    /// Repo-relative path
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// Tool-specific code (`E0308`, `F401`, exception name)
    pub code: Option<String>,
    pub message: String,
}

impl AttributableFailure {
    pub fn new(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_location(mut self, line: Option<u32>, column: Option<u32>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Format the location string (e.g., "src/main.rs:42:10").
    pub fn location_string(&self) -> String {
        let mut loc = self.file.clone();
        if let Some(line) = self.line {
            loc.push_str(&format!(":{}", line));
            if let Some(col) = self.column {
                loc.push_str(&format!(":{}", col));
            }
        }
        loc
    }
}

/// Maps raw tool paths to repo-relative ones.
#[derive(Debug, Clone)]
pub struct PathScope {
    roots: Vec<PathBuf>,
    repo_root: PathBuf,
    step_cwd: Option<String>,
}

impl PathScope {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let mut roots = vec![repo_root.clone()];
        if let Ok(canonical) = repo_root.canonicalize()
            && canonical != repo_root
        {
            roots.push(canonical);
        }
        Self {
            roots,
            repo_root,
            step_cwd: None,
        }
    }

    /// Relative paths in tool output are relative to this sub-directory.
    pub fn with_step_cwd(mut self, cwd: Option<&Path>) -> Self {
        self.step_cwd = cwd
            .map(|p| normalize_path(&p.to_string_lossy()))
            .filter(|p| !p.is_empty());
        self
    }

    /// Repo-relative path, or `None` for vendor/out-of-repo/synthetic paths.
    pub fn resolve(&self, raw: &str) -> Option<String> {
        let raw = raw.trim().trim_matches('"').trim_matches('\'');
        if raw.is_empty() || raw.starts_with('<') {
            return None;
        }

        let unified = raw.replace('\\', "/");
        let probe = format!("/{}", unified.trim_start_matches('/'));
        if VENDOR_MARKERS.iter().any(|m| probe.contains(m)) {
            return None;
        }

        let path = Path::new(&unified);
        if path.is_absolute() {
            let relative = self.roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
            let rel = normalize_path(&relative.to_string_lossy());
            return (!rel.is_empty()).then_some(rel);
        }

        let rel = normalize_path(&unified);
        if rel.is_empty() || rel.split('/').any(|c| c == "..") {
            return None;
        }
        if let Some(cwd) = &self.step_cwd {
            let rebased = format!("{}/{}", cwd, rel);
            if self.repo_root.join(&rebased).exists() {
                return Some(rebased);
            }
        }
        Some(rel)
    }
}

/// Extracts attributable failures from one tool's output.
pub trait FailureLineParser: Send + Sync {
    fn tool(&self) -> ToolKind;

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure>;
}

/// Parser for the declared tool.
pub fn parser_for(tool: ToolKind) -> Result<Box<dyn FailureLineParser>> {
    Ok(match tool {
        ToolKind::Cargo => Box::new(CargoParser::new()?),
        ToolKind::Ruff => Box::new(RuffParser::new()?),
        ToolKind::Pytest => Box::new(PytestParser::new()?),
        ToolKind::Playwright => Box::new(PlaywrightParser::new()?),
        ToolKind::Generic => Box::new(GenericParser::new()?),
    })
}

/// Parse, dedupe and cap.
pub fn extract_failures(tool: ToolKind, output: &str, scope: &PathScope) -> Result<Vec<AttributableFailure>> {
    let parser = parser_for(tool)?;
    Ok(dedupe(parser.parse(output, scope)))
}

fn dedupe(failures: Vec<AttributableFailure>) -> Vec<AttributableFailure> {
    let mut seen = HashSet::new();
    failures
        .into_iter()
        .filter(|f| seen.insert(f.clone()))
        .take(MAX_FAILURES)
        .collect()
}

fn num(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx).and_then(|m| m.as_str().parse().ok())
}

/// rustc / cargo / clippy diagnostics and test panics.
pub struct CargoParser {
    header: Regex,
    location: Regex,
    panic: Regex,
}

impl CargoParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            header: Regex::new(r"^error(?:\[(\w+)\])?: (.+)$")?,
            location: Regex::new(r"^\s*(?:-->|:::) (.+?):(\d+):(\d+)\s*$")?,
            panic: Regex::new(r"panicked at (?:'(.*)', )?([^\s:']+):(\d+):(\d+)")?,
        })
    }
}

impl FailureLineParser for CargoParser {
    fn tool(&self) -> ToolKind {
        ToolKind::Cargo
    }

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure> {
        let mut failures = Vec::new();
        let mut pending: Option<(Option<String>, String)> = None;
        let lines: Vec<&str> = output.lines().collect();

        for (idx, line) in lines.iter().enumerate() {
            if let Some(caps) = self.header.captures(line) {
                let message = caps[2].trim().to_string();
                if message.starts_with("aborting due to") || message.starts_with("could not compile") {
                    pending = None;
                    continue;
                }
                pending = Some((caps.get(1).map(|m| m.as_str().to_string()), message));
                continue;
            }

            if let Some(caps) = self.location.captures(line) {
                if let Some((code, message)) = &pending
                    && let Some(file) = scope.resolve(&caps[1])
                {
                    let mut failure = AttributableFailure::new(file, message.clone())
                        .with_location(num(&caps, 2), num(&caps, 3));
                    if let Some(code) = code {
                        failure = failure.with_code(code.clone());
                    }
                    failures.push(failure);
                    pending = None;
                }
                continue;
            }

            if let Some(caps) = self.panic.captures(line)
                && let Some(file) = scope.resolve(&caps[2])
            {
                // newer toolchains print the panic message on the next line
                let message = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .or_else(|| lines.get(idx + 1).map(|l| l.trim().to_string()))
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "panicked".to_string());
                failures.push(
                    AttributableFailure::new(file, message)
                        .with_location(num(&caps, 3), num(&caps, 4))
                        .with_code("panic"),
                );
            }
        }
        failures
    }
}

/// `ruff check` in both the `file:l:c: CODE msg` and `CODE msg\n --> file:l:c` layouts.
pub struct RuffParser {
    inline: Regex,
    header: Regex,
    location: Regex,
}

impl RuffParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inline: Regex::new(r"^(.+?\.pyi?):(\d+):(\d+): ([A-Z]+\d+) (?:\[\*\] )?(.*)$")?,
            header: Regex::new(r"^([A-Z]+\d+) (?:\[\*\] )?(.+)$")?,
            location: Regex::new(r"^\s*--> (.+?):(\d+):(\d+)\s*$")?,
        })
    }
}

impl FailureLineParser for RuffParser {
    fn tool(&self) -> ToolKind {
        ToolKind::Ruff
    }

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure> {
        let mut failures = Vec::new();
        let mut pending: Option<(String, String)> = None;

        for line in output.lines() {
            if let Some(caps) = self.inline.captures(line) {
                if let Some(file) = scope.resolve(&caps[1]) {
                    failures.push(
                        AttributableFailure::new(file, caps[5].trim())
                            .with_location(num(&caps, 2), num(&caps, 3))
                            .with_code(&caps[4]),
                    );
                }
                pending = None;
            } else if let Some(caps) = self.header.captures(line) {
                pending = Some((caps[1].to_string(), caps[2].trim().to_string()));
            } else if let Some(caps) = self.location.captures(line)
                && let Some((code, message)) = pending.take()
                && let Some(file) = scope.resolve(&caps[1])
            {
                failures.push(
                    AttributableFailure::new(file, message)
                        .with_location(num(&caps, 2), num(&caps, 3))
                        .with_code(code),
                );
            }
        }
        failures
    }
}

/// pytest summaries plus Python tracebacks.
pub struct PytestParser {
    location: Regex,
    summary: Regex,
    frame: Regex,
}

impl PytestParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            location: Regex::new(r"^(.+?\.py):(\d+): (.+)$")?,
            summary: Regex::new(r"^(?:FAILED|ERROR) (.+?\.py)(?:::(\S+))?(?: - (.*))?$")?,
            frame: Regex::new(r#"^\s*File "(.+?)", line (\d+)"#)?,
        })
    }
}

impl FailureLineParser for PytestParser {
    fn tool(&self) -> ToolKind {
        ToolKind::Pytest
    }

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure> {
        let mut failures = Vec::new();
        // (first in-repo frame, in traceback)
        let mut frame: Option<(String, Option<u32>)> = None;
        let mut in_traceback = false;

        for line in output.lines() {
            if line.starts_with("Traceback (most recent call last)") {
                in_traceback = true;
                frame = None;
                continue;
            }

            if in_traceback {
                if let Some(caps) = self.frame.captures(line) {
                    if frame.is_none()
                        && let Some(file) = scope.resolve(&caps[1])
                    {
                        frame = Some((file, num(&caps, 2)));
                    }
                    continue;
                }
                if line.starts_with(' ') || line.trim().is_empty() {
                    continue;
                }
                // first unindented line ends the traceback: the exception
                in_traceback = false;
                if let Some((file, line_no)) = frame.take() {
                    let message = line.trim().to_string();
                    let code = message.split(':').next().unwrap_or("").trim().to_string();
                    let mut failure = AttributableFailure::new(file, message).with_location(line_no, None);
                    if !code.is_empty() && !code.contains(' ') {
                        failure = failure.with_code(code);
                    }
                    failures.push(failure);
                }
                continue;
            }

            if let Some(caps) = self.location.captures(line) {
                if let Some(file) = scope.resolve(&caps[1]) {
                    let message = caps[3].trim().to_string();
                    let code = message.split(':').next().unwrap_or("").trim().to_string();
                    let mut failure = AttributableFailure::new(file, message).with_location(num(&caps, 2), None);
                    if !code.is_empty() && !code.contains(' ') {
                        failure = failure.with_code(code);
                    }
                    failures.push(failure);
                }
            } else if let Some(caps) = self.summary.captures(line)
                && let Some(file) = scope.resolve(&caps[1])
            {
                let test = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                let detail = caps.get(3).map(|m| m.as_str()).unwrap_or("failed");
                let message = if test.is_empty() {
                    detail.to_string()
                } else {
                    format!("{}: {}", test, detail)
                };
                failures.push(AttributableFailure::new(file, message));
            }
        }
        failures
    }
}

/// Playwright list/line reporters.
pub struct PlaywrightParser {
    marker: Regex,
    stack: Regex,
}

impl PlaywrightParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            marker: Regex::new(r"›\s+(.+?\.(?:spec|test)\.(?:ts|js|tsx|jsx|mjs)):(\d+):(\d+)(?:\s+›\s+(.*))?")?,
            stack: Regex::new(r"^\s*at (?:.+? \()?(.+?\.(?:ts|js|tsx|jsx|mjs)):(\d+):(\d+)\)?\s*$")?,
        })
    }
}

impl FailureLineParser for PlaywrightParser {
    fn tool(&self) -> ToolKind {
        ToolKind::Playwright
    }

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure> {
        let mut failures = Vec::new();
        let mut first_frame: Option<AttributableFailure> = None;

        for line in output.lines() {
            if let Some(caps) = self.marker.captures(line) {
                if let Some(file) = scope.resolve(&caps[1]) {
                    let message = caps
                        .get(4)
                        .map(|m| m.as_str().trim().to_string())
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "test failed".to_string());
                    failures.push(AttributableFailure::new(file, message).with_location(num(&caps, 2), num(&caps, 3)));
                }
            } else if first_frame.is_none()
                && let Some(caps) = self.stack.captures(line)
                && let Some(file) = scope.resolve(&caps[1])
            {
                first_frame = Some(
                    AttributableFailure::new(file, "error raised here").with_location(num(&caps, 2), num(&caps, 3)),
                );
            }
        }

        if failures.is_empty()
            && let Some(frame) = first_frame
        {
            failures.push(frame);
        }
        failures
    }
}

/// `file:line[:col]: message`, for tools without a dedicated parser.
pub struct GenericParser {
    pattern: Regex,
}

impl GenericParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"^\s*([^\s:]+\.[A-Za-z0-9]+):(\d+)(?::(\d+))?:?\s*(.*)$")?,
        })
    }
}

impl FailureLineParser for GenericParser {
    fn tool(&self) -> ToolKind {
        ToolKind::Generic
    }

    fn parse(&self, output: &str, scope: &PathScope) -> Vec<AttributableFailure> {
        output
            .lines()
            .filter_map(|line| self.pattern.captures(line))
            .filter_map(|caps| {
                let file = scope.resolve(&caps[1])?;
                let message = caps[4].trim();
                let message = if message.is_empty() { "error" } else { message };
                Some(AttributableFailure::new(file, message).with_location(num(&caps, 2), num(&caps, 3)))
            })
            .collect()
    }
}
