//! Patch model: unified-diff parsing, validation, scope checks and application.
//!
//! A patch moves through these types in one direction only:
//! `RawPatch` -> `ParsedPatch` -> `ValidatedPatch` -> `ApplyOutcome`.

pub mod apply;
pub mod parser;
pub mod render;
pub mod scope;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use apply::{ApplyOutcome, Conflict, PatchApplier};
pub use parser::{ParseError, parse_patch};
pub use scope::{ScopeDecision, ScopeEntry, ScopeGuard};
pub use validate::{PatchValidator, ValidatedPatch, ValidationResult, Verdict, Violation, ViolationKind};

/// Unstructured producer output that claims to be a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPatch {
    pub text: String,
}

impl RawPatch {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// True when the producer proposed no change at all.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// How a file is affected by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Rename,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename => "rename",
        }
    }

    fn reversed(self) -> Self {
        match self {
            ChangeKind::Add => ChangeKind::Delete,
            ChangeKind::Delete => ChangeKind::Add,
            other => other,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tag carried by every line of a hunk body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTag {
    Context,
    Add,
    Delete,
    /// `\ No newline at end of file`, applies to the line before it
    NoNewline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkLine {
    pub tag: LineTag,
    pub text: String,
}

impl HunkLine {
    pub fn new(tag: LineTag, text: impl Into<String>) -> Self {
        Self { tag, text: text.into() }
    }
}

/// One contiguous change region within a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    /// Trailing text after the closing `@@`, usually a function name
    pub section: Option<String>,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Context + delete lines actually present in the body.
    pub fn counted_old(&self) -> u32 {
        self.lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Delete))
            .count() as u32
    }

    /// Context + add lines actually present in the body.
    pub fn counted_new(&self) -> u32 {
        self.lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Add))
            .count() as u32
    }

    pub fn counts_match(&self) -> bool {
        self.counted_old() == self.old_len && self.counted_new() == self.new_len
    }

    /// A hunk without context lines can only be placed at its declared line.
    pub fn has_context(&self) -> bool {
        self.lines.iter().any(|l| l.tag == LineTag::Context)
    }

    /// Lines the hunk expects to find in the pre-image.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Delete))
            .map(|l| l.text.as_str())
            .collect()
    }

    /// Lines the hunk leaves in the post-image.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l.tag, LineTag::Context | LineTag::Add))
            .map(|l| l.text.as_str())
            .collect()
    }

    /// The pre-image ends without a trailing newline.
    pub fn old_missing_newline(&self) -> bool {
        self.marker_follows(|tag| matches!(tag, LineTag::Context | LineTag::Delete))
    }

    /// The post-image ends without a trailing newline.
    pub fn new_missing_newline(&self) -> bool {
        self.marker_follows(|tag| matches!(tag, LineTag::Context | LineTag::Add))
    }

    fn marker_follows(&self, side: impl Fn(LineTag) -> bool) -> bool {
        self.lines
            .windows(2)
            .any(|pair| pair[1].tag == LineTag::NoNewline && side(pair[0].tag))
    }

    /// The hunk that undoes this one.
    pub fn reversed(&self) -> Hunk {
        let lines = self
            .lines
            .iter()
            .map(|l| {
                let tag = match l.tag {
                    LineTag::Add => LineTag::Delete,
                    LineTag::Delete => LineTag::Add,
                    other => other,
                };
                HunkLine::new(tag, l.text.clone())
            })
            .collect();

        Hunk {
            old_start: self.new_start,
            old_len: self.new_len,
            new_start: self.old_start,
            new_len: self.old_len,
            section: self.section.clone(),
            lines,
        }
    }
}

/// Everything a patch does to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Pre-image path, `None` for additions
    pub old_path: Option<String>,
    /// Post-image path, `None` for deletions
    pub new_path: Option<String>,
    pub kind: ChangeKind,
    pub hunks: Vec<Hunk>,
}

impl FileChange {
    /// The path this change is reported under.
    pub fn path(&self) -> &str {
        let preferred = match self.kind {
            ChangeKind::Delete => self.old_path.as_deref(),
            _ => self.new_path.as_deref(),
        };
        preferred
            .or(self.old_path.as_deref())
            .or(self.new_path.as_deref())
            .unwrap_or("")
    }

    /// Every repository path this change reads or writes.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for path in [self.old_path.as_deref(), self.new_path.as_deref()].into_iter().flatten() {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    pub fn reversed(&self) -> FileChange {
        FileChange {
            old_path: self.new_path.clone(),
            new_path: self.old_path.clone(),
            kind: self.kind.reversed(),
            hunks: self.hunks.iter().map(Hunk::reversed).collect(),
        }
    }
}

/// A structurally parsed patch, one entry per file header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPatch {
    pub files: Vec<FileChange>,
}

impl ParsedPatch {
    pub fn new(files: Vec<FileChange>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All touched paths in patch order, without duplicates.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for file in &self.files {
            for path in file.touched_paths() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// The patch that undoes this one.
    pub fn reversed(&self) -> ParsedPatch {
        ParsedPatch {
            files: self.files.iter().map(FileChange::reversed).collect(),
        }
    }
}

/// Normalize a repository-relative path for comparison.
///
/// Converts `\` to `/`, strips leading `./` and collapses repeated slashes.
/// `..` components are kept so the validator can reject them.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for (idx, part) in unified.split('/').enumerate() {
        if part.is_empty() && idx > 0 {
            continue;
        }
        if part == "." {
            continue;
        }
        parts.push(part);
    }
    parts.join("/")
}
