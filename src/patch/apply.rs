//! Patch Applier.
//!
//! Computes every resulting file in memory, then hands the whole set to
//! `WorkingTree::commit`. A patch whose reverse applies cleanly is already
//! in place and is reported as a no-op without touching the tree.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{ChangeKind, FileChange, Hunk, ParsedPatch, ValidatedPatch};
use crate::error::{DevloopError, Result};
use crate::tree::{PendingWrite, RepoOracle, WorkingTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        files: Vec<String>,
    },
    AlreadyAppliedNoop,
    Rejected {
        path: String,
        hunk_index: Option<usize>,
        detail: String,
    },
}

impl ApplyOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ApplyOutcome::Rejected { .. })
    }
}

/// Why a patch does not apply to the current content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub hunk_index: Option<usize>,
    pub detail: String,
}

impl Conflict {
    fn file(path: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            hunk_index: None,
            detail: detail.into(),
        }
    }

    fn into_outcome(self) -> ApplyOutcome {
        ApplyOutcome::Rejected {
            path: self.path,
            hunk_index: self.hunk_index,
            detail: self.detail,
        }
    }
}

/// File content as lines plus exact end-of-file newline state.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TextFile {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl TextFile {
    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            trailing_newline: true,
        }
    }

    fn parse(content: &str) -> Self {
        let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
        let trailing_newline = lines.last().is_some_and(|l| l.is_empty());
        if trailing_newline {
            lines.pop();
        }
        Self { lines, trailing_newline }
    }

    fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Content a pure-addition file change creates.
pub(crate) fn added_content(change: &FileChange) -> Option<String> {
    apply_hunks(&TextFile::empty(), &change.hunks)
        .ok()
        .map(|file| file.render())
}

pub struct PatchApplier<'a> {
    tree: &'a WorkingTree,
}

impl<'a> PatchApplier<'a> {
    pub fn new(tree: &'a WorkingTree) -> Self {
        Self { tree }
    }

    /// Apply a validated patch atomically.
    pub fn apply(&self, validated: &ValidatedPatch) -> Result<ApplyOutcome> {
        let patch = validated.patch();

        let reversed = patch.reversed();
        if reverse_is_evidence(&reversed) && self.dry_run(&reversed)?.is_ok() {
            info!("apply: reverse applies cleanly, patch already in place");
            return Ok(ApplyOutcome::AlreadyAppliedNoop);
        }

        for (path, recorded) in validated.fingerprints() {
            let current = self.tree.fingerprint(path)?;
            if current != *recorded {
                return Ok(Conflict::file(path, "changed since validation").into_outcome());
            }
        }

        match self.dry_run(patch)? {
            Ok(writes) => {
                self.tree.commit(&writes)?;
                let files = patch.files.iter().map(|f| f.path().to_string()).collect::<Vec<_>>();
                info!("apply: {} file(s) changed", files.len());
                Ok(ApplyOutcome::Applied { files })
            }
            Err(conflict) => {
                debug!("apply: conflict in {}: {}", conflict.path, conflict.detail);
                Ok(conflict.into_outcome())
            }
        }
    }

    /// Compute the writes a patch would perform, without performing them.
    pub fn dry_run(&self, patch: &ParsedPatch) -> Result<std::result::Result<Vec<PendingWrite>, Conflict>> {
        let mut writes = Vec::new();
        for file in &patch.files {
            match self.plan_file(file)? {
                Ok(mut planned) => writes.append(&mut planned),
                Err(conflict) => return Ok(Err(conflict)),
            }
        }
        Ok(Ok(writes))
    }

    fn plan_file(&self, file: &FileChange) -> Result<std::result::Result<Vec<PendingWrite>, Conflict>> {
        let path = file.path().to_string();

        let old_path = file.old_path.as_deref();
        let current = match old_path {
            Some(old) => match self.read(old)? {
                Ok(Some(text)) => Some(text),
                Ok(None) => return Ok(Err(Conflict::file(old, "file does not exist"))),
                Err(conflict) => return Ok(Err(conflict)),
            },
            None => {
                if self.tree.fingerprint(&path)?.is_some() {
                    return Ok(Err(Conflict::file(&path, "file already exists")));
                }
                None
            }
        };

        if file.kind == ChangeKind::Rename
            && let Some(new) = file.new_path.as_deref()
            && self.tree.fingerprint(new)?.is_some()
        {
            return Ok(Err(Conflict::file(new, "rename destination already exists")));
        }

        let before = match &current {
            Some(text) => TextFile::parse(text),
            None => TextFile::empty(),
        };
        let after = match apply_hunks(&before, &file.hunks) {
            Ok(after) => after,
            Err((hunk_index, detail)) => {
                return Ok(Err(Conflict {
                    path,
                    hunk_index: Some(hunk_index),
                    detail,
                }));
            }
        };

        let writes = match file.kind {
            ChangeKind::Add | ChangeKind::Modify => vec![PendingWrite::Write {
                path,
                content: after.render(),
            }],
            ChangeKind::Delete => {
                if !after.lines.is_empty() {
                    return Ok(Err(Conflict::file(&path, "delete leaves content behind")));
                }
                vec![PendingWrite::Remove { path }]
            }
            ChangeKind::Rename => {
                let old = old_path.unwrap_or_default().to_string();
                vec![
                    PendingWrite::Write {
                        path,
                        content: after.render(),
                    },
                    PendingWrite::Remove { path: old },
                ]
            }
        };
        Ok(Ok(writes))
    }

    fn read(&self, path: &str) -> Result<std::result::Result<Option<String>, Conflict>> {
        match self.tree.read_text(path) {
            Ok(text) => Ok(Ok(text)),
            Err(DevloopError::Patch(detail)) => Ok(Err(Conflict::file(path, detail))),
            Err(e) => Err(e),
        }
    }
}

/// A reversed hunk with nothing to match (the original deleted lines without
/// context) applies anywhere and proves nothing about the tree.
fn reverse_is_evidence(reversed: &ParsedPatch) -> bool {
    reversed
        .files
        .iter()
        .all(|f| f.old_path.is_none() || f.hunks.iter().all(|h| !h.old_lines().is_empty()))
}

/// Apply hunks in order, tracking the cumulative line offset.
fn apply_hunks(file: &TextFile, hunks: &[Hunk]) -> std::result::Result<TextFile, (usize, String)> {
    let mut lines = file.lines.clone();
    let mut trailing_newline = file.trailing_newline;
    let mut offset: i64 = 0;
    let mut min_pos: usize = 0;

    for (idx, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new: Vec<String> = hunk.new_lines().into_iter().map(str::to_string).collect();

        // insertion-only hunks name the line they follow
        let base = if hunk.old_len == 0 {
            hunk.old_start as i64
        } else {
            hunk.old_start as i64 - 1
        };
        let expected = base + offset;

        let pos = if old.is_empty() {
            if expected < min_pos as i64 || expected > lines.len() as i64 {
                return Err((idx, format!("insertion point {} is outside the file", expected + 1)));
            }
            expected as usize
        } else {
            let max_distance = if hunk.has_context() { lines.len() as i64 + 1 } else { 0 };
            find_position(&lines, &old, expected, min_pos, max_distance)
                .ok_or_else(|| (idx, mismatch_detail(&lines, &old, expected)))?
        };

        let at_eof = pos + old.len() == lines.len();
        if hunk.old_missing_newline() {
            if !at_eof || trailing_newline {
                return Err((idx, "expected no newline at end of file".to_string()));
            }
        } else if at_eof && !old.is_empty() && !trailing_newline {
            return Err((idx, "file has no newline at end of file".to_string()));
        }

        lines.splice(pos..pos + old.len(), new.iter().cloned());

        if at_eof {
            trailing_newline = !hunk.new_missing_newline();
        } else if hunk.new_missing_newline() {
            return Err((idx, "no-newline marker is not at end of file".to_string()));
        }

        offset = pos as i64 - base + new.len() as i64 - old.len() as i64;
        min_pos = pos + new.len();
    }

    Ok(TextFile { lines, trailing_newline })
}

/// Nearest exact match to `expected`, searching outward at most `max_distance` lines.
fn find_position(lines: &[String], old: &[&str], expected: i64, min_pos: usize, max_distance: i64) -> Option<usize> {
    if old.len() > lines.len() {
        return None;
    }
    let last_start = (lines.len() - old.len()) as i64;
    let matches_at = |pos: i64| -> bool {
        pos >= min_pos as i64
            && pos <= last_start
            && lines[pos as usize..pos as usize + old.len()]
                .iter()
                .zip(old)
                .all(|(have, want)| have == want)
    };

    for distance in 0..=max_distance {
        if matches_at(expected - distance) {
            return Some((expected - distance) as usize);
        }
        if distance > 0 && matches_at(expected + distance) {
            return Some((expected + distance) as usize);
        }
    }
    None
}

fn mismatch_detail(lines: &[String], old: &[&str], expected: i64) -> String {
    for (i, want) in old.iter().enumerate() {
        let at = expected + i as i64;
        let have = if at >= 0 { lines.get(at as usize) } else { None };
        match have {
            Some(have) if have == want => continue,
            Some(have) => {
                return format!(
                    "expected {:?} at line {}, found {:?}",
                    want,
                    at + 1,
                    have
                );
            }
            None => return format!("expected {:?} at line {}, found end of file", want, at + 1),
        }
    }
    "context matches only at an earlier, already patched position".to_string()
}
