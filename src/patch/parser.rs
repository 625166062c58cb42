//! Unified-diff parser.
//!
//! Accepts `diff --git` style patches and plain `---`/`+++` unified diffs.
//! Anything the parser cannot tag is a hard error carrying the 1-based line
//! number and offending text; there is no best-effort recovery.

use log::debug;
use thiserror::Error;

use super::{ChangeKind, FileChange, Hunk, HunkLine, LineTag, ParsedPatch, normalize_path};

/// A patch text that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}: {content:?}")]
pub struct ParseError {
    /// 1-based line number in the cleaned input (0 when not line specific)
    pub line: usize,
    pub content: String,
    pub reason: String,
}

impl ParseError {
    fn new(line: usize, content: &str, reason: impl Into<String>) -> Self {
        Self {
            line,
            content: content.to_string(),
            reason: reason.into(),
        }
    }
}

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Normalize line endings, strip one surrounding code fence and the final
/// line terminator. Trailing blank lines are left for the hunk parser, which
/// knows whether a hunk still needs them as context.
pub fn clean_patch_text(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = text.trim_start_matches('\n');

    let text = match text.strip_prefix("```") {
        Some(rest) => {
            // drop the fence line (and its language tag)
            let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
            let fenced = body.trim_end_matches('\n');
            match fenced.rfind('\n') {
                Some(idx) if fenced[idx + 1..].trim() == "```" => &fenced[..=idx],
                None if fenced.trim() == "```" => "",
                _ => body,
            }
        }
        None => text,
    };

    text.strip_suffix('\n').unwrap_or(text).to_string()
}

/// Parse patch text into a structured patch.
pub fn parse_patch(raw: &str) -> ParseResult<ParsedPatch> {
    let cleaned = clean_patch_text(raw);
    let lines: Vec<&str> = if cleaned.is_empty() {
        Vec::new()
    } else {
        cleaned.split('\n').collect()
    };

    let mut files = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("diff --git ") {
            let (file, next) = parse_git_section(&lines, i)?;
            files.push(file);
            i = next;
        } else if is_plain_header(&lines, i) {
            let (file, next) = parse_plain_section(&lines, i)?;
            files.push(file);
            i = next;
        } else if is_blank(line) {
            i += 1;
        } else if files.is_empty() {
            return Err(ParseError::new(i + 1, line, "text before first file header"));
        } else {
            return Err(ParseError::new(i + 1, line, "unexpected line between files"));
        }
    }

    if files.is_empty() {
        return Err(ParseError::new(0, "", "no file headers"));
    }

    debug!("parse_patch: {} file(s)", files.len());
    Ok(ParsedPatch::new(files))
}

/// Blank for diff purposes: empty or only TAB / NBSP / zero-width space.
fn is_blank(line: &str) -> bool {
    line.chars().all(|c| matches!(c, '\t' | '\u{a0}' | '\u{200b}'))
}

fn is_plain_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
}

fn is_file_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("diff --git ") || is_plain_header(lines, i)
}

/// Only blank lines remain before the next header or end of input.
fn only_separators_follow(lines: &[&str], i: usize) -> bool {
    let mut j = i;
    while j < lines.len() && is_blank(lines[j]) {
        j += 1;
    }
    j == lines.len() || is_file_header(lines, j) || lines[j].starts_with("@@")
}

/// Parse one side of a `---`/`+++` marker. `None` means `/dev/null`.
fn parse_marker_path(value: &str) -> Option<String> {
    let value = value.split('\t').next().unwrap_or("").trim_end();
    if value == "/dev/null" {
        return None;
    }
    Some(strip_side_prefix(value))
}

fn strip_side_prefix(path: &str) -> String {
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    normalize_path(path)
}

/// Split `a/X b/Y` from a `diff --git` line.
fn split_git_paths(rest: &str) -> Option<(String, String)> {
    if let Some(after_a) = rest.strip_prefix("a/")
        && let Some(idx) = after_a.find(" b/")
    {
        return Some((normalize_path(&after_a[..idx]), normalize_path(&after_a[idx + 3..])));
    }
    let (left, right) = rest.split_once(' ')?;
    Some((strip_side_prefix(left), strip_side_prefix(right)))
}

#[derive(Default)]
struct GitHeader {
    new_file: bool,
    deleted_file: bool,
    rename_from: Option<String>,
    rename_to: Option<String>,
}

fn parse_git_section(lines: &[&str], start: usize) -> ParseResult<(FileChange, usize)> {
    let header = lines[start];
    let rest = &header["diff --git ".len()..];
    let (git_old, git_new) =
        split_git_paths(rest).ok_or_else(|| ParseError::new(start + 1, header, "malformed diff --git header"))?;

    let mut flags = GitHeader::default();
    let mut markers: Option<(Option<String>, Option<String>)> = None;

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("index ")
            || line.starts_with("old mode ")
            || line.starts_with("new mode ")
            || line.starts_with("similarity index ")
            || line.starts_with("dissimilarity index ")
        {
            i += 1;
        } else if line.starts_with("new file mode ") {
            flags.new_file = true;
            i += 1;
        } else if line.starts_with("deleted file mode ") {
            flags.deleted_file = true;
            i += 1;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            flags.rename_from = Some(normalize_path(from));
            i += 1;
        } else if let Some(to) = line.strip_prefix("rename to ") {
            flags.rename_to = Some(normalize_path(to));
            i += 1;
        } else if line.starts_with("copy from ") || line.starts_with("copy to ") {
            return Err(ParseError::new(i + 1, line, "copy patches are not supported"));
        } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            return Err(ParseError::new(i + 1, line, "binary patches are not supported"));
        } else if let Some(old) = line.strip_prefix("--- ") {
            let Some(new) = lines.get(i + 1).and_then(|next| next.strip_prefix("+++ ")) else {
                return Err(ParseError::new(i + 1, line, "'---' line without '+++' line"));
            };
            markers = Some((parse_marker_path(old), parse_marker_path(new)));
            i += 2;
            break;
        } else if line.starts_with("@@") || line.starts_with("diff --git ") {
            break;
        } else if is_blank(line) && only_separators_follow(lines, i) {
            i += 1;
        } else {
            return Err(ParseError::new(i + 1, line, "unrecognized line in file header"));
        }
    }

    let (mut old_path, mut new_path) = match markers {
        Some((old, new)) => (old, new),
        None => (Some(git_old), Some(git_new)),
    };
    if let Some(from) = flags.rename_from.take() {
        old_path = Some(from);
    }
    if let Some(to) = flags.rename_to.take() {
        new_path = Some(to);
    }
    if flags.new_file {
        old_path = None;
    }
    if flags.deleted_file {
        new_path = None;
    }

    let kind = match (&old_path, &new_path) {
        (None, None) => return Err(ParseError::new(start + 1, header, "both sides are /dev/null")),
        (None, Some(_)) => ChangeKind::Add,
        (Some(_), None) => ChangeKind::Delete,
        (Some(old), Some(new)) if old != new => ChangeKind::Rename,
        _ => ChangeKind::Modify,
    };

    let hunks = parse_hunks(lines, &mut i)?;
    Ok((
        FileChange {
            old_path,
            new_path,
            kind,
            hunks,
        },
        i,
    ))
}

fn parse_plain_section(lines: &[&str], start: usize) -> ParseResult<(FileChange, usize)> {
    let old_path = parse_marker_path(&lines[start]["--- ".len()..]);
    let new_path = parse_marker_path(&lines[start + 1]["+++ ".len()..]);

    let kind = match (&old_path, &new_path) {
        (None, None) => return Err(ParseError::new(start + 1, lines[start], "both sides are /dev/null")),
        (None, Some(_)) => ChangeKind::Add,
        (Some(_), None) => ChangeKind::Delete,
        (Some(old), Some(new)) if old != new => ChangeKind::Rename,
        _ => ChangeKind::Modify,
    };

    let mut i = start + 2;
    let hunks = parse_hunks(lines, &mut i)?;
    Ok((
        FileChange {
            old_path,
            new_path,
            kind,
            hunks,
        },
        i,
    ))
}

fn parse_hunks(lines: &[&str], i: &mut usize) -> ParseResult<Vec<Hunk>> {
    let mut hunks = Vec::new();
    while *i < lines.len() {
        let line = lines[*i];
        if line.starts_with("@@") {
            let mut hunk = parse_hunk_header(line).ok_or_else(|| ParseError::new(*i + 1, line, "malformed hunk header"))?;
            *i += 1;
            parse_hunk_body(lines, i, &mut hunk)?;
            hunks.push(hunk);
        } else if is_file_header(lines, *i) {
            break;
        } else if is_blank(line) && only_separators_follow(lines, *i) {
            *i += 1;
        } else {
            return Err(ParseError::new(*i + 1, line, "expected hunk header"));
        }
    }
    Ok(hunks)
}

fn parse_hunk_body(lines: &[&str], i: &mut usize, hunk: &mut Hunk) -> ParseResult<()> {
    while *i < lines.len() {
        let line = lines[*i];
        if line.starts_with("@@") || is_file_header(lines, *i) {
            break;
        }

        let tagged = match line.chars().next() {
            Some(' ') => HunkLine::new(LineTag::Context, &line[1..]),
            Some('+') => HunkLine::new(LineTag::Add, &line[1..]),
            Some('-') => HunkLine::new(LineTag::Delete, &line[1..]),
            Some('\\') => {
                let follows_line = hunk.lines.last().is_some_and(|l| l.tag != LineTag::NoNewline);
                if !follows_line {
                    return Err(ParseError::new(*i + 1, line, "no-newline marker without a preceding line"));
                }
                HunkLine::new(LineTag::NoNewline, &line[1..])
            }
            _ if is_blank(line) => {
                let satisfied = hunk.counted_old() >= hunk.old_len && hunk.counted_new() >= hunk.new_len;
                if satisfied && only_separators_follow(lines, *i) {
                    *i += 1;
                    continue;
                }
                // blank context line that lost its leading space
                HunkLine::new(LineTag::Context, "")
            }
            _ => {
                return Err(ParseError::new(
                    *i + 1,
                    line,
                    "hunk line does not start with ' ', '+', '-' or '\\'",
                ));
            }
        };
        hunk.lines.push(tagged);
        *i += 1;
    }
    Ok(())
}

/// Parse `@@ -a[,b] +c[,d] @@[ section]`.
fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, tail) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;

    let section = tail.strip_prefix(' ').unwrap_or(tail);
    let section = if section.is_empty() { None } else { Some(section.to_string()) };

    Some(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        section,
        lines: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
