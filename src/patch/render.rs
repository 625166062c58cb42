//! Canonical rendering of a parsed patch.
//!
//! The output is what gets persisted as the normalized patch of an attempt.
//! Parsing it again yields an equal `ParsedPatch`.

use super::{ChangeKind, FileChange, Hunk, LineTag, ParsedPatch};

impl ParsedPatch {
    /// Render as a `diff --git` style unified diff.
    pub fn to_unified(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            render_file(file, &mut out);
        }
        out
    }
}

fn render_file(file: &FileChange, out: &mut String) {
    let path = file.path();
    let old = file.old_path.as_deref().unwrap_or(path);
    let new = file.new_path.as_deref().unwrap_or(path);
    out.push_str(&format!("diff --git a/{} b/{}\n", old, new));

    match file.kind {
        ChangeKind::Add => out.push_str("new file mode 100644\n"),
        ChangeKind::Delete => out.push_str("deleted file mode 100644\n"),
        ChangeKind::Rename => {
            out.push_str(&format!("rename from {}\n", old));
            out.push_str(&format!("rename to {}\n", new));
        }
        ChangeKind::Modify => {}
    }

    if file.hunks.is_empty() {
        return;
    }

    match &file.old_path {
        Some(p) => out.push_str(&format!("--- a/{}\n", p)),
        None => out.push_str("--- /dev/null\n"),
    }
    match &file.new_path {
        Some(p) => out.push_str(&format!("+++ b/{}\n", p)),
        None => out.push_str("+++ /dev/null\n"),
    }

    for hunk in &file.hunks {
        render_hunk(hunk, out);
    }
}

fn render_hunk(hunk: &Hunk, out: &mut String) {
    out.push_str(&format!(
        "@@ -{},{} +{},{} @@",
        hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len
    ));
    if let Some(section) = &hunk.section {
        out.push(' ');
        out.push_str(section);
    }
    out.push('\n');

    for line in &hunk.lines {
        let prefix = match line.tag {
            LineTag::Context => ' ',
            LineTag::Add => '+',
            LineTag::Delete => '-',
            LineTag::NoNewline => '\\',
        };
        out.push(prefix);
        out.push_str(&line.text);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use crate::patch::parse_patch;

    #[test]
    fn test_render_reparses_to_equal_patch() {
        let text = "\
diff --git a/src/a.rs b/src/a.rs
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,3 +1,3 @@ fn main
 one

-three
+THREE
\\ No newline at end of file
diff --git a/new.txt b/new.txt
new file mode 100644
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hello
diff --git a/from.rs b/to.rs
rename from from.rs
rename to to.rs
";
        let parsed = parse_patch(text).unwrap();
        let rendered = parsed.to_unified();
        let reparsed = parse_patch(&rendered).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_render_uses_explicit_lengths() {
        let parsed = parse_patch("--- a/f\n+++ b/f\n@@ -2 +2 @@\n-a\n+b\n").unwrap();
        let rendered = parsed.to_unified();
        assert!(rendered.starts_with("diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -2,1 +2,1 @@\n"));
        assert!(rendered.ends_with("-a\n+b\n"));
    }

    #[test]
    fn test_render_blank_context_gets_leading_space() {
        let parsed = parse_patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n\n-a\n+b\n").unwrap();
        assert!(parsed.to_unified().contains("\n \n-a\n"));
    }

    #[test]
    fn test_render_delete_without_hunks() {
        let parsed = parse_patch("diff --git a/empty b/empty\ndeleted file mode 100644\n").unwrap();
        let rendered = parsed.to_unified();
        assert_eq!(rendered, "diff --git a/empty b/empty\ndeleted file mode 100644\n");
        assert_eq!(parse_patch(&rendered).unwrap(), parsed);
    }
}
