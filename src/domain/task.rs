//! The task a run is working on.

use serde::{Deserialize, Serialize};

use crate::patch::normalize_path;

/// Natural-language task plus the explicit file allow-list. Immutable for
/// the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// Normalized repo-relative paths, first occurrence order
    pub allowed_files: Vec<String>,
}

impl Task {
    pub fn new<I, S>(description: impl Into<String>, allowed_files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files: Vec<String> = Vec::new();
        for file in allowed_files {
            let path = normalize_path(file.as_ref());
            if !path.is_empty() && !files.contains(&path) {
                files.push(path);
            }
        }
        Self {
            description: description.into(),
            allowed_files: files,
        }
    }

    pub fn allows(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.allowed_files.iter().any(|f| *f == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_normalizes_and_dedupes() {
        let task = Task::new("fix it", ["./src/lib.rs", "src/lib.rs", "tests\\a.rs", ""]);
        assert_eq!(task.allowed_files, vec!["src/lib.rs", "tests/a.rs"]);
    }

    #[test]
    fn test_task_allows() {
        let task = Task::new("fix it", ["src/lib.rs"]);
        assert!(task.allows("./src/lib.rs"));
        assert!(!task.allows("src/main.rs"));
    }
}
