//! Fix-context feedback.
//!
//! Renders the failure history of a run into text the generator sees on a
//! fix attempt: a one-line summary per failed attempt plus the full detail
//! of the latest one.

use std::collections::BTreeMap;

use super::classify::{FailureReport, FailureTag};

/// Formatter for incorporating failure reports into fix requests.
pub struct FeedbackFormatter {
    /// Maximum number of excerpt lines to include.
    pub max_output_lines: usize,

    /// Maximum number of attributable failures to show per file.
    pub max_failures_per_file: usize,
}

impl Default for FeedbackFormatter {
    fn default() -> Self {
        Self {
            max_output_lines: 50,
            max_failures_per_file: 10,
        }
    }
}

impl FeedbackFormatter {
    /// Create a new formatter with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum excerpt lines.
    pub fn with_max_output_lines(mut self, max: usize) -> Self {
        self.max_output_lines = max;
        self
    }

    /// Set the maximum failures shown per file.
    pub fn with_max_failures_per_file(mut self, max: usize) -> Self {
        self.max_failures_per_file = max;
        self
    }

    /// Format a single failure report.
    pub fn format_single(&self, report: &FailureReport) -> String {
        let mut output = String::new();

        output.push_str(&format!("### Attempt {} failed: {}", report.attempt, heading(report.tag)));
        if let Some(step) = &report.step {
            output.push_str(&format!(" (step `{}`)", step));
        }
        output.push_str("\n\n");

        if let Some(exit) = &report.exit {
            output.push_str(&format!("Result: {}\n\n", exit.describe()));
        }

        // Group failures by file
        let mut by_file: BTreeMap<&str, Vec<_>> = BTreeMap::new();
        for failure in &report.failures {
            by_file.entry(failure.file.as_str()).or_default().push(failure);
        }

        for (file, failures) in &by_file {
            output.push_str(&format!("**{}**:\n", file));
            for failure in failures.iter().take(self.max_failures_per_file) {
                let code = failure.code.as_deref().map(|c| format!("[{}] ", c)).unwrap_or_default();
                output.push_str(&format!("- {}{} ({})\n", code, failure.message, failure.location_string()));
            }
            if failures.len() > self.max_failures_per_file {
                output.push_str(&format!(
                    "- ... and {} more in {}\n",
                    failures.len() - self.max_failures_per_file,
                    file
                ));
            }
            output.push('\n');
        }

        if !report.excerpt.trim().is_empty() {
            let truncated = truncate_tail_lines(&report.excerpt, self.max_output_lines);
            output.push_str(&format!("```\n{}\n```\n", truncated));
        }

        output
    }

    /// Format a history of failure reports for a fix request.
    pub fn format_history(&self, history: &[FailureReport]) -> String {
        if history.is_empty() {
            return String::new();
        }

        let mut output = String::new();
        output.push_str("## Previous Attempt Results\n\n");

        if history.len() > 1 {
            output.push_str("**Summary:**\n");
            for report in history {
                output.push_str(&format!("- {}\n", report.summary()));
            }
            output.push('\n');
        }

        if let Some(latest) = history.last() {
            output.push_str("**Most recent failure (focus on fixing this first):**\n\n");
            output.push_str(&self.format_single(latest));
        }

        output
    }
}

fn heading(tag: FailureTag) -> &'static str {
    match tag {
        FailureTag::CodeFailure => "verification failed",
        FailureTag::InfraFailure => "environment failure",
        FailureTag::ScopeFailure => "patch touched files outside the allowed set",
        FailureTag::PatchSyntaxFailure => "patch was not a valid unified diff",
        FailureTag::ApplyConflict => "patch did not apply to the current files",
    }
}

/// Keep the last `max_lines` lines; failures tend to be at the end.
fn truncate_tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let kept = &lines[lines.len() - max_lines..];
    format!("... (truncated)\n{}", kept.join("\n"))
}
