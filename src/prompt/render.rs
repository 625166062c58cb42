//! Prompt Renderer - Render generator requests with Handlebars
//!
//! The rendered text travels inside the `GenerateRequest`, so an external
//! generator can pass it straight to a model.

use std::path::Path;

use handlebars::Handlebars;

use crate::error::{DevloopError, Result};
use crate::generator::GenerateRequest;

const TEMPLATE_NAME: &str = "generate";

/// Built-in template, used unless configuration points at another one.
pub const DEFAULT_TEMPLATE: &str = r#"You are a code-change agent working in a checked-out repository.

Task:
{{task}}

Attempt {{attempt}} ({{mode}}).

ALLOWED FILES (edit ONLY these exact repo-relative paths):
{{#each allowed_files}}
- {{this}}
{{/each}}

Files (current contents):
{{#each files}}
=== {{path}} ===
{{content}}

{{/each}}
{{#if fix}}
{{fix.feedback}}
{{#if fix.out_of_scope}}
These files are referenced by the failure but are OUT OF SCOPE. Do not edit them:
{{#each fix.out_of_scope}}
- {{this}}
{{/each}}
{{/if}}
{{/if}}
Output rules:
- Return ONLY a unified diff starting with `diff --git a/<path> b/<path>`.
- No markdown fences and no explanations.
- Every context line starts with a single space; blank context lines are a single space.
- Hunk header counts must match the lines in the hunk.
- Touch only the allowed files.
- If no change is needed, return nothing.
"#;

/// Renders generator prompts using Handlebars templating
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl PromptRenderer {
    /// Renderer for the built-in template
    pub fn new() -> Result<Self> {
        Self::with_template(DEFAULT_TEMPLATE)
    }

    /// Renderer for a custom template string
    pub fn with_template(template: &str) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // prompts are plain text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(TEMPLATE_NAME, template)
            .map_err(|e| DevloopError::Template(format!("Failed to register template: {}", e)))?;
        Ok(Self { handlebars })
    }

    /// Renderer for a template file
    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path).map_err(|e| {
            DevloopError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to load template from {:?}: {}", path, e),
            ))
        })?;
        Self::with_template(&template)
    }

    /// Render the prompt for a request. The request's own `prompt` field is
    /// ignored.
    pub fn render(&self, request: &GenerateRequest) -> Result<String> {
        self.handlebars
            .render(TEMPLATE_NAME, request)
            .map_err(|e| DevloopError::Template(format!("Failed to render template: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{FileContext, FixContext, GenerateMode};
    use crate::verify::{FailureReport, FailureTag};
    use tempfile::TempDir;

    fn request() -> GenerateRequest {
        GenerateRequest {
            task: "Add a greeting".to_string(),
            attempt: 1,
            mode: GenerateMode::Initial,
            allowed_files: vec!["src/a.py".to_string()],
            files: vec![FileContext {
                path: "src/a.py".to_string(),
                content: "if a < b and c > d:\n    pass\n".to_string(),
            }],
            fix: None,
            prompt: String::new(),
        }
    }

    #[test]
    fn test_default_template_renders_request() {
        let text = PromptRenderer::new().unwrap().render(&request()).unwrap();
        assert!(text.contains("Add a greeting"));
        assert!(text.contains("Attempt 1 (initial)"));
        assert!(text.contains("- src/a.py"));
        assert!(text.contains("=== src/a.py ==="));
        assert!(!text.contains("OUT OF SCOPE"));
    }

    #[test]
    fn test_no_html_escaping() {
        let text = PromptRenderer::new().unwrap().render(&request()).unwrap();
        assert!(text.contains("if a < b and c > d:"));
    }

    #[test]
    fn test_fix_section() {
        let mut req = request();
        req.attempt = 2;
        req.mode = GenerateMode::Fix;
        req.fix = Some(FixContext {
            failure: FailureReport::new(1, FailureTag::CodeFailure, "boom"),
            feedback: "## Previous Attempt Results".to_string(),
            out_of_scope: vec!["lib/other.py".to_string()],
        });
        let text = PromptRenderer::new().unwrap().render(&req).unwrap();
        assert!(text.contains("Attempt 2 (fix)"));
        assert!(text.contains("## Previous Attempt Results"));
        assert!(text.contains("OUT OF SCOPE"));
        assert!(text.contains("- lib/other.py"));
    }

    #[test]
    fn test_custom_template() {
        let renderer = PromptRenderer::with_template("{{task}} #{{attempt}}").unwrap();
        assert_eq!(renderer.render(&request()).unwrap(), "Add a greeting #1");
    }

    #[test]
    fn test_invalid_template_is_error() {
        assert!(PromptRenderer::with_template("{{#if task}}unclosed").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompt.hbs");
        std::fs::write(&path, "files: {{#each allowed_files}}{{this}} {{/each}}").unwrap();
        let renderer = PromptRenderer::from_file(&path).unwrap();
        assert_eq!(renderer.render(&request()).unwrap(), "files: src/a.py ");
        assert!(PromptRenderer::from_file(&dir.path().join("missing.hbs")).is_err());
    }
}
