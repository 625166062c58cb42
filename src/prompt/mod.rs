//! Prompt System - Generator prompt rendering
//!
//! Renders a `GenerateRequest` into prompt text using Handlebars, from the
//! built-in template or a configured template file.

mod render;

pub use render::{DEFAULT_TEMPLATE, PromptRenderer};
