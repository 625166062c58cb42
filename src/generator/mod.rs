//! Patch generators.
//!
//! The loop never trusts what a generator returns: whatever comes back is a
//! `RawPatch` that still has to be parsed, validated and applied.
//!
//! - `CommandGenerator`: runs an external command, request JSON on stdin,
//!   unified diff on stdout
//! - `ScriptedGenerator`: replays queued patches, for tests and dry runs

pub mod command;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::patch::RawPatch;
use crate::verify::FailureReport;

pub use command::CommandGenerator;
pub use scripted::ScriptedGenerator;

/// Whether the generator is making the first attempt or fixing a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerateMode {
    Initial,
    Fix,
}

impl GenerateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerateMode::Initial => "initial",
            GenerateMode::Fix => "fix",
        }
    }
}

/// Current content of one file offered to the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    /// File text, capped; `<missing>` when the file does not exist
    pub content: String,
}

/// What went wrong last time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixContext {
    pub failure: FailureReport,
    /// Rendered failure history
    pub feedback: String,
    /// Files the failure points at that the patch may not touch
    pub out_of_scope: Vec<String>,
}

/// Everything a generator gets for one attempt. Persisted as `request.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub task: String,
    pub attempt: u32,
    pub mode: GenerateMode,
    /// Effective allow-list for this attempt, approvals included
    pub allowed_files: Vec<String>,
    pub files: Vec<FileContext>,
    pub fix: Option<FixContext>,
    /// Rendered prompt text
    #[serde(default)]
    pub prompt: String,
}

/// Produces candidate patches.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    /// Produce a patch for the request. A blank patch means "no change".
    ///
    /// On cancellation implementations return promptly; the caller checks
    /// the token before looking at the result.
    async fn generate(&self, request: &GenerateRequest, cancel: &CancellationToken) -> Result<RawPatch>;

    /// Short description for logs and `run.json`
    fn description(&self) -> String;
}
