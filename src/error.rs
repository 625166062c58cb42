//! Error types for devloop
//!
//! Operational failures only. Patch rejections, apply conflicts and verify
//! failures are ordinary values the orchestrator routes on, not errors.

use thiserror::Error;

/// All error types that can occur in devloop
#[derive(Debug, Error)]
pub enum DevloopError {
    /// Configuration is missing or inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Patch text could not be read or handled outside the validation path
    #[error("Patch error: {0}")]
    Patch(String),

    /// Run directory / artifact persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// External change generator failed to produce output
    #[error("Generator error: {0}")]
    Generator(String),

    /// Prompt template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Failure-line pattern did not compile
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type alias for devloop operations
pub type Result<T> = std::result::Result<T, DevloopError>;
