//! Verification: running the check chain and making sense of its output.
//!
//! - `runner`: executes configured steps in order, stopping at the first failure
//! - `infra`: environment-failure signatures
//! - `failure`: per-tool parsers producing repo-attributable failures
//! - `classify`: the single place a failure kind is decided
//! - `feedback`: failure history rendered for fix requests

pub mod classify;
pub mod failure;
pub mod feedback;
pub mod infra;
pub mod runner;

pub use classify::{Classifier, Evidence, FailureKind, FailureReport, FailureTag};
pub use failure::{AttributableFailure, FailureLineParser, PathScope, ToolKind, extract_failures, parser_for};
pub use feedback::FeedbackFormatter;
pub use infra::{DEFAULT_INFRA_SIGNATURES, InfraGuard, InfraMatch};
pub use runner::{StepExit, VerifyReport, VerifyRunner, VerifyStatus, VerifyStep, VerifyStepSpec};
