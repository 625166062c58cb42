//! Run-record storage.
//!
//! - `run_dir`: `RunContext`, the only writer of a run directory
//! - `runs`: reading finished and in-progress runs back

pub mod run_dir;
pub mod runs;

pub use run_dir::{RunContext, RunHeader, RunResult, safe_name};
pub use runs::{RunDetails, RunSummary, list_runs, load_run, read_events};
