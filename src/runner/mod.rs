//! Loop runner module - drives a run through the DevLoop state machine.
//!
//! - `DevLoop`: the orchestrator, the only writer of a run directory
//! - `RunOutcome`: what a finished run reports back to the caller

mod devloop;

pub use devloop::{DevLoop, DevLoopConfig, MISSING_FILE, RunOutcome};
