//! Domain types for devloop
//!
//! - Task: the description and file allow-list a run works on
//! - ScopeApproval: operator-approved, per-attempt scope expansion
//! - LoopState / RunStatus: the state machine and how a run ended
//! - RunEvent: entries in the run's append-only event log

pub mod approval;
pub mod event;
pub mod status;
pub mod task;

pub use approval::{ApprovalSet, ScopeApproval};
pub use event::{RunEvent, event_types};
pub use status::{LoopState, RunStatus};
pub use task::Task;
