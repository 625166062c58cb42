//! DevLoop - an automated code-change loop
//!
//! DevLoop asks a generator for a unified diff, validates it against the
//! working tree and a file allow-list, applies it atomically, runs the
//! verify chain, and classifies any failure into retry, halt or give up.

pub mod domain;
pub mod error;
pub mod generator;
pub mod id;
pub mod patch;
pub mod process;
pub mod prompt;
pub mod runner;
pub mod storage;
pub mod tree;
pub mod verify;

pub use error::{DevloopError, Result};
