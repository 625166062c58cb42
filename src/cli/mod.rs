//! CLI module for devloop - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running the loop,
//! exercising the patch pipeline directly, and inspecting past runs.

pub mod commands;

pub use commands::Cli;
