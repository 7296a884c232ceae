//! Command-line interface for hint-forge.
//!
//! Provides commands for schema migration, running workers, submitting
//! requests and reflections, and inspecting the task queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
