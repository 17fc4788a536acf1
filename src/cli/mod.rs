//! Command-line interface for solvebench.
//!
//! Provides commands for running benchmark tasks against stored model
//! responses and for inspecting task definitions.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
