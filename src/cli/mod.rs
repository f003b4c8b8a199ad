//! Command-line interface for gradeprobe.
//!
//! Provides commands for serving the HTTP API, one-shot pipeline runs
//! and run listings.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
