//! Command-line interface for prefforge.
//!
//! Provides the synchronous ask entry point, the two standalone worker
//! processes, a single-process demo mode, and sink statistics.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Command};
