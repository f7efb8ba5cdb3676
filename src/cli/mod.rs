//! Command-line interface.
//!
//! Argument definitions and output formatting for the `converge` binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
