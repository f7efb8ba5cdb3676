//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative reconciler for managed Kubernetes cluster stacks.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the spec file (searched upwards from the current directory if omitted).
    #[arg(short = 'f', long, global = true, env = "CONVERGE_SPEC")]
    pub spec: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter spec and .env template.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(long)]
        force: bool,
    },

    /// Validate the spec and its resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the resource graph in dependency levels.
    Graph,

    /// Compute and display the change plan.
    Plan {
        /// Show field-level changes.
        #[arg(short, long)]
        detailed: bool,

        /// Restrict the plan to one resource and its dependencies.
        #[arg(long)]
        target: Option<String>,
    },

    /// Apply the change plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Restrict the plan to one resource and its dependencies.
        #[arg(long)]
        target: Option<String>,

        /// Apply even if the plan breaks a guardrail.
        #[arg(long)]
        ignore_guardrails: bool,
    },

    /// Destroy every tracked resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Destroy even if the plan breaks a guardrail.
        #[arg(long)]
        ignore_guardrails: bool,
    },

    /// Compare tracked resources with the provider.
    Drift,

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held (dangerous).
        #[arg(long)]
        force: bool,
    },

    /// Stop tracking a resource without deleting it.
    Rm {
        /// Logical name of the resource.
        name: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_apply_flags() {
        let cli = Cli::try_parse_from([
            "converge",
            "-f",
            "stack.yaml",
            "--output",
            "json",
            "apply",
            "--yes",
            "--target",
            "node-group",
        ])
        .expect("parse");

        assert_eq!(cli.spec, Some(PathBuf::from("stack.yaml")));
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                yes,
                target,
                ignore_guardrails,
            } => {
                assert!(yes);
                assert_eq!(target.as_deref(), Some("node-group"));
                assert!(!ignore_guardrails);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parses_state_rm() {
        let cli = Cli::try_parse_from(["converge", "state", "rm", "ebs-driver"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Rm { ref name }
            } if name == "ebs-driver"
        ));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
