//! Command-line interface.

use clap::{Parser, Subcommand};

/// ProcWarden — endpoint policy-enforcement agent.
#[derive(Debug, Parser)]
#[command(name = "procwarden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent (default when no subcommand is given).
    Run,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the current configuration document (token redacted).
    Show,
    /// Print the path of the configuration file.
    Path,
}
