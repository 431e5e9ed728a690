//! CLI command definitions and dispatch.

pub mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nexus_common::config::NexusConfig;

/// Nexus: isolated node provisioning for a single host.
#[derive(Parser, Debug)]
#[command(name = "nexus", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file overriding the built-in defaults.
    #[arg(long, global = true, env = "NEXUS_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, stop and inspect nodes.
    #[command(subcommand)]
    Node(node::NodeCommand),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = NexusConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Node(command) => node::execute(command, config),
    }
}
