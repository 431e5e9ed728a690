//! `nexus node`: create, stop, inspect and list nodes.

use clap::{Args, Subcommand};
use nexus_common::config::NexusConfig;
use nexus_common::constants::{DEFAULT_CPU_SHARES, DEFAULT_MEMORY_MB};
use nexus_runtime::engine::NodeService;

use crate::output;

/// Node subcommands.
#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Create and start a node.
    Create(CreateArgs),
    /// Stop a node and release its address.
    Stop {
        /// Node name.
        name: String,
    },
    /// Show the current state of a node.
    Inspect {
        /// Node name.
        name: String,
    },
    /// List every known node.
    Ls,
}

/// Arguments for `node create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Node name, also used as its hostname.
    pub name: String,

    /// Memory limit in MB (0 for unlimited).
    #[arg(long, default_value_t = DEFAULT_MEMORY_MB)]
    pub mem: u64,

    /// CPU shares on the 0-1024 scale (0 for the kernel default).
    #[arg(long, default_value_t = DEFAULT_CPU_SHARES)]
    pub cpu: u64,
}

/// Executes a `node` subcommand.
///
/// # Errors
///
/// Returns an error if the node service cannot be initialized or the
/// operation fails.
pub fn execute(command: NodeCommand, config: NexusConfig) -> anyhow::Result<()> {
    // bad requests are rejected before the host is touched
    if let NodeCommand::Create(args) = &command {
        let _ = NodeService::validate_request(&args.name, args.cpu)?;
    }
    let service = NodeService::new(config)?;
    match command {
        NodeCommand::Create(args) => {
            tracing::debug!(name = %args.name, mem = args.mem, cpu = args.cpu, "creating node");
            let state = service.create_node(&args.name, args.mem, args.cpu)?;
            if state.ip.is_none() {
                eprintln!("warning: node {} is running without network", state.id());
            }
            println!("{}", output::describe(&state));
        }
        NodeCommand::Stop { name } => {
            let state = service.stop_node(&name)?;
            println!("{}", output::describe(&state));
        }
        NodeCommand::Inspect { name } => {
            println!("{}", output::describe(&service.inspect_node(&name)?));
        }
        NodeCommand::Ls => {
            let nodes = service.list_nodes()?;
            if nodes.is_empty() {
                println!("No nodes found.");
            } else {
                println!("{}", output::table(&nodes));
            }
        }
    }
    Ok(())
}
