//! Isolation runtime abstraction.
//!
//! The orchestrator only talks to [`IsolationRuntime`]; the Linux
//! implementation lives in [`linux`].

pub mod linux;

use nexus_common::error::Result;
use nexus_common::types::{IpAddress, NodeConfig, NodeId, NodeState};

pub use linux::LinuxRuntime;

/// Creates, supervises and tears down isolated node processes.
pub trait IsolationRuntime: Send + Sync {
    /// Creates the isolation environment of `config` and starts its init
    /// process.
    ///
    /// # Errors
    ///
    /// Returns [`nexus_common::error::NexusError::AlreadyExists`] if a live
    /// node with this id exists, or
    /// [`nexus_common::error::NexusError::StartFailed`] once the partial
    /// environment has been cleaned up.
    fn create_and_start(&self, config: &NodeConfig) -> Result<NodeState>;

    /// Stops a node's process and removes its cgroup. Stopping a stopped
    /// node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or cannot be stopped.
    fn stop(&self, id: &NodeId) -> Result<()>;

    /// Returns the recorded state of a node with its live status.
    ///
    /// # Errors
    ///
    /// Returns [`nexus_common::error::NexusError::NotFound`] for unknown
    /// nodes.
    fn get_state(&self, id: &NodeId) -> Result<NodeState>;

    /// Returns every known node with its live status.
    ///
    /// # Errors
    ///
    /// Returns an error if the bookkeeping cannot be listed.
    fn list(&self) -> Result<Vec<NodeState>>;

    /// Records the address wired into a running node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or its record cannot be
    /// written.
    fn record_address(&self, id: &NodeId, address: &IpAddress) -> Result<()>;
}
