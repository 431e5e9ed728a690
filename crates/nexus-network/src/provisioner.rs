//! Network provisioning contract consumed by the node orchestrator.

use nexus_common::error::Result;
use nexus_common::types::{IpAddress, NodeId};

/// Connects nodes to a host network fabric.
///
/// Implementations own the bridge and every link they create for a node.
pub trait NetworkProvisioner: Send + Sync {
    /// Ensures the host bridge exists, is addressed and is up. Calling it
    /// again once the bridge exists changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be created or configured.
    fn setup_bridge(&self) -> Result<()>;

    /// Leases an address for `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`nexus_common::error::NexusError::AddressExhausted`] when
    /// the pool is empty.
    fn assign_ip(&self, node_id: &NodeId) -> Result<IpAddress>;

    /// Wires the node whose init process is `pid` to the bridge and
    /// configures `ip` on its guest interface.
    ///
    /// # Errors
    ///
    /// Returns [`nexus_common::error::NexusError::WiringFailed`] wrapping
    /// the first failing step and any error hit while removing the partial
    /// wiring. The caller's thread is never left in the node's namespace.
    fn setup_container_network(&self, node_id: &NodeId, pid: i32, ip: &IpAddress) -> Result<()>;

    /// Removes the node's host-side link. A node without wiring is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing link cannot be deleted.
    fn teardown_container_network(&self, node_id: &NodeId) -> Result<()>;

    /// Returns one address to the pool. Releasing an address that is not
    /// leased is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease table cannot be updated.
    fn release_ip(&self, ip: &IpAddress) -> Result<()>;

    /// Returns every address leased to `node_id` to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease table cannot be updated.
    fn release_node(&self, node_id: &NodeId) -> Result<()>;
}
