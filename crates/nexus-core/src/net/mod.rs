//! Network link management.
//!
//! [`LinkOps`] is the seam between the network provisioner and the kernel.
//! Every operation acts on the network namespace of the *calling thread*,
//! so a caller that has entered a node's namespace through
//! [`crate::namespace::network::NetnsGuard`] manipulates that node's links.

pub mod iproute2;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use nexus_common::error::Result;

pub use iproute2::IpRoute2;

/// Link, address and route operations used to wire nodes to the bridge.
pub trait LinkOps: Send + Sync {
    /// Whether a link named `name` exists in the current namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails.
    fn link_exists(&self, name: &str) -> Result<bool>;

    /// Creates a bridge link.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the link.
    fn add_bridge(&self, name: &str) -> Result<()>;

    /// Creates a veth pair. With `peer_netns` set, the peer end is created
    /// directly inside the network namespace of that pid.
    ///
    /// # Errors
    ///
    /// Returns an error if either name is taken or the namespace is gone.
    fn add_veth_pair(&self, host: &str, peer: &str, peer_netns: Option<i32>) -> Result<()>;

    /// Enslaves `link` to the bridge `master`.
    ///
    /// # Errors
    ///
    /// Returns an error if either link is missing.
    fn set_master(&self, link: &str, master: &str) -> Result<()>;

    /// Sets a link administratively up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing.
    fn set_up(&self, link: &str) -> Result<()>;

    /// Adds an address with prefix to a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the address is taken.
    fn add_address(&self, link: &str, addr: Ipv4Net) -> Result<()>;

    /// Adds a default route through `gateway` on `link`.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway is unreachable from `link`.
    fn add_default_route(&self, gateway: Ipv4Addr, link: &str) -> Result<()>;

    /// Deletes a link. Deleting a missing link succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the link exists but cannot be removed.
    fn delete_link(&self, name: &str) -> Result<()>;
}
