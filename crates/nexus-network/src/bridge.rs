//! Bridge-backed [`NetworkProvisioner`].
//!
//! Each node gets a veth pair: the host end (`<prefix><id>`) is enslaved
//! to the bridge, the guest end is created inside the node's network
//! namespace and configured there with the node's address and a default
//! route through the bridge.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use nexus_common::config::{NetworkConfig, NexusConfig};
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{IpAddress, NodeId};
use nexus_core::namespace::network::{NetnsSwitch, ThreadNetns};
use nexus_core::net::{IpRoute2, LinkOps};

use crate::ipam::{FileLeaseStore, IpAllocator};
use crate::provisioner::NetworkProvisioner;

const LOOPBACK: &str = "lo";

/// Provisioner that attaches nodes to one Linux bridge.
#[derive(Debug)]
pub struct BridgeNetwork<L, S> {
    config: NetworkConfig,
    links: L,
    netns: S,
    allocator: IpAllocator,
}

impl BridgeNetwork<IpRoute2, ThreadNetns> {
    /// Provisioner for the host: iproute2 for links, `setns(2)` for
    /// namespace switching, leases persisted in the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` is not installed or the network settings
    /// are inconsistent.
    pub fn system(config: &NexusConfig) -> Result<Self> {
        let allocator = IpAllocator::new(
            config.network.subnet,
            config.network.gateway,
            Box::new(FileLeaseStore::new(config.leases_file())),
        )?;
        Ok(Self::new(config.network.clone(), IpRoute2::locate()?, ThreadNetns, allocator))
    }
}

impl<L: LinkOps, S: NetnsSwitch> BridgeNetwork<L, S> {
    /// Assembles a provisioner from its parts.
    #[must_use]
    pub const fn new(config: NetworkConfig, links: L, netns: S, allocator: IpAllocator) -> Self {
        Self {
            config,
            links,
            netns,
            allocator,
        }
    }

    /// The address pool.
    #[must_use]
    pub const fn allocator(&self) -> &IpAllocator {
        &self.allocator
    }

    /// Name of the host-side veth of `node_id`.
    #[must_use]
    pub fn host_link_name(&self, node_id: &NodeId) -> String {
        format!("{}{}", self.config.veth_prefix, node_id)
    }

    fn bridge_address(&self) -> Result<Ipv4Net> {
        Ipv4Net::new(self.config.gateway, self.config.subnet.prefix_len()).map_err(|e| {
            NexusError::Config {
                message: format!("invalid bridge address: {e}"),
            }
        })
    }

    fn create_bridge(&self) -> Result<()> {
        let bridge = self.config.bridge.as_str();
        if let Err(e) = self.links.add_bridge(bridge) {
            // lost a race against a concurrent setup
            if self.links.link_exists(bridge)? {
                tracing::debug!(bridge, "bridge appeared concurrently");
                return Ok(());
            }
            return Err(e);
        }
        self.links.add_address(bridge, self.bridge_address()?)?;
        self.links.set_up(bridge)?;
        Ok(())
    }

    /// Enslaves the freshly created host end to the bridge and raises it.
    fn attach_host_end(&self, host: &str) -> Result<()> {
        self.links.set_master(host, &self.config.bridge)?;
        self.links.set_up(host)?;
        Ok(())
    }

    /// Guest-side half, executed inside the node's network namespace.
    fn configure_guest(&self, node_id: &NodeId, ip: &IpAddress) -> Result<()> {
        let guest = self.config.guest_ifname.as_str();
        self.links.set_up(LOOPBACK)?;
        if !self.links.link_exists(guest)? {
            return Err(NexusError::NotFound {
                kind: "guest interface",
                id: format!("{guest} in node {node_id}"),
            });
        }
        self.links.set_up(guest)?;
        self.links.add_address(guest, ip.with_prefix()?)?;
        self.links.add_default_route(ip.gateway, guest)?;
        Ok(())
    }

    /// Runs the guest configuration on a thread that may be thrown away:
    /// if restoring the host namespace fails, that thread stays in the
    /// node's namespace.
    fn configure_in_netns(&self, node_id: &NodeId, pid: i32, ip: &IpAddress) -> Result<()> {
        let worker = std::thread::Builder::new().name(format!("netns-{node_id}"));
        std::thread::scope(|s| {
            let handle = worker
                .spawn_scoped(s, || {
                    let guard = self.netns.enter(pid)?;
                    let configured = self.configure_guest(node_id, ip);
                    drop(guard);
                    configured
                })
                .map_err(|e| NexusError::kernel("spawn netns worker", node_id.to_string(), e))?;
            handle.join().map_err(|_| {
                NexusError::kernel(
                    "wire node network",
                    node_id.to_string(),
                    std::io::Error::other("netns worker panicked"),
                )
            })?
        })
    }

    /// Removes the host end created by this wiring attempt and reports the
    /// failure together with any cleanup error.
    fn undo_host_end(&self, node_id: &NodeId, host: &str, source: NexusError) -> NexusError {
        let cleanup = self.links.delete_link(host).err();
        if let Some(e) = &cleanup {
            tracing::warn!(link = host, error = %e, "failed to remove partial wiring");
        }
        NexusError::WiringFailed {
            id: node_id.to_string(),
            source: Box::new(source),
            cleanup: cleanup.map(Box::new),
        }
    }
}

impl<L: LinkOps, S: NetnsSwitch> NetworkProvisioner for BridgeNetwork<L, S> {
    fn setup_bridge(&self) -> Result<()> {
        let bridge = self.config.bridge.as_str();
        if self.links.link_exists(bridge)? {
            tracing::debug!(bridge, "bridge already present");
            return Ok(());
        }
        self.create_bridge()?;
        tracing::info!(bridge, address = %self.config.gateway, "bridge created");
        Ok(())
    }

    fn assign_ip(&self, node_id: &NodeId) -> Result<IpAddress> {
        self.allocator.assign_ip(node_id)
    }

    fn setup_container_network(&self, node_id: &NodeId, pid: i32, ip: &IpAddress) -> Result<()> {
        tracing::info!(node = %node_id, pid, ip = %ip, "wiring node network");
        let host = self.host_link_name(node_id);
        // a link that already exists belongs to someone else and is left alone
        self.links
            .add_veth_pair(&host, &self.config.guest_ifname, Some(pid))
            .map_err(|e| NexusError::WiringFailed {
                id: node_id.to_string(),
                source: Box::new(e),
                cleanup: None,
            })?;

        self.attach_host_end(&host)
            .and_then(|()| self.configure_in_netns(node_id, pid, ip))
            .map_err(|e| self.undo_host_end(node_id, &host, e))?;
        tracing::info!(node = %node_id, ip = %ip.ip, "node network ready");
        Ok(())
    }

    fn teardown_container_network(&self, node_id: &NodeId) -> Result<()> {
        let host = self.host_link_name(node_id);
        self.links.delete_link(&host)?;
        tracing::info!(node = %node_id, link = %host, "node network removed");
        Ok(())
    }

    fn release_ip(&self, ip: &IpAddress) -> Result<()> {
        self.allocator.release_ip(ip.ip)
    }

    fn release_node(&self, node_id: &NodeId) -> Result<()> {
        let released: Vec<Ipv4Addr> = self.allocator.release_node(node_id)?;
        tracing::debug!(node = %node_id, count = released.len(), "leases returned");
        Ok(())
    }
}
