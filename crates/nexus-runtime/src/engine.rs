//! Node orchestration on top of the isolation runtime and the network
//! provisioner.

use nexus_common::config::NexusConfig;
use nexus_common::constants::MAX_CPU_SHARES;
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{NodeConfig, NodeId, NodeState, NodeStatus};
use nexus_network::{BridgeNetwork, NetworkProvisioner};

use crate::backend::{IsolationRuntime, LinuxRuntime};
use crate::claim::NodeClaim;

/// Entry point for node lifecycle operations.
///
/// Construction only succeeds once the runtime and the host bridge are
/// usable; a `NodeService` that exists can accept requests.
pub struct NodeService {
    config: NexusConfig,
    runtime: Box<dyn IsolationRuntime>,
    network: Box<dyn NetworkProvisioner>,
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NodeService {
    /// Builds the service for this host: Linux runtime and bridge network.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Initialization`] naming the component that
    /// could not be set up.
    pub fn new(config: NexusConfig) -> Result<Self> {
        let runtime = LinuxRuntime::new(&config).map_err(|e| initialization("runtime", e))?;
        let network = BridgeNetwork::system(&config).map_err(|e| initialization("network", e))?;
        Self::with_backends(config, Box::new(runtime), Box::new(network))
    }

    /// Builds the service from explicit backends and sets up the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Initialization`] if the bridge cannot be set
    /// up.
    pub fn with_backends(
        config: NexusConfig,
        runtime: Box<dyn IsolationRuntime>,
        network: Box<dyn NetworkProvisioner>,
    ) -> Result<Self> {
        network
            .setup_bridge()
            .map_err(|e| initialization("bridge", e))?;
        tracing::info!(bridge = %config.network.bridge, subnet = %config.network.subnet, "node service ready");
        Ok(Self {
            config,
            runtime,
            network,
        })
    }

    /// The configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &NexusConfig {
        &self.config
    }

    /// Checks a creation request without touching any resource.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Validation`] for an empty, overlong or
    /// malformed name, or CPU shares above [`MAX_CPU_SHARES`].
    pub fn validate_request(name: &str, cpu_shares: u64) -> Result<NodeId> {
        let id = NodeId::new(name)?;
        if cpu_shares > MAX_CPU_SHARES {
            return Err(NexusError::validation(format!(
                "cpu shares {cpu_shares} exceed {MAX_CPU_SHARES}"
            )));
        }
        Ok(id)
    }

    fn claim(&self, id: &NodeId) -> Result<NodeClaim> {
        NodeClaim::try_acquire(&self.config.state_dir, id)
    }

    /// Creates and starts a node named `name`.
    ///
    /// The node is returned as `Running` even if its network could not be
    /// wired; it then carries no address. Whatever a previous, stopped
    /// node of the same name still holds is released first.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Validation`] for a bad name or CPU value
    /// before anything is allocated, [`NexusError::Busy`] while another
    /// operation holds the node, [`NexusError::AlreadyExists`] for a
    /// live node of that name, [`NexusError::AddressExhausted`] when the
    /// pool is empty, or the runtime's start failure.
    pub fn create_node(&self, name: &str, memory_mb: u64, cpu_shares: u64) -> Result<NodeState> {
        let id = Self::validate_request(name, cpu_shares)?;
        let _claim = self.claim(&id)?;
        match self.runtime.get_state(&id) {
            Ok(existing) if existing.status != NodeStatus::Stopped => {
                return Err(NexusError::AlreadyExists {
                    kind: "node",
                    id: id.to_string(),
                });
            }
            Ok(_) => self.reclaim_stopped(&id)?,
            Err(NexusError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let ip = self.network.assign_ip(&id)?;
        let config = NodeConfig {
            hostname: id.to_string(),
            id: id.clone(),
            memory_mb,
            cpu_shares,
            rootfs: self.config.rootfs.clone(),
            command: self.config.workload.clone(),
            network_enabled: true,
        };

        let mut state = match self.runtime.create_and_start(&config) {
            Ok(state) => state,
            Err(e) => {
                if let Err(release) = self.network.release_ip(&ip) {
                    tracing::warn!(node = %id, ip = %ip.ip, error = %release, "failed to release address");
                }
                return Err(e);
            }
        };

        match self.network.setup_container_network(&id, state.pid, &ip) {
            Ok(()) => {
                if let Err(e) = self.runtime.record_address(&id, &ip) {
                    tracing::warn!(node = %id, error = %e, "failed to record node address");
                }
                state.ip = Some(ip);
            }
            Err(e) => {
                tracing::warn!(node = %id, pid = state.pid, error = %e, "network wiring failed, node runs without network");
                if let Err(release) = self.network.release_ip(&ip) {
                    tracing::warn!(node = %id, ip = %ip.ip, error = %release, "failed to release address");
                }
            }
        }
        tracing::info!(node = %id, pid = state.pid, ip = ?state.ip.map(|a| a.ip), "node created");
        Ok(state)
    }

    /// Drops the link and leases left by a node whose process exited on its
    /// own.
    fn reclaim_stopped(&self, id: &NodeId) -> Result<()> {
        tracing::debug!(node = %id, "reclaiming resources of stopped node");
        if let Err(e) = self.network.teardown_container_network(id) {
            tracing::warn!(node = %id, error = %e, "failed to remove stale node link");
        }
        self.network.release_node(id)
    }

    /// Stops a node and frees its network resources.
    ///
    /// The host link goes first, then the process and its cgroup, then the
    /// address lease.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::NotFound`] for unknown nodes,
    /// [`NexusError::Busy`] while another operation holds the node, or the
    /// first failure of the runtime or the lease table.
    pub fn stop_node(&self, name: &str) -> Result<NodeState> {
        let id = NodeId::new(name)?;
        let _claim = self.claim(&id)?;
        let _ = self.runtime.get_state(&id)?;
        if let Err(e) = self.network.teardown_container_network(&id) {
            tracing::warn!(node = %id, error = %e, "failed to remove node link");
        }
        self.runtime.stop(&id)?;
        self.network.release_node(&id)?;
        self.runtime.get_state(&id)
    }

    /// Current state of a node.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::NotFound`] for unknown nodes.
    pub fn inspect_node(&self, name: &str) -> Result<NodeState> {
        self.runtime.get_state(&NodeId::new(name)?)
    }

    /// Every known node, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the bookkeeping cannot be listed.
    pub fn list_nodes(&self) -> Result<Vec<NodeState>> {
        self.runtime.list()
    }
}

fn initialization(component: &'static str, source: NexusError) -> NexusError {
    tracing::error!(component, error = %source, "initialization failed");
    NexusError::Initialization {
        component,
        source: Box::new(source),
    }
}
