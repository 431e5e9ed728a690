//! Global configuration model for the Nexus host agent.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{NexusError, Result};

/// Root configuration for the Nexus host agent.
///
/// Every field has a default, so a config file only needs to list what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Directory holding per-node bookkeeping and the lease table.
    pub state_dir: PathBuf,
    /// Root filesystem image for new nodes.
    pub rootfs: PathBuf,
    /// Command every node runs as its init process.
    pub workload: Vec<String>,
    /// Cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Parent cgroup name, relative to `cgroup_root`.
    pub cgroup_parent: String,
    /// Seconds between SIGTERM and SIGKILL on stop.
    pub stop_grace_secs: u64,
    /// Network settings.
    pub network: NetworkConfig,
}

/// Bridge and addressing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host bridge name.
    pub bridge: String,
    /// Subnet served by the bridge.
    pub subnet: Ipv4Net,
    /// Bridge address and default gateway for nodes.
    pub gateway: Ipv4Addr,
    /// Prefix for host-side veth names.
    pub veth_prefix: String,
    /// Interface name of the guest end inside the node.
    pub guest_ifname: String,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(constants::DEFAULT_STATE_DIR),
            rootfs: PathBuf::from(constants::DEFAULT_ROOTFS),
            workload: constants::default_workload(),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::CGROUP_PARENT.to_string(),
            stop_grace_secs: constants::DEFAULT_STOP_GRACE_SECS,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: constants::BRIDGE_NAME.to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 42, 0), 24)
                .unwrap_or_else(|_| Ipv4Net::default()),
            gateway: constants::DEFAULT_GATEWAY,
            veth_prefix: constants::VETH_PREFIX.to_string(),
            guest_ifname: constants::GUEST_IFNAME.to_string(),
        }
    }
}

impl NexusConfig {
    /// Loads a JSON config file, or returns the defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// describes an inconsistent network.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| NexusError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Config`] if the gateway lies outside the subnet,
    /// the subnet has no room for nodes, or the workload is empty.
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        if !net.subnet.contains(&net.gateway)
            || net.gateway == net.subnet.network()
            || net.gateway == net.subnet.broadcast()
        {
            return Err(NexusError::Config {
                message: format!("gateway {} is not a host of {}", net.gateway, net.subnet),
            });
        }
        if net.subnet.prefix_len() > 29 {
            return Err(NexusError::Config {
                message: format!("subnet {} is too small for nodes", net.subnet),
            });
        }
        if self.workload.is_empty() {
            return Err(NexusError::Config {
                message: "workload command must not be empty".into(),
            });
        }
        if net.veth_prefix.len() + constants::MAX_NODE_ID_LEN > constants::IFNAME_MAX_LEN {
            return Err(NexusError::Config {
                message: format!("veth prefix {:?} is too long", net.veth_prefix),
            });
        }
        Ok(())
    }

    /// Path of the lease table inside the state directory.
    #[must_use]
    pub fn leases_file(&self) -> PathBuf {
        self.state_dir.join(constants::LEASES_FILE_NAME)
    }
}
