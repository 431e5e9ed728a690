//! Domain primitive types used across the Nexus workspace.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_NODE_ID_LEN;
use crate::error::{NexusError, Result};

/// Unique, caller-supplied identifier for a node. Doubles as its hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Validates and wraps a node identifier.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Validation`] if the identifier is empty, longer
    /// than [`MAX_NODE_ID_LEN`], starts with a dot, or contains characters
    /// outside `[A-Za-z0-9_.-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(NexusError::validation("the node must have a name"));
        }
        if id.len() > MAX_NODE_ID_LEN {
            return Err(NexusError::validation(format!(
                "node name {id:?} is longer than {MAX_NODE_ID_LEN} characters"
            )));
        }
        if id.starts_with('.') {
            return Err(NexusError::validation(format!(
                "node name {id:?} must not start with a dot"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(NexusError::validation(format!(
                "node name {id:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NexusError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Immutable request describing the node to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, also used as the hostname.
    pub id: NodeId,
    /// Hostname set inside the UTS namespace.
    pub hostname: String,
    /// Memory ceiling in megabytes. Zero means unlimited.
    pub memory_mb: u64,
    /// Relative CPU weight on the 0-1024 share scale. Zero means kernel default.
    pub cpu_shares: u64,
    /// Root filesystem the node pivots into.
    pub rootfs: PathBuf,
    /// Command line executed as the node's init process.
    pub command: Vec<String>,
    /// Whether the node gets a veth attached to the host bridge.
    pub network_enabled: bool,
}

impl NodeConfig {
    /// Memory ceiling converted to bytes, or `None` when unlimited.
    #[must_use]
    pub const fn memory_bytes(&self) -> Option<u64> {
        match self.memory_mb {
            0 => None,
            mb => Some(mb.saturating_mul(1024 * 1024)),
        }
    }
}

/// Resource limits written into a node's cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory ceiling in bytes (`memory.max`).
    pub memory_bytes: Option<u64>,
    /// CPU weight on the cgroup v2 scale of 1-10000 (`cpu.weight`).
    pub cpu_weight: Option<u64>,
}

/// An address issued by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpAddress {
    /// The host address handed to the node.
    pub ip: Ipv4Addr,
    /// Subnet the address belongs to.
    pub subnet: Ipv4Net,
    /// Bridge address used as the node's default gateway.
    pub gateway: Ipv4Addr,
}

impl IpAddress {
    /// The address with the subnet prefix, e.g. `10.0.42.2/24`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subnet prefix length is invalid.
    pub fn with_prefix(&self) -> Result<Ipv4Net> {
        Ipv4Net::new(self.ip, self.subnet.prefix_len()).map_err(|e| NexusError::Config {
            message: format!("invalid prefix for {}: {e}", self.ip),
        })
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} via {}", self.ip, self.subnet.prefix_len(), self.gateway)
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// The init process is alive.
    Running,
    /// The init process has exited or was stopped.
    Stopped,
    /// The node is in an inconsistent state.
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Runtime record of a created node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// The request the node was created from.
    pub config: NodeConfig,
    /// Host pid of the node's init process.
    pub pid: i32,
    /// Current status.
    pub status: NodeStatus,
    /// Assigned address, absent when network wiring failed.
    pub ip: Option<IpAddress>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Init process start time in clock ticks, used to detect pid reuse.
    #[serde(default)]
    pub start_time: Option<u64>,
}

impl NodeState {
    /// Shorthand for the node identifier.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.config.id
    }
}
