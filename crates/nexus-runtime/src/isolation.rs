//! Translation of a node request into a concrete isolation setup.
//!
//! [`IsolationSpec`] is computed on the host before anything is spawned,
//! so the child only has to apply it.

use std::path::PathBuf;

use nexus_common::constants::NODE_PATH_ENV;
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{NodeConfig, NodeId, ResourceLimits};
use nexus_core::capability::{Capability, NODE_CAPABILITIES};
use nexus_core::cgroup::cpu::shares_to_weight;
use nexus_core::filesystem::mount::{MountSpec, default_mounts};
use nexus_core::namespace::NamespaceConfig;

/// Everything needed to start a node's init process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationSpec {
    /// Node the process belongs to.
    pub id: NodeId,
    /// Hostname set in the UTS namespace.
    pub hostname: String,
    /// Namespaces created for the process.
    pub namespaces: NamespaceConfig,
    /// Limits written into the node's cgroup.
    pub limits: ResourceLimits,
    /// Capabilities kept in the bounding set.
    pub capabilities: Vec<Capability>,
    /// Pseudo-filesystems mounted below the rootfs.
    pub mounts: Vec<MountSpec>,
    /// Root filesystem the process pivots into.
    pub rootfs: PathBuf,
    /// Command line; `args[0]` is resolved through `PATH`.
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
}

impl IsolationSpec {
    /// Derives the isolation setup of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Validation`] if the command line is empty or
    /// the hostname is unusable.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(NexusError::validation(format!(
                "node {} has no command to run",
                config.id
            )));
        }
        if config.hostname.is_empty() || config.hostname.len() > 64 {
            return Err(NexusError::validation(format!(
                "hostname {:?} must be 1-64 characters",
                config.hostname
            )));
        }

        Ok(Self {
            id: config.id.clone(),
            hostname: config.hostname.clone(),
            namespaces: NamespaceConfig::default(),
            limits: ResourceLimits {
                memory_bytes: config.memory_bytes(),
                cpu_weight: shares_to_weight(config.cpu_shares),
            },
            capabilities: NODE_CAPABILITIES.to_vec(),
            mounts: default_mounts(),
            rootfs: config.rootfs.clone(),
            args: config.command.clone(),
            env: vec![NODE_PATH_ENV.to_string()],
        })
    }
}
