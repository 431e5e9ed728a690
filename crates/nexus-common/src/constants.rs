//! System-wide constants and default paths.

use std::net::Ipv4Addr;

/// Root directory for per-node bookkeeping. Created with mode `0700`.
pub const DEFAULT_STATE_DIR: &str = "/run/nexus";

/// Root filesystem image every node pivots into.
pub const DEFAULT_ROOTFS: &str = "/var/lib/nexus/images/alpine-base";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the parent cgroup all nodes are nested under.
pub const CGROUP_PARENT: &str = "nexus";

/// Name of the host bridge.
pub const BRIDGE_NAME: &str = "nexus0";

/// Subnet served by the bridge.
pub const DEFAULT_SUBNET: &str = "10.0.42.0/24";

/// Bridge address, handed to nodes as their default gateway.
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 42, 1);

/// Prefix for the host-side end of every veth pair.
pub const VETH_PREFIX: &str = "nex-";

/// Name of the guest-side veth inside the node.
pub const GUEST_IFNAME: &str = "eth0";

/// Kernel limit on interface names, excluding the trailing NUL.
pub const IFNAME_MAX_LEN: usize = 15;

/// Longest node id whose veth name still fits [`IFNAME_MAX_LEN`].
pub const MAX_NODE_ID_LEN: usize = IFNAME_MAX_LEN - VETH_PREFIX.len();

/// Bookkeeping file written for each node.
pub const STATE_FILE_NAME: &str = "state.json";

/// Address lease table kept in the state directory.
pub const LEASES_FILE_NAME: &str = "leases.json";

/// `PATH` exported to node processes.
pub const NODE_PATH_ENV: &str = "PATH=/bin:/usr/bin:/sbin:/usr/sbin";

/// Default memory ceiling for `node create`, in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 128;

/// Default CPU weight for `node create`.
pub const DEFAULT_CPU_SHARES: u64 = 512;

/// Upper bound of the CPU share scale accepted by the CLI.
pub const MAX_CPU_SHARES: u64 = 1024;

/// Seconds between SIGTERM and SIGKILL when stopping a node.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

/// Application name used in CLI output.
pub const APP_NAME: &str = "nexus";

/// Returns the demonstration workload every node runs.
#[must_use]
pub fn default_workload() -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), "sleep 3600".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_id_fits_interface_name() {
        let name = format!("{VETH_PREFIX}{}", "x".repeat(MAX_NODE_ID_LEN));
        assert_eq!(name.len(), IFNAME_MAX_LEN);
    }

    #[test]
    fn gateway_is_inside_default_subnet() {
        let subnet: ipnet::Ipv4Net = DEFAULT_SUBNET.parse().unwrap();
        assert!(subnet.contains(&DEFAULT_GATEWAY));
    }
}
