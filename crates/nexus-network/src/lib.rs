//! # nexus-network
//!
//! Host networking for Nexus nodes.
//!
//! - **IPAM**: a lock-protected address pool over one subnet, persisted
//!   through an injected lease store.
//! - **Provisioner**: the host bridge and the per-node veth wiring that
//!   crosses into the node's network namespace.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod bridge;
pub mod ipam;
pub mod provisioner;

pub use bridge::BridgeNetwork;
pub use ipam::IpAllocator;
pub use provisioner::NetworkProvisioner;
