//! # nexus-core
//!
//! Low-level Linux isolation primitives for the Nexus runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: clone flags for PID, mount, UTS, IPC and network
//!   isolation, plus a scoped guard for entering a node's network namespace.
//! - **Cgroups v2**: parent scope provisioning and per-node memory/CPU limits.
//! - **Filesystem**: pseudo-filesystem mounts and `pivot_root`.
//! - **Capabilities**: restricting the capability bounding set.
//! - **Links**: bridge, veth, address and route manipulation.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod net;
