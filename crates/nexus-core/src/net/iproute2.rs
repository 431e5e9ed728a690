//! [`LinkOps`] backed by iproute2's `ip` binary.
//!
//! A spawned process inherits the network namespace of the thread that
//! spawned it, so commands issued while a [`NetnsGuard`] is held act inside
//! the node.
//!
//! [`NetnsGuard`]: crate::namespace::network::NetnsGuard

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ipnet::Ipv4Net;
use nexus_common::error::{NexusError, Result};

use super::LinkOps;

/// Drives link operations through `ip(8)`.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl IpRoute2 {
    /// Locates `ip` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::NotFound`] if iproute2 is not installed.
    pub fn locate() -> Result<Self> {
        let binary = which::which("ip").map_err(|_| NexusError::NotFound {
            kind: "iproute2 binary",
            id: "ip (install iproute2 to manage node networking)".into(),
        })?;
        tracing::debug!(binary = %binary.display(), "using iproute2");
        Ok(Self { binary })
    }

    /// Uses an explicit `ip` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Path of the binary in use.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn output(&self, operation: &'static str, target: &str, args: &[String]) -> Result<Output> {
        tracing::debug!(operation, target, args = ?args, "ip");
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| NexusError::kernel(operation, target, e))
    }

    fn run(&self, operation: &'static str, target: &str, args: &[String]) -> Result<()> {
        let output = self.output(operation, target, args)?;
        if output.status.success() {
            return Ok(());
        }
        Err(command_error(operation, target, &output))
    }
}

fn command_error(operation: &'static str, target: &str, output: &Output) -> NexusError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    NexusError::kernel(operation, target, std::io::Error::other(stderr.trim().to_string()))
}

/// Whether `ip` reported that the named device does not exist.
fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn veth_args(host: &str, peer: &str, peer_netns: Option<i32>) -> Vec<String> {
    let mut v = args(["link", "add", "name", host, "type", "veth", "peer", "name", peer]);
    if let Some(pid) = peer_netns {
        v.push("netns".into());
        v.push(pid.to_string());
    }
    v
}

fn address_args(link: &str, addr: Ipv4Net) -> Vec<String> {
    args(["addr", "add", &addr.to_string(), "dev", link])
}

fn route_args(gateway: Ipv4Addr, link: &str) -> Vec<String> {
    args(["route", "add", "default", "via", &gateway.to_string(), "dev", link])
}

impl LinkOps for IpRoute2 {
    fn link_exists(&self, name: &str) -> Result<bool> {
        let output = self.output("look up link", name, &args(["link", "show", "dev", name]))?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing_device(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(false);
        }
        Err(command_error("look up link", name, &output))
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        self.run("create bridge", name, &args(["link", "add", "name", name, "type", "bridge"]))
    }

    fn add_veth_pair(&self, host: &str, peer: &str, peer_netns: Option<i32>) -> Result<()> {
        self.run("create veth pair", host, &veth_args(host, peer, peer_netns))
    }

    fn set_master(&self, link: &str, master: &str) -> Result<()> {
        self.run("attach to bridge", link, &args(["link", "set", "dev", link, "master", master]))
    }

    fn set_up(&self, link: &str) -> Result<()> {
        self.run("bring link up", link, &args(["link", "set", "dev", link, "up"]))
    }

    fn add_address(&self, link: &str, addr: Ipv4Net) -> Result<()> {
        self.run("assign address", link, &address_args(link, addr))
    }

    fn add_default_route(&self, gateway: Ipv4Addr, link: &str) -> Result<()> {
        self.run("add default route", link, &route_args(gateway, link))
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let output = self.output("delete link", name, &args(["link", "del", "dev", name]))?;
        if output.status.success() || is_missing_device(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(());
        }
        Err(command_error("delete link", name, &output))
    }
}
