//! Network namespace switching.
//!
//! Network namespace membership is a property of the calling *thread*, not
//! of the process. [`NetnsGuard`] moves the current thread into a node's
//! namespace and moves it back when dropped, so every exit path of the
//! caller, including `?` returns and panics, restores the host namespace.

use std::fs::File;
use std::path::PathBuf;

use nexus_common::error::{NexusError, Result};

/// Enters the network namespace of a process for the lifetime of a guard.
///
/// Implementations must restore the previous namespace when the guard is
/// dropped.
pub trait NetnsSwitch: Send + Sync {
    /// Scope guard returned by [`NetnsSwitch::enter`].
    type Guard;

    /// Moves the calling thread into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current or the target namespace cannot be
    /// opened, or if the switch itself fails. On error the thread is left in
    /// its original namespace.
    fn enter(&self, pid: i32) -> Result<Self::Guard>;
}

/// [`NetnsSwitch`] backed by `setns(2)` on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadNetns;

impl NetnsSwitch for ThreadNetns {
    type Guard = NetnsGuard;

    fn enter(&self, pid: i32) -> Result<NetnsGuard> {
        NetnsGuard::enter(pid)
    }
}

/// Keeps the calling thread inside a node's network namespace.
///
/// Created by [`NetnsGuard::enter`]; the host namespace is restored on
/// drop. Use [`NetnsGuard::restore`] to observe a restoration failure.
#[derive(Debug)]
pub struct NetnsGuard {
    host: File,
    pid: i32,
    restored: bool,
}

/// Namespace handle of the calling thread. `/proc/self` would name the
/// thread-group leader instead.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

fn netns_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

impl NetnsGuard {
    /// Records the current namespace and switches into the one of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if either namespace handle cannot be opened or the
    /// `setns(2)` call fails.
    #[cfg(target_os = "linux")]
    pub fn enter(pid: i32) -> Result<Self> {
        use nix::sched::{CloneFlags, setns};

        let host = File::open(THREAD_NETNS).map_err(|e| NexusError::io(THREAD_NETNS, e))?;
        let target_path = netns_path(pid);
        let target =
            File::open(&target_path).map_err(|e| NexusError::kernel("resolve netns", pid.to_string(), e))?;
        setns(&target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| NexusError::kernel("enter netns", pid.to_string(), e))?;
        tracing::debug!(pid, path = %target_path.display(), "entered node network namespace");
        Ok(Self {
            host,
            pid,
            restored: false,
        })
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: network namespaces require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn enter(_pid: i32) -> Result<Self> {
        Err(NexusError::Config {
            message: "Linux required for native node operations".into(),
        })
    }

    /// Pid whose namespace the thread is currently in.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Switches back to the recorded host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if `setns(2)` fails. The thread is then still inside
    /// the node's namespace and must not be reused for host work.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.switch_back()
    }

    #[cfg(target_os = "linux")]
    fn switch_back(&self) -> Result<()> {
        use nix::sched::{CloneFlags, setns};

        setns(&self.host, CloneFlags::CLONE_NEWNET)
            .map_err(|e| NexusError::kernel("restore host netns", self.pid.to_string(), e))?;
        tracing::debug!(pid = self.pid, "returned to host network namespace");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn switch_back(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.switch_back() {
            tracing::error!(pid = self.pid, error = %e, "thread is stranded in node network namespace");
        }
    }
}
