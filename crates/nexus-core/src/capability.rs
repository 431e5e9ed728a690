//! Linux capability management for least-privilege execution.
//!
//! Nodes run as root inside their namespaces, so the capability bounding
//! set is what keeps them from regaining dangerous privileges. Every
//! capability not in the node's allowlist is dropped from the bounding set
//! right before `execve`.

use std::fmt;

/// Linux capability identifiers, numbered as in `linux/capability.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Capability {
    /// Allow arbitrary changes to file ownership.
    Chown = 0,
    /// Bypass file read, write and execute permission checks.
    DacOverride = 1,
    /// Bypass permission checks on operations requiring file ownership.
    Fowner = 3,
    /// Keep set-user-id bits when a file is modified.
    Fsetid = 4,
    /// Allow sending signals to arbitrary processes.
    Kill = 5,
    /// Allow setting group IDs.
    Setgid = 6,
    /// Allow setting user IDs.
    Setuid = 7,
    /// Allow transferring capabilities.
    Setpcap = 8,
    /// Allow binding to privileged ports (< 1024).
    NetBindService = 10,
    /// Allow raw and packet sockets.
    NetRaw = 13,
    /// Allow `chroot(2)`.
    SysChroot = 18,
    /// Allow creating special files with `mknod(2)`.
    Mknod = 27,
}

impl Capability {
    /// Kernel number of the capability.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Canonical `CAP_*` name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Chown => "CAP_CHOWN",
            Self::DacOverride => "CAP_DAC_OVERRIDE",
            Self::Fowner => "CAP_FOWNER",
            Self::Fsetid => "CAP_FSETID",
            Self::Kill => "CAP_KILL",
            Self::Setgid => "CAP_SETGID",
            Self::Setuid => "CAP_SETUID",
            Self::Setpcap => "CAP_SETPCAP",
            Self::NetBindService => "CAP_NET_BIND_SERVICE",
            Self::NetRaw => "CAP_NET_RAW",
            Self::SysChroot => "CAP_SYS_CHROOT",
            Self::Mknod => "CAP_MKNOD",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capabilities a node keeps: enough for ordinary userspace, nothing that
/// reaches the host (no `SYS_ADMIN`, `NET_ADMIN`, `SYS_MODULE`, ...).
pub const NODE_CAPABILITIES: [Capability; 12] = [
    Capability::Chown,
    Capability::DacOverride,
    Capability::Fsetid,
    Capability::Fowner,
    Capability::Mknod,
    Capability::NetRaw,
    Capability::Setgid,
    Capability::Setuid,
    Capability::Setpcap,
    Capability::NetBindService,
    Capability::SysChroot,
    Capability::Kill,
];

const CAP_LAST_CAP: &str = "/proc/sys/kernel/cap_last_cap";

/// Fallback when procfs is unavailable; `CAP_CHECKPOINT_RESTORE` as of 5.9.
const FALLBACK_LAST_CAP: u8 = 40;

/// Highest capability number known to the running kernel.
///
/// Read on the host before spawning: the child cannot rely on procfs once
/// it has pivoted.
#[must_use]
pub fn last_cap() -> u8 {
    std::fs::read_to_string(CAP_LAST_CAP)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(FALLBACK_LAST_CAP)
}

/// Capability numbers in `0..=last` that are not in `keep`.
#[must_use]
pub fn capabilities_to_drop(keep: &[Capability], last: u8) -> Vec<u8> {
    (0..=last)
        .filter(|cap| !keep.iter().any(|k| k.number() == *cap))
        .collect()
}

/// Removes `drop` from the calling thread's capability bounding set.
///
/// Runs in the freshly cloned child: it neither logs nor allocates.
///
/// # Errors
///
/// Returns the errno of the first failing `prctl(PR_CAPBSET_DROP)`.
#[cfg(target_os = "linux")]
pub fn drop_bounding_set(drop: &[u8]) -> nix::Result<()> {
    let unused: libc::c_ulong = 0;
    for &cap in drop {
        // SAFETY: PR_CAPBSET_DROP takes a capability number and ignores the
        // remaining arguments; no memory is passed to the kernel.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), unused, unused, unused) };
        let _ = nix::errno::Errno::result(rc)?;
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: capabilities require Linux.
#[cfg(not(target_os = "linux"))]
pub fn drop_bounding_set(_drop: &[u8]) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}
