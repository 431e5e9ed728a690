//! UTS namespace isolation.
//!
//! Allows a node to have its own hostname.

/// Sets the hostname inside the calling process's UTS namespace.
///
/// Runs in the freshly cloned node process: it neither logs nor
/// allocates.
///
/// # Errors
///
/// Returns the errno of the failing `sethostname(2)`.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> nix::Result<()> {
    nix::unistd::sethostname(hostname)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}
