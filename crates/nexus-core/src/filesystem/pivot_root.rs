//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::ffi::CStr;

/// Switches the root filesystem to `new_root` and detaches the old one.
///
/// Uses the `pivot_root(".", ".")` idiom: after changing into `new_root`
/// the old root is stacked on top of it and lazily unmounted, so no
/// `put_old` directory is needed inside the image. `new_root` must already
/// be a mount point.
///
/// Runs in the freshly cloned child: it neither logs nor allocates.
///
/// # Errors
///
/// Returns the errno of the failing `chdir(2)`, `pivot_root(2)` or
/// `umount2(2)`.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &CStr) -> nix::Result<()> {
    use nix::mount::{MntFlags, umount2};
    use nix::unistd::chdir;

    chdir(new_root)?;
    nix::unistd::pivot_root(c".", c".")?;
    umount2(c".", MntFlags::MNT_DETACH)?;
    chdir(c"/")
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &CStr) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}
