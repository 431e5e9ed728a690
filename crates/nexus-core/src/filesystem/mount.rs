//! Mount utilities for node filesystem setup.
//!
//! Handles the mount propagation reset, the rootfs bind mount, and the
//! pseudo-filesystems (`/proc`, `/sys`, `/dev`, `/dev/pts`) mounted inside
//! the node's mount namespace before it pivots.
//!
//! The syscall wrappers run in the freshly cloned child, which must not
//! allocate: they take a [`MountPlan`] built on the host and report bare
//! errno values.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nexus_common::error::{NexusError, Result};

/// Hardening flag applied to a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountOption {
    /// Disallow program execution (`MS_NOEXEC`).
    NoExec,
    /// Ignore set-user-id and set-group-id bits (`MS_NOSUID`).
    NoSuid,
    /// Disallow access to device special files (`MS_NODEV`).
    NoDev,
    /// Always update access times (`MS_STRICTATIME`).
    StrictAtime,
}

/// One filesystem mounted inside a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Mount source (`proc`, `tmpfs`, ...).
    pub source: String,
    /// Absolute destination inside the node's root filesystem.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Hardening flags.
    pub options: Vec<MountOption>,
    /// Filesystem-specific data string, e.g. `mode=755`.
    pub data: Option<String>,
}

impl MountSpec {
    fn new(source: &str, target: &str, fstype: &str, options: &[MountOption]) -> Self {
        Self {
            source: source.to_string(),
            target: PathBuf::from(target),
            fstype: fstype.to_string(),
            options: options.to_vec(),
            data: None,
        }
    }

    fn with_data(mut self, data: &str) -> Self {
        self.data = Some(data.to_string());
        self
    }

    /// Destination of this mount below `rootfs`.
    #[must_use]
    pub fn target_in(&self, rootfs: &Path) -> PathBuf {
        rootfs.join(self.target.strip_prefix("/").unwrap_or(&self.target))
    }
}

/// Pseudo-filesystems every node gets, in mount order.
#[must_use]
pub fn default_mounts() -> Vec<MountSpec> {
    use MountOption::{NoDev, NoExec, NoSuid, StrictAtime};

    vec![
        MountSpec::new("proc", "/proc", "proc", &[NoExec, NoSuid, NoDev]),
        MountSpec::new("sysfs", "/sys", "sysfs", &[NoExec, NoSuid, NoDev]),
        MountSpec::new("tmpfs", "/dev", "tmpfs", &[NoSuid, StrictAtime]).with_data("mode=755"),
        MountSpec::new("devpts", "/dev/pts", "devpts", &[NoSuid, NoExec])
            .with_data("newinstance,ptmxmode=0666,mode=620"),
    ]
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| NexusError::validation(format!("path {} contains a NUL byte", path.display())))
}

fn c_str(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| NexusError::validation(format!("{value:?} contains a NUL byte")))
}

/// A [`MountSpec`] with every argument converted for `mount(2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMount {
    source: CString,
    target: CString,
    fstype: CString,
    options: Vec<MountOption>,
    data: Option<CString>,
}

impl PreparedMount {
    /// Absolute mount point on the host side of the pivot.
    #[must_use]
    pub fn target(&self) -> &CStr {
        &self.target
    }
}

/// Filesystem setup of one node, resolved against its rootfs before the
/// node process exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    rootfs: CString,
    mounts: Vec<PreparedMount>,
    ptmx: Option<CString>,
}

impl MountPlan {
    /// Resolves `mounts` below `rootfs` and creates their mount points.
    ///
    /// Mount points below another mount of the plan (`/dev/pts` under the
    /// `/dev` tmpfs) are created again by the child once the parent mount
    /// is in place.
    ///
    /// # Errors
    ///
    /// Returns an error if a path contains a NUL byte or a mount point
    /// cannot be created.
    pub fn new(rootfs: &Path, mounts: &[MountSpec]) -> Result<Self> {
        let mounts = mounts
            .iter()
            .map(|spec| {
                let target = spec.target_in(rootfs);
                std::fs::create_dir_all(&target).map_err(|e| NexusError::io(&target, e))?;
                Ok(PreparedMount {
                    source: c_str(&spec.source)?,
                    target: c_path(&target)?,
                    fstype: c_str(&spec.fstype)?,
                    options: spec.options.clone(),
                    data: spec.data.as_deref().map(c_str).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let ptmx = mounts
            .iter()
            .any(|m| m.fstype.as_bytes() == b"devpts")
            .then(|| c_path(&rootfs.join("dev/ptmx")))
            .transpose()?;
        Ok(Self {
            rootfs: c_path(rootfs)?,
            mounts,
            ptmx,
        })
    }

    /// The rootfs the node pivots into.
    #[must_use]
    pub fn rootfs(&self) -> &CStr {
        &self.rootfs
    }

    /// Mounts in the order they are applied.
    #[must_use]
    pub fn mounts(&self) -> &[PreparedMount] {
        &self.mounts
    }
}

#[cfg(target_os = "linux")]
fn ms_flags(options: &[MountOption]) -> nix::mount::MsFlags {
    use nix::mount::MsFlags;

    options.iter().fold(MsFlags::empty(), |flags, opt| {
        flags
            | match opt {
                MountOption::NoExec => MsFlags::MS_NOEXEC,
                MountOption::NoSuid => MsFlags::MS_NOSUID,
                MountOption::NoDev => MsFlags::MS_NODEV,
                MountOption::StrictAtime => MsFlags::MS_STRICTATIME,
            }
    })
}

/// Marks every mount in the current namespace as recursively private so
/// that nothing mounted for the node propagates back to the host.
///
/// # Errors
///
/// Returns the errno of the failing `mount(2)`.
#[cfg(target_os = "linux")]
pub fn make_private() -> nix::Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&CStr>,
        c"/",
        None::<&CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&CStr>,
    )
}

/// Bind-mounts the plan's rootfs onto itself, turning it into a mount
/// point that `pivot_root(2)` accepts.
///
/// # Errors
///
/// Returns the errno of the failing `mount(2)`.
#[cfg(target_os = "linux")]
pub fn bind_rootfs(plan: &MountPlan) -> nix::Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(plan.rootfs()),
        plan.rootfs(),
        None::<&CStr>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&CStr>,
    )
}

/// Applies the plan's mounts in order, then links `/dev/ptmx` to the
/// private devpts instance.
///
/// # Errors
///
/// Returns the errno of the first failing `mkdir(2)`, `mount(2)` or
/// `symlink(2)`.
#[cfg(target_os = "linux")]
pub fn mount_all(plan: &MountPlan) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::mount::mount;
    use nix::sys::stat::Mode;
    use nix::unistd::mkdir;

    for m in &plan.mounts {
        match mkdir(m.target.as_c_str(), Mode::from_bits_truncate(0o755)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(e),
        }
        mount(
            Some(m.source.as_c_str()),
            m.target.as_c_str(),
            Some(m.fstype.as_c_str()),
            ms_flags(&m.options),
            m.data.as_deref(),
        )?;
    }

    if let Some(ptmx) = &plan.ptmx {
        // SAFETY: both arguments are NUL-terminated strings that outlive
        // the call.
        let rc = unsafe { libc::symlink(c"pts/ptmx".as_ptr(), ptmx.as_ptr()) };
        match Errno::result(rc) {
            Ok(_) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_private() -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_rootfs(_plan: &MountPlan) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always fails: mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_all(_plan: &MountPlan) -> nix::Result<()> {
    Err(nix::errno::Errno::ENOSYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_pseudo_filesystems() {
        let targets: Vec<_> = default_mounts().into_iter().map(|m| m.target).collect();
        assert_eq!(
            targets,
            ["/proc", "/sys", "/dev", "/dev/pts"].map(PathBuf::from).to_vec()
        );
    }

    #[test]
    fn dev_is_mounted_before_devpts() {
        let mounts = default_mounts();
        let dev = mounts.iter().position(|m| m.fstype == "tmpfs").unwrap();
        let pts = mounts.iter().position(|m| m.fstype == "devpts").unwrap();
        assert!(dev < pts);
    }

    #[test]
    fn proc_and_sys_are_hardened() {
        for m in default_mounts().iter().take(2) {
            assert!(m.options.contains(&MountOption::NoExec));
            assert!(m.options.contains(&MountOption::NoSuid));
            assert!(m.options.contains(&MountOption::NoDev));
        }
    }

    #[test]
    fn dev_tmpfs_carries_mode() {
        let dev = default_mounts().into_iter().find(|m| m.fstype == "tmpfs").unwrap();
        assert_eq!(dev.data.as_deref(), Some("mode=755"));
        assert!(dev.options.contains(&MountOption::StrictAtime));
    }

    #[test]
    fn target_is_resolved_below_rootfs() {
        let proc = &default_mounts()[0];
        assert_eq!(
            proc.target_in(Path::new("/var/lib/nexus/images/alpine-base")),
            PathBuf::from("/var/lib/nexus/images/alpine-base/proc")
        );
    }

    #[test]
    fn plan_creates_mount_points_on_the_host() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MountPlan::new(dir.path(), &default_mounts()).unwrap();
        for sub in ["proc", "sys", "dev", "dev/pts"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        let proc_target = dir.path().join("proc");
        assert_eq!(
            plan.mounts()[0].target().to_bytes(),
            proc_target.as_os_str().as_bytes()
        );
        assert_eq!(plan.rootfs().to_bytes(), dir.path().as_os_str().as_bytes());
        assert!(plan.ptmx.is_some());
    }

    #[test]
    fn plan_without_devpts_links_no_ptmx() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MountPlan::new(dir.path(), &default_mounts()[..2]).unwrap();
        assert_eq!(plan.mounts().len(), 2);
        assert!(plan.ptmx.is_none());
    }

    #[test]
    fn nul_in_mount_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mounts = default_mounts();
        mounts[2].data = Some("mode=755\0".into());
        let err = MountPlan::new(dir.path(), &mounts).unwrap_err();
        assert!(matches!(err, NexusError::Validation { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn options_map_to_kernel_flags() {
        use nix::mount::MsFlags;

        let flags = ms_flags(&[MountOption::NoSuid, MountOption::StrictAtime]);
        assert_eq!(flags, MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME);
    }
}
