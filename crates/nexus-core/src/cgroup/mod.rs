//! Cgroups v2 resource management.
//!
//! Nodes live in sub-cgroups of one shared parent scope
//! (`<root>/<parent>/<node-id>`). The parent is provisioned once and left in
//! place; node cgroups are created before the init process is released and
//! removed after it has been reaped.

pub mod cpu;
pub mod memory;

use std::path::{Path, PathBuf};

use nexus_common::error::{NexusError, Result};
use nexus_common::types::ResourceLimits;

/// Controllers delegated from the parent scope to node cgroups.
pub const NODE_CONTROLLERS: [&str; 2] = ["cpu", "memory"];

/// Handle to a cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupManager {
    /// Path to this cgroup's directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Ensures the shared parent scope exists and delegates
    /// [`NODE_CONTROLLERS`] to its children.
    ///
    /// Controllers missing from the hierarchy are skipped with a warning;
    /// limits that need them will fail when a node is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a
    /// `cgroup.subtree_control` write is rejected.
    pub fn ensure_parent(root: &Path, parent: &str) -> Result<Self> {
        let root_group = Self {
            path: root.to_path_buf(),
        };
        root_group.enable_controllers(&NODE_CONTROLLERS)?;

        let path = root.join(parent);
        std::fs::create_dir_all(&path).map_err(|e| NexusError::io(&path, e))?;
        let group = Self { path };
        group.enable_controllers(&NODE_CONTROLLERS)?;
        tracing::info!(path = %group.path.display(), "parent cgroup ready");
        Ok(group)
    }

    /// Creates the cgroup of a node under `<root>/<parent>/<node_id>`.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::AlreadyExists`] if the directory is already
    /// present, or an I/O error if it cannot be created.
    pub fn create(root: &Path, parent: &str, node_id: &str) -> Result<Self> {
        let group = Self::open(root, parent, node_id);
        match std::fs::create_dir(&group.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(NexusError::AlreadyExists {
                    kind: "cgroup",
                    id: group.path.display().to_string(),
                });
            }
            Err(e) => return Err(NexusError::io(&group.path, e)),
        }
        tracing::info!(path = %group.path.display(), "cgroup created");
        Ok(group)
    }

    /// Returns a handle to a node cgroup without touching the filesystem.
    #[must_use]
    pub fn open(root: &Path, parent: &str, node_id: &str) -> Self {
        Self {
            path: root.join(parent).join(node_id),
        }
    }

    /// Path to this cgroup's directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Applies resource limits to this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a control file fails.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if let Some(bytes) = limits.memory_bytes {
            memory::set_memory_max(&self.path, bytes)?;
        }
        if let Some(weight) = limits.cpu_weight {
            cpu::set_cpu_weight(&self.path, weight)?;
        }
        Ok(())
    }

    /// Moves a process into this cgroup by writing its pid.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: i32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string())
            .map_err(|e| NexusError::kernel("join cgroup", procs_path.display().to_string(), e))?;
        tracing::debug!(pid, path = %self.path.display(), "added process to cgroup");
        Ok(())
    }

    /// Delegates the listed controllers to child cgroups.
    ///
    /// Only controllers advertised in `cgroup.controllers` are requested. A
    /// directory without that file is not a cgroup mount and is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.subtree_control` rejects the write.
    pub fn enable_controllers(&self, wanted: &[&str]) -> Result<()> {
        let available_path = self.path.join("cgroup.controllers");
        let Ok(available) = std::fs::read_to_string(&available_path) else {
            tracing::warn!(path = %self.path.display(), "no cgroup.controllers, skipping delegation");
            return Ok(());
        };
        let available: Vec<&str> = available.split_whitespace().collect();

        let control = self.path.join("cgroup.subtree_control");
        for controller in wanted {
            if !available.contains(controller) {
                tracing::warn!(controller, path = %self.path.display(), "controller unavailable");
                continue;
            }
            std::fs::write(&control, format!("+{controller}")).map_err(|e| {
                NexusError::kernel("enable cgroup controller", control.display().to_string(), e)
            })?;
        }
        Ok(())
    }

    /// Whether any process is still attached to this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` exists but cannot be read.
    pub fn is_populated(&self) -> Result<bool> {
        let procs_path = self.path.join("cgroup.procs");
        match std::fs::read_to_string(&procs_path) {
            Ok(procs) => Ok(procs.lines().any(|l| !l.trim().is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(NexusError::io(procs_path, e)),
        }
    }

    /// Removes the cgroup. A cgroup that is already gone is not an error.
    ///
    /// The kernel only allows removing a cgroup with no live processes, and
    /// its control files vanish with the directory, so this is a single
    /// `rmdir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "cgroup destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NexusError::kernel(
                "remove cgroup",
                self.path.display().to_string(),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_cgroup_is_nested_under_parent() {
        let group = CgroupManager::open(Path::new("/sys/fs/cgroup"), "nexus", "web-1");
        assert_eq!(group.path(), Path::new("/sys/fs/cgroup/nexus/web-1"));
    }

    #[test]
    fn parent_is_created_and_controllers_delegated() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpuset cpu io memory pids").unwrap();
        let parent = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        assert!(parent.exists());
        let control = std::fs::read_to_string(root.path().join("cgroup.subtree_control")).unwrap();
        // each write replaces the plain file, so the last controller wins
        assert_eq!(control, "+memory");
    }

    #[test]
    fn parent_setup_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let first = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let second = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_node_cgroup_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let _ = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let _ = CgroupManager::create(root.path(), "nexus", "web-1").unwrap();
        let err = CgroupManager::create(root.path(), "nexus", "web-1").unwrap_err();
        assert!(matches!(err, NexusError::AlreadyExists { kind: "cgroup", .. }));
    }

    #[test]
    fn limits_are_written_to_control_files() {
        let root = tempfile::tempdir().unwrap();
        let _ = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let group = CgroupManager::create(root.path(), "nexus", "web-1").unwrap();
        group
            .apply_limits(&ResourceLimits {
                memory_bytes: Some(134_217_728),
                cpu_weight: Some(20),
            })
            .unwrap();
        let mem = std::fs::read_to_string(group.path().join("memory.max")).unwrap();
        let cpu = std::fs::read_to_string(group.path().join("cpu.weight")).unwrap();
        assert_eq!(mem, "134217728");
        assert_eq!(cpu, "20");
    }

    #[test]
    fn unset_limits_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        let _ = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let group = CgroupManager::create(root.path(), "nexus", "idle").unwrap();
        group.apply_limits(&ResourceLimits::default()).unwrap();
        assert!(!group.path().join("memory.max").exists());
        assert!(!group.path().join("cpu.weight").exists());
    }

    #[test]
    fn populated_reflects_procs_file() {
        let root = tempfile::tempdir().unwrap();
        let _ = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let group = CgroupManager::create(root.path(), "nexus", "web-1").unwrap();
        assert!(!group.is_populated().unwrap());
        group.add_process(4242).unwrap();
        assert!(group.is_populated().unwrap());
    }

    #[test]
    fn destroying_twice_is_harmless() {
        let root = tempfile::tempdir().unwrap();
        let _ = CgroupManager::ensure_parent(root.path(), "nexus").unwrap();
        let group = CgroupManager::create(root.path(), "nexus", "gone").unwrap();
        group.destroy().unwrap();
        group.destroy().unwrap();
        assert!(!group.exists());
    }
}
