//! On-disk node bookkeeping.
//!
//! Each node owns one directory below the state root holding its
//! `state.json`. The root is owner-only (`0700`).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nexus_common::constants::STATE_FILE_NAME;
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{NodeId, NodeState};

/// Directory-per-node state store.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Store rooted at `root`. Nothing is touched until
    /// [`StateStore::ensure_root`] or a write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory and restricts it to its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or chmodded.
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| NexusError::io(&self.root, e))?;
        std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| NexusError::io(&self.root, e))?;
        tracing::debug!(root = %self.root.display(), "state directory ready");
        Ok(())
    }

    fn node_dir(&self, id: &NodeId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn state_file(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join(STATE_FILE_NAME)
    }

    /// Whether bookkeeping exists for `id`.
    #[must_use]
    pub fn exists(&self, id: &NodeId) -> bool {
        self.state_file(id).is_file()
    }

    /// Writes the record of a node, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the node directory or file cannot be written.
    pub fn save(&self, state: &NodeState) -> Result<()> {
        let dir = self.node_dir(state.id());
        std::fs::create_dir_all(&dir).map_err(|e| NexusError::io(&dir, e))?;
        let json = serde_json::to_string_pretty(state)?;
        let path = dir.join(STATE_FILE_NAME);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| NexusError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| NexusError::io(&path, e))?;
        Ok(())
    }

    /// Reads the record of a node.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::NotFound`] if the node has no bookkeeping, or
    /// an error if the record cannot be read or parsed.
    pub fn load(&self, id: &NodeId) -> Result<NodeState> {
        let path = self.state_file(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NexusError::NotFound {
                    kind: "node",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(NexusError::io(path, e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Deletes the bookkeeping of a node. Missing bookkeeping is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the node directory cannot be removed.
    pub fn remove(&self, id: &NodeId) -> Result<()> {
        let dir = self.node_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NexusError::io(dir, e)),
        }
    }

    /// Records of every node, sorted by id. Unreadable records are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be listed.
    pub fn list(&self) -> Result<Vec<NodeState>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NexusError::io(&self.root, e)),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| NexusError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| NodeId::new(n).ok()) else {
                continue;
            };
            if !self.exists(&id) {
                continue;
            }
            match self.load(&id) {
                Ok(state) => nodes.push(state),
                Err(e) => tracing::warn!(node = %id, error = %e, "skipping unreadable node record"),
            }
        }
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use nexus_common::types::{NodeConfig, NodeStatus};

    use super::*;

    fn record(id: &str) -> NodeState {
        NodeState {
            config: NodeConfig {
                id: NodeId::new(id).unwrap(),
                hostname: id.into(),
                memory_mb: 128,
                cpu_shares: 512,
                rootfs: PathBuf::from("/rootfs"),
                command: vec!["/bin/true".into()],
                network_enabled: true,
            },
            pid: 4242,
            status: NodeStatus::Running,
            ip: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            start_time: Some(123),
        }
    }

    #[test]
    fn root_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nexus"));
        store.ensure_root().unwrap();
        let mode = std::fs::metadata(store.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn saved_record_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&record("web-1")).unwrap();
        assert!(store.exists(&NodeId::new("web-1").unwrap()));
        assert_eq!(store.load(&NodeId::new("web-1").unwrap()).unwrap(), record("web-1"));
        assert!(dir.path().join("web-1").join("state.json").is_file());
    }

    #[test]
    fn unknown_node_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = StateStore::new(dir.path())
            .load(&NodeId::new("ghost").unwrap())
            .unwrap_err();
        assert!(matches!(err, NexusError::NotFound { kind: "node", .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let id = NodeId::new("web-1").unwrap();
        store.save(&record("web-1")).unwrap();
        store.remove(&id).unwrap();
        store.remove(&id).unwrap();
        assert!(!store.exists(&id));
    }

    #[test]
    fn list_is_sorted_and_skips_strays() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&record("web-2")).unwrap();
        store.save(&record("db-1")).unwrap();
        std::fs::write(dir.path().join("leases.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::create_dir(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("state.json"), "nope").unwrap();

        let ids: Vec<String> = store.list().unwrap().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["db-1", "web-2"]);
    }

    #[test]
    fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateStore::new(dir.path().join("absent")).list().unwrap().is_empty());
    }
}
