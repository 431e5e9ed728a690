//! Lease persistence for the address allocator.
//!
//! The allocator reloads the table at the start of every operation and
//! saves it before releasing its lock, so a file-backed store lets
//! successive CLI invocations see each other's allocations. The file store
//! holds an exclusive `flock(2)` on a sibling `.lock` file for the whole
//! cycle, which also serializes separate processes.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use nexus_common::error::{NexusError, Result};
use nexus_common::types::NodeId;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

/// Holder of an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lease {
    /// The bridge address, never handed out.
    Gateway,
    /// Address assigned to a node.
    Node(NodeId),
}

/// Address → lease map.
pub type LeaseTable = BTreeMap<Ipv4Addr, Lease>;

/// Exclusive access to a store, released on drop.
#[derive(Debug, Default)]
pub struct StoreLock {
    _file: Option<Flock<File>>,
}

/// Backing storage for a [`LeaseTable`].
pub trait LeaseStore: Send {
    /// Excludes every other holder of the same store until the returned
    /// lock is dropped. Stores private to one allocator need nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken.
    fn acquire(&self) -> Result<StoreLock> {
        Ok(StoreLock::default())
    }

    /// Returns the current table. A store that was never saved is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored table cannot be read or parsed.
    fn load(&self) -> Result<LeaseTable>;

    /// Replaces the stored table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be written.
    fn save(&mut self, table: &LeaseTable) -> Result<()>;
}

/// Lease table kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    table: LeaseTable,
}

impl MemoryLeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn load(&self) -> Result<LeaseTable> {
        Ok(self.table.clone())
    }

    fn save(&mut self, table: &LeaseTable) -> Result<()> {
        self.table.clone_from(table);
        Ok(())
    }
}

/// Lease table stored as a JSON file.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    path: PathBuf,
}

impl FileLeaseStore {
    /// Uses the lease file at `path`; the file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the lease file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<path><suffix>`, next to the lease file.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Lock file guarding the lease file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|e| NexusError::io(parent, e))
            }
            _ => Ok(()),
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn acquire(&self) -> Result<StoreLock> {
        self.ensure_parent()?;
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| NexusError::io(&path, e))?;
        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| NexusError::io(&path, errno.into()))?;
        Ok(StoreLock { _file: Some(file) })
    }

    fn load(&self) -> Result<LeaseTable> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseTable::new()),
            Err(e) => return Err(NexusError::io(&self.path, e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&mut self, table: &LeaseTable) -> Result<()> {
        self.ensure_parent()?;
        let json = serde_json::to_string_pretty(table)?;
        // write-then-rename so readers never see a torn table
        let tmp = self.sibling(&format!(".{}.tmp", std::process::id()));
        std::fs::write(&tmp, json).map_err(|e| NexusError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| NexusError::io(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), leases = table.len(), "lease table saved");
        Ok(())
    }
}
