//! Per-node exclusion between concurrent lifecycle operations.
//!
//! A claim is an exclusive `flock(2)` on `<state_dir>/.claims/<id>.lock`.
//! Locks belong to the open file description, so two threads of one
//! process exclude each other as well as two CLI invocations do. The lock
//! file itself is left in place; only the lock matters.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nexus_common::error::{NexusError, Result};
use nexus_common::types::NodeId;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

const CLAIMS_DIR: &str = ".claims";

/// Exclusive right to change one node, released on drop.
#[derive(Debug)]
pub struct NodeClaim {
    id: NodeId,
    _lock: Flock<File>,
}

impl NodeClaim {
    /// Claims `id` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Busy`] if another operation holds the claim,
    /// or an I/O error if the lock file cannot be opened.
    pub fn try_acquire(state_dir: &Path, id: &NodeId) -> Result<Self> {
        let path = lock_path(state_dir, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| NexusError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| NexusError::io(&path, e))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::trace!(node = %id, "node claimed");
                Ok(Self {
                    id: id.clone(),
                    _lock: lock,
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(NexusError::Busy { id: id.to_string() }),
            Err((_, errno)) => Err(NexusError::io(path, errno.into())),
        }
    }

    /// The claimed node.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }
}

fn lock_path(state_dir: &Path, id: &NodeId) -> PathBuf {
    state_dir.join(CLAIMS_DIR).join(format!("{id}.lock"))
}
