//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max`.

use std::path::Path;

use nexus_common::error::{NexusError, Result};

/// Sets the hard memory limit for a cgroup, in bytes.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    let file = cgroup_path.join("memory.max");
    std::fs::write(&file, bytes.to_string()).map_err(|e| NexusError::io(file, e))?;
    tracing::debug!(bytes, "memory max set");
    Ok(())
}
