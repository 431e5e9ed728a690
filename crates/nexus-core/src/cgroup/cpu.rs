//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`. Callers express CPU weight on the historical
//! 2-262144 share scale; cgroup v2 expects a weight between 1 and 10000.

use std::path::Path;

use nexus_common::error::{NexusError, Result};

const MIN_SHARES: u64 = 2;
const MAX_SHARES: u64 = 262_144;
const MAX_WEIGHT: u64 = 10_000;

/// Converts a CPU share value to a cgroup v2 `cpu.weight`.
///
/// Zero means "use the kernel default" and maps to `None`. The mapping is
/// the linear one used by OCI runtimes, so 2 shares give weight 1 and
/// 262144 shares give weight 10000.
#[must_use]
pub fn shares_to_weight(shares: u64) -> Option<u64> {
    if shares == 0 {
        return None;
    }
    let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
    Some(1 + ((shares - MIN_SHARES) * (MAX_WEIGHT - 1)) / (MAX_SHARES - MIN_SHARES))
}

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    let file = cgroup_path.join("cpu.weight");
    std::fs::write(&file, weight.to_string()).map_err(|e| NexusError::io(file, e))?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}
