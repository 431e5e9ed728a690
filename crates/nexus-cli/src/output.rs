//! Formatted output helpers for node commands.

use std::fmt::Write as _;

use nexus_common::types::NodeState;
use nexus_core::cgroup::cpu::shares_to_weight;

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn memory(state: &NodeState) -> String {
    state
        .config
        .memory_bytes()
        .map_or_else(|| "unlimited".to_string(), format_bytes)
}

fn cpu(state: &NodeState) -> String {
    shares_to_weight(state.config.cpu_shares).map_or_else(
        || "default".to_string(),
        |weight| format!("{} shares (weight {weight})", state.config.cpu_shares),
    )
}

/// Multi-line description of one node.
#[must_use]
pub fn describe(state: &NodeState) -> String {
    let address = state
        .ip
        .map_or_else(|| "none".to_string(), |ip| ip.to_string());
    let mut out = String::new();
    let _ = writeln!(out, "Node:     {}", state.id());
    let _ = writeln!(out, "Status:   {}", state.status);
    let _ = writeln!(out, "PID:      {}", state.pid);
    let _ = writeln!(out, "Memory:   {}", memory(state));
    let _ = writeln!(out, "CPU:      {}", cpu(state));
    let _ = writeln!(out, "Address:  {address}");
    let _ = writeln!(out, "Rootfs:   {}", state.config.rootfs.display());
    let _ = write!(out, "Created:  {}", state.created_at);
    out
}

/// Table of nodes, one per line, with a header.
#[must_use]
pub fn table(nodes: &[NodeState]) -> String {
    let mut out = format!(
        "{:<12} {:<8} {:<8} {:<16} {:<10} {:<6}",
        "NAME", "STATUS", "PID", "ADDRESS", "MEMORY", "CPU"
    );
    for node in nodes {
        let address = node.ip.map_or_else(|| "-".to_string(), |ip| ip.ip.to_string());
        let memory = node
            .config
            .memory_bytes()
            .map_or_else(|| "-".to_string(), format_bytes);
        let _ = write!(
            out,
            "\n{:<12} {:<8} {:<8} {:<16} {:<10} {:<6}",
            node.id().to_string(),
            node.status.to_string(),
            node.pid,
            address,
            memory,
            node.config.cpu_shares
        );
    }
    out
}
