//! Linux runtime built on namespaces, cgroup v2 and `pivot_root`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use nexus_common::config::NexusConfig;
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{IpAddress, NodeConfig, NodeId, NodeState, NodeStatus};
use nexus_core::cgroup::CgroupManager;

use super::IsolationRuntime;
use crate::isolation::IsolationSpec;
use crate::process;
use crate::state::StateStore;

/// Program run by the startup probe.
const PROBE_BINARY: &str = "/bin/true";

/// How long a stopped node's cgroup may take to report empty.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime that isolates nodes with Linux namespaces and cgroup v2.
///
/// Bookkeeping lives in one directory per node below the state directory;
/// cgroups live under `<cgroup_root>/<cgroup_parent>/<id>`.
#[derive(Debug)]
pub struct LinuxRuntime {
    store: StateStore,
    cgroup_root: PathBuf,
    cgroup_parent: String,
    grace: Duration,
}

impl LinuxRuntime {
    /// Prepares the state directory and the parent cgroup, then checks
    /// that the hierarchy accepts processes.
    ///
    /// A failing probe is only logged: the node that later hits the same
    /// problem reports it with its own context.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory or the parent cgroup cannot
    /// be set up.
    pub fn new(config: &NexusConfig) -> Result<Self> {
        let runtime = Self {
            store: StateStore::new(&config.state_dir),
            cgroup_root: config.cgroup_root.clone(),
            cgroup_parent: config.cgroup_parent.clone(),
            grace: Duration::from_secs(config.stop_grace_secs),
        };
        runtime.store.ensure_root()?;
        let _ = CgroupManager::ensure_parent(&runtime.cgroup_root, &runtime.cgroup_parent)?;

        match runtime.probe() {
            Ok(()) => tracing::debug!("cgroup probe succeeded"),
            Err(e) => tracing::warn!(error = %e, "cgroup probe failed, node creation may fail"),
        }
        tracing::info!(
            state_dir = %runtime.store.root().display(),
            cgroup_root = %runtime.cgroup_root.display(),
            "linux runtime ready"
        );
        Ok(runtime)
    }

    fn cgroup(&self, id: &str) -> CgroupManager {
        CgroupManager::open(&self.cgroup_root, &self.cgroup_parent, id)
    }

    /// Runs a throwaway process inside a scratch child of the parent
    /// cgroup and removes the scratch cgroup again.
    fn probe(&self) -> Result<()> {
        let name = format!(".probe-{}", std::process::id());
        let scratch = match CgroupManager::create(&self.cgroup_root, &self.cgroup_parent, &name) {
            Ok(group) => group,
            // left behind by a crashed probe of a recycled pid
            Err(NexusError::AlreadyExists { .. }) => self.cgroup(&name),
            Err(e) => return Err(e),
        };
        let outcome = run_probe(&scratch);
        let removed = scratch.destroy();
        outcome.and(removed)
    }

    /// Creates the node cgroup, replacing a leftover from a node that
    /// stopped without cleaning up.
    fn fresh_cgroup(&self, id: &NodeId) -> Result<CgroupManager> {
        match CgroupManager::create(&self.cgroup_root, &self.cgroup_parent, id.as_str()) {
            Err(NexusError::AlreadyExists { .. }) => {
                tracing::warn!(node = %id, "removing stale cgroup");
                self.cgroup(id.as_str()).destroy()?;
                CgroupManager::create(&self.cgroup_root, &self.cgroup_parent, id.as_str())
            }
            other => other,
        }
    }

    fn live_status(&self, state: &NodeState) -> NodeStatus {
        if state.status == NodeStatus::Stopped || !process::is_alive(state.pid, state.start_time) {
            NodeStatus::Stopped
        } else if !self.cgroup(state.id().as_str()).exists() {
            NodeStatus::Error
        } else {
            NodeStatus::Running
        }
    }

    fn persist(&self, state: &NodeState) -> Result<NodeState> {
        self.store.save(state)?;
        self.store.load(state.id())
    }

    /// Tears down a partially started node and wraps `source` with any
    /// cleanup failure.
    fn start_failed(
        &self,
        id: &NodeId,
        child: Option<(i32, Option<u64>)>,
        cgroup: &CgroupManager,
        source: NexusError,
    ) -> NexusError {
        tracing::warn!(node = %id, error = %source, "start failed, cleaning up");
        let killed = child.map_or(Ok(()), |(pid, start_time)| {
            process::terminate(pid, start_time, Duration::ZERO)
        });
        let cleanup = [killed, cgroup.destroy(), self.store.remove(id)]
            .into_iter()
            .find_map(Result::err);
        if let Some(e) = &cleanup {
            tracing::error!(node = %id, error = %e, "cleanup after failed start was incomplete");
        }
        NexusError::StartFailed {
            id: id.to_string(),
            source: Box::new(source),
            cleanup: cleanup.map(Box::new),
        }
    }

    /// Waits for the kernel to report an emptied cgroup.
    fn drain(cgroup: &CgroupManager) -> Result<()> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while cgroup.is_populated()? && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}

impl IsolationRuntime for LinuxRuntime {
    fn create_and_start(&self, config: &NodeConfig) -> Result<NodeState> {
        let id = &config.id;
        if self.store.exists(id) {
            let existing = self.store.load(id)?;
            if self.live_status(&existing) != NodeStatus::Stopped {
                return Err(NexusError::AlreadyExists {
                    kind: "node",
                    id: id.to_string(),
                });
            }
            tracing::debug!(node = %id, "replacing record of stopped node");
            self.store.remove(id)?;
        }

        let spec = IsolationSpec::from_config(config)?;
        let cgroup = self.fresh_cgroup(id)?;
        let pid = cgroup
            .apply_limits(&spec.limits)
            .and_then(|()| process::spawn_init(&spec, &cgroup))
            .map_err(|e| self.start_failed(id, None, &cgroup, e))?;
        let start_time = process::read_stat(pid).map(|stat| stat.start_time);

        let state = NodeState {
            config: config.clone(),
            pid,
            status: NodeStatus::Running,
            ip: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            start_time,
        };
        let state = self
            .persist(&state)
            .map_err(|e| self.start_failed(id, Some((pid, start_time)), &cgroup, e))?;
        tracing::info!(
            node = %id,
            pid,
            memory_mb = config.memory_mb,
            cpu_shares = config.cpu_shares,
            "node started"
        );
        Ok(state)
    }

    fn stop(&self, id: &NodeId) -> Result<()> {
        let mut state = self.store.load(id)?;
        if state.status == NodeStatus::Stopped {
            tracing::debug!(node = %id, "node already stopped");
            return Ok(());
        }

        process::terminate(state.pid, state.start_time, self.grace)?;
        let cgroup = self.cgroup(id.as_str());
        Self::drain(&cgroup)?;
        cgroup.destroy()?;

        state.status = NodeStatus::Stopped;
        // the lease is returned by the caller
        state.ip = None;
        self.store.save(&state)?;
        tracing::info!(node = %id, pid = state.pid, "node stopped");
        Ok(())
    }

    fn get_state(&self, id: &NodeId) -> Result<NodeState> {
        let mut state = self.store.load(id)?;
        state.status = self.live_status(&state);
        Ok(state)
    }

    fn list(&self) -> Result<Vec<NodeState>> {
        let mut nodes = self.store.list()?;
        for node in &mut nodes {
            node.status = self.live_status(node);
        }
        Ok(nodes)
    }

    fn record_address(&self, id: &NodeId, address: &IpAddress) -> Result<()> {
        let mut state = self.store.load(id)?;
        state.ip = Some(*address);
        self.store.save(&state)
    }
}

/// Runs [`PROBE_BINARY`] with its pid written into `scratch` before exec.
#[cfg(target_os = "linux")]
fn run_probe(scratch: &CgroupManager) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let procs = scratch.path().join("cgroup.procs");
    let procs = CString::new(procs.as_os_str().as_bytes())
        .map_err(|_| NexusError::validation("cgroup path contains a NUL byte"))?;

    let mut command = Command::new(PROBE_BINARY);
    let _ = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: the hook runs between fork and exec and only issues
    // open/write/close on a path allocated before the fork.
    unsafe {
        let _ = command.pre_exec(move || join_self(&procs));
    }
    let status = command
        .status()
        .map_err(|e| NexusError::kernel("run cgroup probe", PROBE_BINARY, e))?;
    if status.success() {
        Ok(())
    } else {
        Err(NexusError::kernel(
            "run cgroup probe",
            PROBE_BINARY,
            std::io::Error::other(format!("probe exited with {status}")),
        ))
    }
}

/// Moves the calling process into the cgroup owning `procs`.
#[cfg(target_os = "linux")]
fn join_self(procs: &std::ffi::CStr) -> std::io::Result<()> {
    // SAFETY: `procs` is NUL-terminated and the buffer outlives the call.
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `fd` was just opened and the one-byte buffer is static.
    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let error = std::io::Error::last_os_error();
    // SAFETY: `fd` is owned here and closed exactly once.
    let _ = unsafe { libc::close(fd) };
    if written == 1 { Ok(()) } else { Err(error) }
}

#[cfg(not(target_os = "linux"))]
fn run_probe(_scratch: &CgroupManager) -> Result<()> {
    Err(NexusError::Config {
        message: "Linux required for native node operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: NexusConfig,
        runtime: LinuxRuntime,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = NexusConfig {
            state_dir: dir.path().join("state"),
            cgroup_root: dir.path().join("cgroup"),
            stop_grace_secs: 1,
            ..NexusConfig::default()
        };
        std::fs::create_dir(&config.cgroup_root).unwrap();
        let runtime = LinuxRuntime::new(&config).unwrap();
        Fixture {
            _dir: dir,
            config,
            runtime,
        }
    }

    fn node_config(id: &str) -> NodeConfig {
        NodeConfig {
            id: NodeId::new(id).unwrap(),
            hostname: id.into(),
            memory_mb: 128,
            cpu_shares: 512,
            rootfs: PathBuf::from("/nonexistent"),
            command: nexus_common::constants::default_workload(),
            network_enabled: true,
        }
    }

    fn record(fx: &Fixture, id: &str, pid: i32, start_time: Option<u64>) -> NodeState {
        let state = NodeState {
            config: node_config(id),
            pid,
            status: NodeStatus::Running,
            ip: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            start_time,
        };
        fx.runtime.store.save(&state).unwrap();
        state
    }

    fn own_process() -> (i32, Option<u64>) {
        let pid = i32::try_from(std::process::id()).unwrap();
        (pid, process::read_stat(pid).map(|s| s.start_time))
    }

    fn exited_process() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = child.wait().unwrap();
        pid
    }

    fn node_cgroup(fx: &Fixture, id: &str) -> PathBuf {
        fx.config.cgroup_root.join(&fx.config.cgroup_parent).join(id)
    }

    #[test]
    fn construction_prepares_state_and_parent() {
        let fx = fixture();
        assert!(fx.config.state_dir.is_dir());
        assert!(fx.config.cgroup_root.join("nexus").is_dir());
        let leftovers: Vec<_> = std::fs::read_dir(fx.config.cgroup_root.join("nexus"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "probe cgroup was not removed");
    }

    #[test]
    fn live_node_with_cgroup_is_running() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start);
        std::fs::create_dir(node_cgroup(&fx, "web-1")).unwrap();
        let state = fx.runtime.get_state(&NodeId::new("web-1").unwrap()).unwrap();
        assert_eq!(state.status, NodeStatus::Running);
    }

    #[test]
    fn live_node_without_cgroup_is_in_error() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start);
        let state = fx.runtime.get_state(&NodeId::new("web-1").unwrap()).unwrap();
        assert_eq!(state.status, NodeStatus::Error);
    }

    #[test]
    fn reused_pid_reads_as_stopped() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start.map(|t| t + 1));
        std::fs::create_dir(node_cgroup(&fx, "web-1")).unwrap();
        let state = fx.runtime.get_state(&NodeId::new("web-1").unwrap()).unwrap();
        assert_eq!(state.status, NodeStatus::Stopped);
    }

    #[test]
    fn unknown_node_is_not_found() {
        let fx = fixture();
        let err = fx.runtime.get_state(&NodeId::new("ghost").unwrap()).unwrap_err();
        assert!(matches!(err, NexusError::NotFound { kind: "node", .. }));
        let err = fx.runtime.stop(&NodeId::new("ghost").unwrap()).unwrap_err();
        assert!(matches!(err, NexusError::NotFound { .. }));
    }

    #[test]
    fn live_node_cannot_be_created_twice() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start);
        std::fs::create_dir(node_cgroup(&fx, "web-1")).unwrap();
        let err = fx.runtime.create_and_start(&node_config("web-1")).unwrap_err();
        assert!(matches!(err, NexusError::AlreadyExists { kind: "node", .. }));
        assert!(fx.runtime.store.exists(&NodeId::new("web-1").unwrap()));
    }

    #[test]
    fn stopping_an_exited_node_removes_its_cgroup() {
        let fx = fixture();
        let mut state = record(&fx, "web-1", exited_process(), None);
        state.ip = Some(IpAddress {
            ip: "10.0.42.2".parse().unwrap(),
            subnet: "10.0.42.0/24".parse().unwrap(),
            gateway: "10.0.42.1".parse().unwrap(),
        });
        fx.runtime.store.save(&state).unwrap();
        std::fs::create_dir(node_cgroup(&fx, "web-1")).unwrap();

        let id = NodeId::new("web-1").unwrap();
        fx.runtime.stop(&id).unwrap();
        assert!(!node_cgroup(&fx, "web-1").exists());
        let stopped = fx.runtime.get_state(&id).unwrap();
        assert_eq!(stopped.status, NodeStatus::Stopped);
        assert_eq!(stopped.ip, None);

        fx.runtime.stop(&id).unwrap();
    }

    #[test]
    fn address_is_recorded() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start);
        let address = IpAddress {
            ip: "10.0.42.2".parse().unwrap(),
            subnet: "10.0.42.0/24".parse().unwrap(),
            gateway: "10.0.42.1".parse().unwrap(),
        };
        let id = NodeId::new("web-1").unwrap();
        fx.runtime.record_address(&id, &address).unwrap();
        assert_eq!(fx.runtime.get_state(&id).unwrap().ip, Some(address));
    }

    #[test]
    fn list_reports_live_status() {
        let fx = fixture();
        let (pid, start) = own_process();
        let _ = record(&fx, "web-1", pid, start);
        std::fs::create_dir(node_cgroup(&fx, "web-1")).unwrap();
        let _ = record(&fx, "db-1", exited_process(), None);

        let nodes = fx.runtime.list().unwrap();
        let summary: Vec<(&str, NodeStatus)> =
            nodes.iter().map(|n| (n.id().as_str(), n.status)).collect();
        assert_eq!(
            summary,
            [("db-1", NodeStatus::Stopped), ("web-1", NodeStatus::Running)]
        );
        assert!(Path::new(&fx.config.state_dir).join("web-1").is_dir());
    }
}
