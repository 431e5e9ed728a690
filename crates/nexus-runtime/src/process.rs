//! Process spawning inside isolated namespaces.
//!
//! The init process is created with `clone(2)` and blocks on a sync pipe
//! until the parent has moved it into its cgroup. It then sets up its
//! hostname and filesystem, pivots into the rootfs, restricts its
//! capability bounding set and executes the workload. A close-on-exec
//! status pipe tells the parent whether that sequence reached `execve`.
//!
//! Nothing between `clone` and `execve` logs or allocates: the child is a
//! copy of a multi-threaded process and must not touch locks other threads
//! may hold, the allocator's included. Paths, argv and envp are converted
//! on the host, and the child reports a failure as a stage and an errno.

use std::fs::File;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use nexus_common::error::{NexusError, Result};

/// Stack handed to the cloned child.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Interval between liveness checks while stopping.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the kernel to tear down a SIGKILLed process.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Setup step the child was executing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Release = 1,
    Hostname,
    MountPrivate,
    BindRootfs,
    Mounts,
    PivotRoot,
    Capabilities,
    Exec,
}

impl Stage {
    const ALL: [Self; 8] = [
        Self::Release,
        Self::Hostname,
        Self::MountPrivate,
        Self::BindRootfs,
        Self::Mounts,
        Self::PivotRoot,
        Self::Capabilities,
        Self::Exec,
    ];

    fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u8 == byte)
    }

    const fn operation(self) -> &'static str {
        match self {
            Self::Release => "await cgroup placement",
            Self::Hostname => "sethostname",
            Self::MountPrivate => "make mounts private",
            Self::BindRootfs => "bind rootfs",
            Self::Mounts => "mount pseudo filesystems",
            Self::PivotRoot => "pivot_root",
            Self::Capabilities => "drop capabilities",
            Self::Exec => "exec workload",
        }
    }
}

/// Failure reported by the child over the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildFailure {
    stage: Stage,
    errno: i32,
}

const REPORT_LEN: usize = 5;

impl ChildFailure {
    fn encode(self) -> [u8; REPORT_LEN] {
        let errno = self.errno.to_le_bytes();
        [self.stage as u8, errno[0], errno[1], errno[2], errno[3]]
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let [stage, a, b, c, d] = <[u8; REPORT_LEN]>::try_from(bytes).ok()?;
        Some(Self {
            stage: Stage::from_byte(stage)?,
            errno: i32::from_le_bytes([a, b, c, d]),
        })
    }

    fn into_error(self, target: &str) -> NexusError {
        NexusError::kernel(
            self.stage.operation(),
            target,
            std::io::Error::from_raw_os_error(self.errno),
        )
    }
}

/// Fields of `/proc/<pid>/stat` used for liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Start time in clock ticks after boot.
    pub start_time: u64,
}

impl ProcStat {
    /// Whether the process has exited and only awaits reaping.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parses the content of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[must_use]
pub fn parse_stat(raw: &str) -> Option<ProcStat> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // starttime is field 22; state was field 3
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

/// Reads the stat record of `pid`, or `None` if there is no such process.
#[must_use]
pub fn read_stat(pid: i32) -> Option<ProcStat> {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .as_deref()
        .and_then(parse_stat)
}

/// Whether `pid` is a live process that started at `start_time` (when
/// known).
#[must_use]
pub fn is_alive(pid: i32, start_time: Option<u64>) -> bool {
    read_stat(pid).is_some_and(|stat| {
        !stat.is_dead() && start_time.is_none_or(|t| t == stat.start_time)
    })
}

#[cfg(target_os = "linux")]
mod linux {
    use std::convert::Infallible;
    use std::ffi::{CString, c_char};

    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use nix::sched::clone;
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::{Pid, pipe2};
    use nexus_core::capability::{capabilities_to_drop, drop_bounding_set, last_cap};
    use nexus_core::cgroup::CgroupManager;
    use nexus_core::filesystem::mount::{MountPlan, bind_rootfs, make_private, mount_all};
    use nexus_core::filesystem::pivot_root::pivot_root;
    use nexus_core::namespace::uts::set_hostname;

    use super::*;
    use crate::isolation::IsolationSpec;

    /// Everything the child needs, converted before `clone` so the child
    /// does not have to.
    pub(super) struct ChildPrep<'a> {
        hostname: &'a str,
        plan: MountPlan,
        args: Vec<CString>,
        /// Owns the strings `envp` points into.
        _env: Vec<CString>,
        /// NULL-terminated pointers into `args`.
        argv: Vec<*const c_char>,
        /// NULL-terminated pointers into `_env`.
        envp: Vec<*const c_char>,
        drop_caps: Vec<u8>,
    }

    fn cstring(value: &str) -> Result<CString> {
        CString::new(value)
            .map_err(|_| NexusError::validation(format!("{value:?} contains a NUL byte")))
    }

    fn pointers(strings: &[CString]) -> Vec<*const c_char> {
        strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }

    impl<'a> ChildPrep<'a> {
        pub(super) fn new(spec: &'a IsolationSpec) -> Result<Self> {
            let args = spec
                .args
                .iter()
                .map(|a| cstring(a))
                .collect::<Result<Vec<_>>>()?;
            if args.is_empty() {
                return Err(NexusError::validation("empty command line"));
            }
            let env = spec
                .env
                .iter()
                .map(|e| cstring(e))
                .collect::<Result<Vec<_>>>()?;
            // the heap buffers of `args` and `env` do not move with the vecs
            let (argv, envp) = (pointers(&args), pointers(&env));
            Ok(Self {
                hostname: &spec.hostname,
                plan: MountPlan::new(&spec.rootfs, &spec.mounts)?,
                args,
                _env: env,
                argv,
                envp,
                drop_caps: capabilities_to_drop(&spec.capabilities, last_cap()),
            })
        }

        #[cfg(test)]
        pub(super) fn argv_len(&self) -> usize {
            self.argv.len() - 1
        }

        #[cfg(test)]
        pub(super) fn argv_terminated(&self) -> bool {
            self.argv.last().is_some_and(|p| p.is_null())
                && self.envp.last().is_some_and(|p| p.is_null())
                && self.argv[..self.args.len()]
                    .iter()
                    .zip(&self.args)
                    .all(|(p, arg)| *p == arg.as_ptr())
        }

        fn exec(&self) -> Errno {
            // SAFETY: `argv` and `envp` are NULL-terminated arrays of
            // pointers into `args` and `_env`, which outlive the call.
            let _ = unsafe { libc::execvpe(self.args[0].as_ptr(), self.argv.as_ptr(), self.envp.as_ptr()) };
            Errno::last()
        }
    }

    fn setup(prep: &ChildPrep<'_>, sync: &File) -> std::result::Result<Infallible, ChildFailure> {
        let mut byte = [0_u8; 1];
        match (&*sync).read(&mut byte) {
            Ok(1) => {}
            // parent gave up before releasing us
            Ok(_) => {
                return Err(ChildFailure {
                    stage: Stage::Release,
                    errno: libc::ECANCELED,
                });
            }
            Err(e) => {
                return Err(ChildFailure {
                    stage: Stage::Release,
                    errno: e.raw_os_error().unwrap_or(libc::EIO),
                });
            }
        }

        let at = |stage| move |errno: Errno| ChildFailure {
            stage,
            errno: errno as i32,
        };
        set_hostname(prep.hostname).map_err(at(Stage::Hostname))?;
        make_private().map_err(at(Stage::MountPrivate))?;
        bind_rootfs(&prep.plan).map_err(at(Stage::BindRootfs))?;
        mount_all(&prep.plan).map_err(at(Stage::Mounts))?;
        pivot_root(prep.plan.rootfs()).map_err(at(Stage::PivotRoot))?;
        drop_bounding_set(&prep.drop_caps).map_err(at(Stage::Capabilities))?;
        Err(at(Stage::Exec)(prep.exec()))
    }

    fn child_main(prep: &ChildPrep<'_>, sync: &File, status: &File) -> isize {
        let failure = match setup(prep, sync) {
            Err(failure) => failure,
            Ok(never) => match never {},
        };
        // the parent turns a short or missing report into an error of its own
        let _ = (&*status).write_all(&failure.encode());
        1
    }

    /// Kills a child that never made it to `execve` and reaps it.
    fn abort(pid: Pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }

    /// Starts the init process of a node inside `cgroup` and returns its
    /// host pid once the workload has been executed.
    ///
    /// On failure the child has already been killed and reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the command line cannot be converted, `clone(2)`
    /// fails, the child cannot join the cgroup, or any setup step in the
    /// child fails; child failures are attributed to the step.
    pub fn spawn_init(spec: &IsolationSpec, cgroup: &CgroupManager) -> Result<i32> {
        let id = spec.id.as_str();
        let prep = ChildPrep::new(spec)?;

        let (sync_r, sync_w) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| NexusError::kernel("create sync pipe", id, e))?;
        let (status_r, status_w) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| NexusError::kernel("create status pipe", id, e))?;
        let (sync_r, mut sync_w) = (File::from(sync_r), File::from(sync_w));
        let (mut status_r, status_w) = (File::from(status_r), File::from(status_w));

        let mut stack = vec![0_u8; CHILD_STACK_SIZE];
        let flags = spec.namespaces.clone_flags();
        // SAFETY: without CLONE_VM the child runs on a private copy of our
        // address space. It only uses state prepared above, neither logs nor
        // allocates, and leaves through execve or by returning from the
        // callback.
        let pid = unsafe {
            clone(
                Box::new(|| child_main(&prep, &sync_r, &status_w)),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as libc::c_int),
            )
        }
        .map_err(|e| NexusError::kernel("clone", id, e))?;
        drop(sync_r);
        drop(status_w);
        tracing::debug!(node = id, pid = pid.as_raw(), "init process cloned");

        let released = cgroup.add_process(pid.as_raw()).and_then(|()| {
            sync_w
                .write_all(&[1])
                .map_err(|e| NexusError::kernel("release init process", id, e))
        });
        drop(sync_w);
        if let Err(e) = released {
            abort(pid);
            return Err(e);
        }

        let mut report = Vec::with_capacity(REPORT_LEN);
        if let Err(e) = status_r.read_to_end(&mut report) {
            abort(pid);
            return Err(NexusError::kernel("read init status", id, e));
        }
        if report.is_empty() {
            tracing::info!(node = id, pid = pid.as_raw(), "workload executed");
            return Ok(pid.as_raw());
        }

        let _ = waitpid(pid, None);
        Err(ChildFailure::decode(&report).map_or_else(
            || NexusError::kernel("read init status", id, std::io::Error::other("malformed status report")),
            |failure| failure.into_error(id),
        ))
    }

    /// Reaps `pid` if it is our exited child. Other processes are left
    /// alone.
    pub(super) fn try_reap(pid: i32) {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => {}
            Ok(status) => tracing::debug!(pid, ?status, "reaped init process"),
        }
    }

    pub(super) fn signal(pid: i32, sig: Signal) -> Result<()> {
        match kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(NexusError::kernel("signal init process", pid.to_string(), e)),
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::spawn_init;

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: node processes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn spawn_init(
    _spec: &crate::isolation::IsolationSpec,
    _cgroup: &nexus_core::cgroup::CgroupManager,
) -> Result<i32> {
    Err(NexusError::Config {
        message: "Linux required for native node operations".into(),
    })
}

/// Polls until `pid` is gone or `timeout` expires.
#[cfg(target_os = "linux")]
fn wait_gone(pid: i32, start_time: Option<u64>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        linux::try_reap(pid);
        if !is_alive(pid, start_time) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Stops the init process `pid`: SIGTERM, then SIGKILL once `grace` has
/// passed, reaping it if it is our child.
///
/// `start_time` guards against signalling a process that reused the pid.
/// The init of a PID namespace ignores SIGTERM from the host unless it
/// installed a handler, so the escalation is the common path.
///
/// # Errors
///
/// Returns an error if signalling fails or the process outlives SIGKILL.
#[cfg(target_os = "linux")]
pub fn terminate(pid: i32, start_time: Option<u64>, grace: Duration) -> Result<()> {
    use nix::sys::signal::Signal;

    if !is_alive(pid, start_time) {
        linux::try_reap(pid);
        return Ok(());
    }

    linux::signal(pid, Signal::SIGTERM)?;
    if wait_gone(pid, start_time, grace) {
        tracing::debug!(pid, "init process exited on SIGTERM");
        return Ok(());
    }

    tracing::warn!(pid, grace_secs = grace.as_secs(), "init process ignored SIGTERM, killing");
    linux::signal(pid, Signal::SIGKILL)?;
    if wait_gone(pid, start_time, KILL_TIMEOUT) {
        return Ok(());
    }
    Err(NexusError::kernel(
        "stop init process",
        pid.to_string(),
        std::io::Error::from(std::io::ErrorKind::TimedOut),
    ))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: node processes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn terminate(_pid: i32, _start_time: Option<u64>, _grace: Duration) -> Result<()> {
    Err(NexusError::Config {
        message: "Linux required for native node operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (sleep) S 1 4242 4242 0 -1 4194560 104 0 0 0 0 0 0 0 20 0 1 0 987654 2461696 144 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn stat_fields_are_extracted() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.start_time, 987_654);
        assert!(!stat.is_dead());
    }

    #[test]
    fn command_names_with_parentheses_are_skipped() {
        let raw = STAT.replace("(sleep)", "(a) b (c)");
        assert_eq!(parse_stat(&raw).unwrap().start_time, 987_654);
    }

    #[test]
    fn zombies_are_dead() {
        let raw = STAT.replace(") S ", ") Z ");
        assert!(parse_stat(&raw).unwrap().is_dead());
    }

    #[test]
    fn truncated_stat_is_rejected() {
        assert_eq!(parse_stat("4242 (sleep) S 1 2"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn own_process_is_alive() {
        let pid = i32::try_from(std::process::id()).unwrap();
        let stat = read_stat(pid).unwrap();
        assert!(is_alive(pid, Some(stat.start_time)));
        assert!(!is_alive(pid, Some(stat.start_time + 1)));
    }

    #[test]
    fn failure_report_round_trips_through_pipe_format() {
        let failure = ChildFailure {
            stage: Stage::PivotRoot,
            errno: libc::EINVAL,
        };
        assert_eq!(ChildFailure::decode(&failure.encode()), Some(failure));
        assert_eq!(ChildFailure::decode(&[9, 0, 0, 0, 0]), None);
        assert_eq!(ChildFailure::decode(&[1, 0]), None);
    }

    #[test]
    fn failure_is_attributed_to_its_stage() {
        let err = ChildFailure {
            stage: Stage::Exec,
            errno: libc::ENOENT,
        }
        .into_error("web-1");
        assert!(matches!(err, NexusError::Kernel { operation: "exec workload", .. }));
        assert!(err.to_string().starts_with("exec workload failed for web-1"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_inputs_are_converted_before_clone() {
        use nexus_common::types::{NodeConfig, NodeId};

        let rootfs = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            id: NodeId::new("web-1").unwrap(),
            hostname: "web-1".into(),
            memory_mb: 128,
            cpu_shares: 512,
            rootfs: rootfs.path().to_path_buf(),
            command: vec!["/bin/sh".into(), "-c".into(), "sleep 3600".into()],
            network_enabled: true,
        };
        let spec = crate::isolation::IsolationSpec::from_config(&config).unwrap();
        let prep = linux::ChildPrep::new(&spec).unwrap();

        assert!(rootfs.path().join("proc").is_dir());
        assert_eq!(prep.argv_len(), 3);
        assert!(prep.argv_terminated());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn nul_in_command_is_rejected_before_clone() {
        use nexus_common::types::{NodeConfig, NodeId};

        let rootfs = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            id: NodeId::new("web-1").unwrap(),
            hostname: "web-1".into(),
            memory_mb: 128,
            cpu_shares: 512,
            rootfs: rootfs.path().to_path_buf(),
            command: vec!["/bin/sh\0x".into()],
            network_enabled: true,
        };
        let spec = crate::isolation::IsolationSpec::from_config(&config).unwrap();
        let Err(err) = linux::ChildPrep::new(&spec) else {
            panic!("command with a NUL byte was accepted");
        };
        assert!(matches!(err, NexusError::Validation { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminating_a_vanished_process_succeeds() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = child.wait().unwrap();
        terminate(pid, None, Duration::from_millis(100)).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stubborn_process_is_killed_after_grace() {
        let child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        terminate(pid, read_stat(pid).map(|s| s.start_time), Duration::from_millis(200)).unwrap();
        assert!(!is_alive(pid, None));
    }
}
