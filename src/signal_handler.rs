//! Staged shutdown: cooperative stop marker, graceful and force windows, ordered cleanup.

use crate::fan_in::FanIn;
use crate::instance_lock::InstanceLock;
use crate::issue_monitor::{IssueMonitor, STOP_REASON_PROCESS_EXIT};
use crate::lock_or_recover;
use crate::log_debug;
use crate::paths::WorkspacePaths;
use crate::pty_exec::PtyExec;
use crate::rotating_log::RotatingLog;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Wall-clock budget for the cooperative shutdown stages.
#[derive(Debug, Clone)]
pub struct ShutdownTimings {
    /// How long the Principal gets to exit after the stop marker appears.
    pub graceful_window: Duration,
    /// Cadence of the "remaining" progress hints inside the graceful window.
    pub hint_interval: Duration,
    /// Extra wait after the graceful window before the child is killed.
    pub force_window: Duration,
    /// Pause between TERM and KILL when reaping leftover worker pids.
    pub reap_grace: Duration,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            graceful_window: Duration::from_secs(60),
            hint_interval: Duration::from_secs(10),
            force_window: Duration::from_secs(10),
            reap_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    GracefulRequested,
    Terminated,
}

struct CoordinatorInner {
    paths: WorkspacePaths,
    pty: Arc<PtyExec>,
    lock: Arc<InstanceLock>,
    fan_in: Weak<FanIn>,
    monitors: Mutex<Vec<Weak<IssueMonitor>>>,
    run_log: Mutex<Option<Arc<Mutex<RotatingLog>>>>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    state: Mutex<ShutdownState>,
    timings: ShutdownTimings,
}

/// Composition point for shutdown: owns nothing but the protocol, holding
/// weak references to the fan-in and monitors it must quiesce.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ShutdownCoordinator {
    pub fn new(
        paths: WorkspacePaths,
        pty: Arc<PtyExec>,
        lock: Arc<InstanceLock>,
        fan_in: Weak<FanIn>,
    ) -> Self {
        Self::with_timings(paths, pty, lock, fan_in, ShutdownTimings::default())
    }

    pub fn with_timings(
        paths: WorkspacePaths,
        pty: Arc<PtyExec>,
        lock: Arc<InstanceLock>,
        fan_in: Weak<FanIn>,
        timings: ShutdownTimings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                paths,
                pty,
                lock,
                fan_in,
                monitors: Mutex::new(Vec::new()),
                run_log: Mutex::new(None),
                cleanup: Mutex::new(None),
                state: Mutex::new(ShutdownState::Running),
                timings,
            }),
        }
    }

    /// Track a monitor for shutdown. Weak: the supervisor keeps ownership.
    pub fn register_monitor(&self, monitor: &Arc<IssueMonitor>) {
        lock_or_recover(&self.inner.monitors, "shutdown::register_monitor")
            .push(Arc::downgrade(monitor));
    }

    pub fn set_run_log(&self, run_log: Arc<Mutex<RotatingLog>>) {
        *lock_or_recover(&self.inner.run_log, "shutdown::set_run_log") = Some(run_log);
    }

    /// One-shot user cleanup callback, invoked between fan-in stop and lock release.
    pub fn set_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>) {
        *lock_or_recover(&self.inner.cleanup, "shutdown::set_cleanup") = Some(cleanup);
    }

    /// Register interrupt handlers on a dedicated observer thread. The first
    /// signal drives the full shutdown sequence and exits the process.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> anyhow::Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let coordinator = self.clone();
        thread::Builder::new()
            .name("kickoff-signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    let code = coordinator.handle_shutdown(&format!("signal {signal}"));
                    std::process::exit(code);
                }
            })?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> anyhow::Result<()> {
        log_debug("signal handlers unavailable on this platform");
        Ok(())
    }

    /// Run the staged shutdown. Returns the process exit code: 0 when the
    /// Principal left within the graceful window, 1 when force action was
    /// needed. Idempotent; late callers get the forced code without re-running
    /// the sequence.
    pub fn handle_shutdown(&self, reason: &str) -> i32 {
        {
            let mut state = lock_or_recover(&self.inner.state, "shutdown::handle_shutdown");
            if *state != ShutdownState::Running {
                return 1;
            }
            *state = ShutdownState::GracefulRequested;
        }
        self.emit(&format!("shutdown requested ({reason})"));

        let graceful = match self.write_stop_marker(reason) {
            Ok(()) => self.wait_graceful_window(),
            Err(err) => {
                // Without the marker the Principal will never leave on its
                // own; go straight to force termination.
                self.emit(&format!("failed to write stop marker: {err}"));
                false
            }
        };

        if !graceful {
            self.force_terminate();
        }

        self.cleanup_tail();
        *lock_or_recover(&self.inner.state, "shutdown::handle_shutdown") =
            ShutdownState::Terminated;
        if graceful {
            0
        } else {
            1
        }
    }

    /// Cleanup path for a Principal that exited on its own: no stop marker,
    /// no kill, same ordered teardown. Returns exit code 0.
    pub fn finish_clean(&self) -> i32 {
        {
            let mut state = lock_or_recover(&self.inner.state, "shutdown::finish_clean");
            if *state != ShutdownState::Running {
                return 0;
            }
            *state = ShutdownState::GracefulRequested;
        }
        self.cleanup_tail();
        *lock_or_recover(&self.inner.state, "shutdown::finish_clean") = ShutdownState::Terminated;
        0
    }

    fn write_stop_marker(&self, reason: &str) -> std::io::Result<()> {
        let marker = self.inner.paths.stop_marker();
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &marker,
            format!("stopped_at={}\nreason={}\n", Utc::now().to_rfc3339(), reason),
        )
    }

    /// Wait out the graceful window in hint-sized slices. True iff the child
    /// exited before the window closed.
    fn wait_graceful_window(&self) -> bool {
        let timings = &self.inner.timings;
        let mut remaining = timings.graceful_window;
        while !remaining.is_zero() {
            let slice = timings.hint_interval.min(remaining);
            match self.inner.pty.wait_with_deadline(slice) {
                Ok(Some(status)) => {
                    self.emit(&format!(
                        "principal exited during graceful window (code {})",
                        status.exit_code()
                    ));
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    self.emit(&format!("wait on principal failed: {err}"));
                    return false;
                }
            }
            remaining = remaining.saturating_sub(slice);
            if !remaining.is_zero() {
                self.emit(&format!(
                    "waiting for principal exit; {} seconds remaining",
                    remaining.as_secs()
                ));
            }
        }
        false
    }

    /// Force window, then kill, then best-effort worker reaping.
    fn force_terminate(&self) {
        let timings = &self.inner.timings;
        match self.inner.pty.wait_with_deadline(timings.force_window) {
            Ok(Some(_)) => {
                self.emit("principal exited during force window");
            }
            _ => {
                self.emit("principal ignored stop request; killing");
                if let Err(err) = self.inner.pty.kill() {
                    self.emit(&format!("kill failed: {err}"));
                }
                // Lock release must not happen before the exit is observed.
                let _ = self.inner.pty.wait_with_deadline(timings.force_window);
            }
        }
        self.reap_worker_pids();
    }

    /// Terminate leftover worker processes recorded in pid files. Absent or
    /// unparseable files are skipped silently.
    fn reap_worker_pids(&self) {
        let pid_files = [
            self.inner.paths.worker_pid_file(),
            self.inner.paths.codex_pid_file(),
        ];
        for pid_file in pid_files {
            let Some(pid) = read_pid_file(&pid_file) else {
                continue;
            };
            self.emit(&format!(
                "reaping worker pid {pid} from {}",
                pid_file.display()
            ));
            #[cfg(unix)]
            {
                let _ = crate::process_signal::signal_process_group_or_pid(
                    pid,
                    libc::SIGTERM,
                    true,
                );
                thread::sleep(self.inner.timings.reap_grace);
                let _ = crate::process_signal::signal_process_group_or_pid(
                    pid,
                    libc::SIGKILL,
                    true,
                );
            }
            let _ = fs::remove_file(&pid_file);
        }
    }

    /// Shared teardown tail. Ordering is load-bearing: monitors stop first,
    /// the fan-in joins its tailers and closes the channel, then the user
    /// callback runs, the lock is released, and PTY resources close last.
    fn cleanup_tail(&self) {
        let monitors = {
            let mut guard = lock_or_recover(&self.inner.monitors, "shutdown::cleanup_tail");
            std::mem::take(&mut *guard)
        };
        for weak in monitors {
            if let Some(monitor) = weak.upgrade() {
                monitor.stop(STOP_REASON_PROCESS_EXIT);
            }
        }

        if let Some(fan_in) = self.inner.fan_in.upgrade() {
            fan_in.stop();
        }

        let cleanup = lock_or_recover(&self.inner.cleanup, "shutdown::cleanup_tail").take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }

        self.inner.lock.release();
        self.inner.pty.close();
    }

    fn emit(&self, message: &str) {
        eprintln!("kickoff: {message}");
        log_debug(message);
        let run_log = lock_or_recover(&self.inner.run_log, "shutdown::emit").clone();
        if let Some(run_log) = run_log {
            lock_or_recover(&run_log, "shutdown::emit").write_line(&format!("[kickoff] {message}"));
        }
    }
}

fn read_pid_file(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty_exec::PrincipalCommand;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_workspace(label: &str) -> WorkspacePaths {
        let pid = std::process::id();
        let seq = TEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let root =
            std::env::temp_dir().join(format!("kickoff-shutdown-test-{label}-{pid}-{seq}"));
        let paths = WorkspacePaths::new(&root);
        fs::create_dir_all(paths.state_dir()).expect("create state dir");
        paths
    }

    fn cleanup_workspace(paths: &WorkspacePaths) {
        let _ = fs::remove_dir_all(paths.root());
    }

    fn fast_timings() -> ShutdownTimings {
        ShutdownTimings {
            graceful_window: Duration::from_millis(600),
            hint_interval: Duration::from_millis(200),
            force_window: Duration::from_millis(300),
            reap_grace: Duration::from_millis(20),
        }
    }

    #[cfg(unix)]
    fn start_child(paths: &WorkspacePaths, script: &str) -> Arc<PtyExec> {
        let command = PrincipalCommand::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            paths.root(),
        );
        Arc::new(PtyExec::start(&command).expect("start child"))
    }

    #[cfg(unix)]
    fn coordinator_for(
        paths: &WorkspacePaths,
        pty: Arc<PtyExec>,
        fan_in: &Arc<FanIn>,
    ) -> (ShutdownCoordinator, Arc<InstanceLock>) {
        let lock = Arc::new(InstanceLock::acquire(&paths.lock_file()).expect("acquire lock"));
        let coordinator = ShutdownCoordinator::with_timings(
            paths.clone(),
            pty,
            Arc::clone(&lock),
            Arc::downgrade(fan_in),
            fast_timings(),
        );
        (coordinator, lock)
    }

    #[cfg(unix)]
    #[test]
    fn cooperative_child_exits_gracefully_with_code_zero() {
        let paths = test_workspace("graceful");
        let marker = paths.stop_marker();
        let script = format!(
            "while [ ! -f '{}' ]; do sleep 0.05; done",
            marker.display()
        );
        let pty = start_child(&paths, &script);
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, pty, &fan_in);

        let code = coordinator.handle_shutdown("test");
        assert_eq!(code, 0);
        assert!(marker.exists(), "stop marker was written");
        assert!(!paths.lock_file().exists(), "lock released after shutdown");
        cleanup_workspace(&paths);
    }

    #[cfg(unix)]
    #[test]
    fn stubborn_child_is_killed_with_code_one() {
        let paths = test_workspace("forced");
        let pty = start_child(&paths, "sleep 120");
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, Arc::clone(&pty), &fan_in);

        let start = Instant::now();
        let code = coordinator.handle_shutdown("test");
        assert_eq!(code, 1);
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "fast timings keep the sequence bounded"
        );
        assert!(
            pty.try_wait().expect("try_wait").is_some(),
            "child was killed"
        );
        assert!(!paths.lock_file().exists());
        cleanup_workspace(&paths);
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_is_idempotent_and_runs_cleanup_once() {
        let paths = test_workspace("idempotent");
        let pty = start_child(&paths, "true");
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, pty, &fan_in);

        let cleanup_runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&cleanup_runs);
        coordinator.set_cleanup(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let first = coordinator.handle_shutdown("first");
        let second = coordinator.handle_shutdown("second");
        assert_eq!(first, 0);
        assert_eq!(second, 1, "late callers observe the guard");
        assert_eq!(cleanup_runs.load(Ordering::SeqCst), 1);
        cleanup_workspace(&paths);
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_tail_stops_monitors_and_closes_fan_in() {
        use crate::tracker::{IssueSnapshot, IssueState, IssueTracker, RemoteError};

        struct IdleTracker;
        impl IssueTracker for IdleTracker {
            fn fetch(&self, _issue_id: u64) -> Result<IssueSnapshot, RemoteError> {
                Ok(IssueSnapshot {
                    state: IssueState::Open,
                    comments: vec![],
                })
            }
        }

        let paths = test_workspace("cleanup-tail");
        let pty = start_child(&paths, "true");
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, pty, &fan_in);

        let monitor = Arc::new(IssueMonitor::start(
            Arc::new(IdleTracker),
            11,
            "s",
            Box::new(|_event| {}),
        ));
        coordinator.register_monitor(&monitor);

        let rx = fan_in.channel();
        let code = coordinator.finish_clean();
        assert_eq!(code, 0);
        assert_eq!(
            monitor.stop_reason().as_deref(),
            Some(STOP_REASON_PROCESS_EXIT)
        );
        match rx.recv_timeout(Duration::from_secs(1)) {
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {}
            other => panic!("expected closed fan-in channel, got {other:?}"),
        }
        cleanup_workspace(&paths);
    }

    #[cfg(unix)]
    #[test]
    fn worker_pid_files_are_reaped_after_force() {
        let paths = test_workspace("reap");
        // A sleeper standing in for an orphaned worker.
        let mut worker = std::process::Command::new("sleep")
            .arg("120")
            .spawn()
            .expect("spawn fake worker");
        let worker_pid = worker.id() as i32;
        fs::write(paths.worker_pid_file(), worker_pid.to_string()).expect("write pid file");

        let pty = start_child(&paths, "sleep 120");
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, pty, &fan_in);

        let code = coordinator.handle_shutdown("test");
        assert_eq!(code, 1);
        assert!(!paths.worker_pid_file().exists(), "pid file consumed");

        // The fake worker should be gone shortly after the TERM/KILL pair.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut terminated = false;
        while Instant::now() < deadline {
            if worker.try_wait().expect("try_wait").is_some() {
                terminated = true;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(terminated, "worker pid {worker_pid} should be terminated");
        cleanup_workspace(&paths);
    }

    #[test]
    fn read_pid_file_handles_missing_and_garbage() {
        let paths = test_workspace("pidfile");
        assert_eq!(read_pid_file(&paths.worker_pid_file()), None);
        fs::write(paths.worker_pid_file(), "not a pid").expect("write");
        assert_eq!(read_pid_file(&paths.worker_pid_file()), None);
        fs::write(paths.worker_pid_file(), " 4242 \n").expect("write");
        assert_eq!(read_pid_file(&paths.worker_pid_file()), Some(4242));
        cleanup_workspace(&paths);
    }

    #[cfg(unix)]
    #[test]
    fn stop_marker_records_timestamp_and_reason() {
        let paths = test_workspace("marker-contents");
        let pty = start_child(&paths, "true");
        let fan_in = Arc::new(FanIn::new());
        let (coordinator, _lock) = coordinator_for(&paths, pty, &fan_in);

        let _ = coordinator.handle_shutdown("signal 15");
        let contents = fs::read_to_string(paths.stop_marker()).expect("read marker");
        assert!(contents.contains("stopped_at="));
        assert!(contents.contains("reason=signal 15"));
        cleanup_workspace(&paths);
    }
}
