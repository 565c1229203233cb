//! Top-level run lifecycle: preflight, lock, launch, observe, clean shutdown.

use crate::config::AppConfig;
use crate::fan_in::{FanIn, LineAssembler, LineSource};
use crate::instance_lock::{InstanceLock, LockError};
use crate::issue_monitor::{IssueMonitor, MonitorEvent, STOP_REASON_WORKER_COMPLETE};
use crate::lock_or_recover;
use crate::log_debug;
use crate::output_parser::{DispatchObserver, OutputParser};
use crate::paths::WorkspacePaths;
use crate::preflight::{self, CheckStatus};
use crate::pty_exec::{PrincipalCommand, PtyExec};
use crate::rotating_log::RotatingLog;
use crate::signal_handler::ShutdownCoordinator;
use crate::state_store::{RunState, StateStore};
use crate::tracker::{GhCliTracker, IssueTracker};
use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, select, Receiver};
use std::collections::HashMap;
use std::io::{BufRead, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Grace period for the child to fully exit after its output stream closes.
const EXIT_AFTER_EOF_DEADLINE: Duration = Duration::from_secs(5);

/// Top-level supervisor for one kickoff run.
pub struct Supervisor {
    config: AppConfig,
    paths: WorkspacePaths,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Self {
        let paths = WorkspacePaths::new(&config.workspace);
        Self { config, paths }
    }

    /// Drive a full run. Returns the process exit code.
    pub fn run(&self) -> anyhow::Result<i32> {
        // 1. Preflight. Warnings print and continue; the first failure aborts.
        let results = preflight::run_preflight(&self.config, &self.paths);
        for result in &results {
            match result.status {
                CheckStatus::Warning => {
                    eprintln!("kickoff: warning: {}: {}", result.name, result.detail)
                }
                CheckStatus::Fail => {
                    eprintln!("kickoff: preflight failed: {}: {}", result.name, result.detail)
                }
                CheckStatus::Pass => {}
            }
        }
        if preflight::first_failure(&results).is_some() {
            return Ok(1);
        }

        // 2. Single-instance lock, released on every exit path (Drop included).
        let lock = match InstanceLock::acquire(&self.paths.lock_file()) {
            Ok(lock) => Arc::new(lock),
            Err(LockError::Busy { pid, start_time }) => {
                eprintln!(
                    "kickoff: another instance is running (pid {pid}, started {start_time})"
                );
                return Ok(1);
            }
            Err(err) => return Err(err.into()),
        };

        // 3. Offer to resume interrupted state.
        let store = StateStore::new(self.paths.last_run());
        let resumed = self.decide_resume(&store)?;
        let mut run_state = match resumed {
            Some(state) => {
                eprintln!(
                    "kickoff: resuming phase \"{}\" ({} issues in progress)",
                    state.phase,
                    state.issues_in_progress.len()
                );
                state
            }
            None => RunState::new("kickoff"),
        };
        run_state.phase = "kickoff".to_string();

        // 4. Durable run log, Principal under PTY, fan-in with principal tailer.
        let run_log = Arc::new(Mutex::new(
            RotatingLog::create(self.paths.state_dir()).context("create run log")?,
        ));
        let argv = self.config.principal_argv()?;
        let command = PrincipalCommand::new(
            argv[0].clone(),
            argv[1..].to_vec(),
            self.paths.root(),
        );
        let pty = Arc::new(
            PtyExec::start(&command).map_err(|e| anyhow!("principal spawn failed: {e}"))?,
        );
        {
            let mut log = lock_or_recover(&run_log, "supervisor::run");
            log.write_line(&format!("[kickoff] principal started: {}", pty.command_line()));
            if pty.is_fallback() {
                log.write_line("[kickoff] pseudo-terminal unavailable; using pipe capture");
            }
        }

        let fan_in = Arc::new(FanIn::new());
        fan_in.start_principal_tailer(&self.paths);

        // 5. Shutdown coordinator wired before any long-lived worker starts.
        let coordinator = ShutdownCoordinator::new(
            self.paths.clone(),
            Arc::clone(&pty),
            Arc::clone(&lock),
            Arc::downgrade(&fan_in),
        );
        coordinator.set_run_log(Arc::clone(&run_log));
        coordinator.install_signal_handlers()?;

        // 6. Live output pump: PTY bytes -> lines -> fan-in "claude" source.
        let reader = pty
            .take_output_reader()
            .ok_or_else(|| anyhow!("principal output reader unavailable"))?;
        let (eof_tx, eof_rx) = bounded::<()>(1);
        spawn_output_pump(reader, Arc::clone(&fan_in), eof_tx);

        // 7. Consume the merged stream until the Principal goes away.
        let tracker: Arc<dyn IssueTracker> = Arc::new(GhCliTracker::new(self.paths.root()));
        let mut wiring = DispatchWiring {
            paths: self.paths.clone(),
            fan_in: Arc::clone(&fan_in),
            coordinator: coordinator.clone(),
            tracker,
            session_id: self.config.session_id().to_string(),
            run_log: Arc::clone(&run_log),
            store: store.clone(),
            run_state,
            monitors: HashMap::new(),
            current_issue: None,
        };
        self.consume_fan_in(&fan_in.channel(), &eof_rx, &run_log, &mut wiring);

        // 8. The output stream closed: same cleanup as the signal path.
        match pty.wait_with_deadline(EXIT_AFTER_EOF_DEADLINE) {
            Ok(Some(status)) => {
                lock_or_recover(&run_log, "supervisor::run")
                    .write_line(&format!("[kickoff] principal exited (code {})", status.exit_code()));
                Ok(coordinator.finish_clean())
            }
            _ => {
                // Output closed but the child lingers; fall back to the staged
                // stop so the lock never outlives a live Principal.
                Ok(coordinator.handle_shutdown("principal output closed"))
            }
        }
    }

    fn consume_fan_in(
        &self,
        lines: &Receiver<crate::fan_in::LogLine>,
        eof_rx: &Receiver<()>,
        run_log: &Arc<Mutex<RotatingLog>>,
        wiring: &mut DispatchWiring,
    ) {
        let mut parser = OutputParser::new();
        loop {
            select! {
                recv(lines) -> msg => {
                    let Ok(line) = msg else { break };
                    lock_or_recover(run_log, "supervisor::consume")
                        .write_line(&format!("[{}] {}", line.source, line.text));
                    if matches!(line.source, LineSource::Claude | LineSource::Principal) {
                        parser.feed_line(&line.text, wiring);
                    }
                }
                recv(eof_rx) -> _ => break,
            }
        }
        // Drain whatever is already buffered so late lines still reach the log.
        while let Ok(line) = lines.try_recv() {
            lock_or_recover(run_log, "supervisor::consume")
                .write_line(&format!("[{}] {}", line.source, line.text));
        }
    }

    /// Resume policy: stale state warns and is skipped; flags bypass the
    /// prompt; a non-interactive stdin defaults to a fresh start.
    fn decide_resume(&self, store: &StateStore) -> anyhow::Result<Option<RunState>> {
        if !store.has_valid_state() {
            return Ok(None);
        }
        if store.is_stale() {
            eprintln!("kickoff: previous run state is older than 24h; starting fresh");
            return Ok(None);
        }
        if self.config.fresh {
            store.clear()?;
            return Ok(None);
        }
        if self.config.resume {
            return Ok(Some(store.load()?));
        }
        if !stdin_is_tty() {
            eprintln!("kickoff: previous run state found; starting fresh (pass --resume to continue it)");
            return Ok(None);
        }
        eprint!("kickoff: resume previous run? [y/N] ");
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim().to_ascii_lowercase();
        if answer == "y" || answer == "yes" {
            Ok(Some(store.load()?))
        } else {
            store.clear()?;
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn stdin_is_tty() -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

#[cfg(not(unix))]
fn stdin_is_tty() -> bool {
    false
}

/// Read the Principal's combined output, frame it into lines, and feed the
/// fan-in. Signals `eof_tx` when the stream ends.
fn spawn_output_pump(
    mut reader: Box<dyn Read + Send>,
    fan_in: Arc<FanIn>,
    eof_tx: crossbeam_channel::Sender<()>,
) {
    let builder = thread::Builder::new().name("kickoff-output-pump".to_string());
    let eof_tx_spawn_failed = eof_tx.clone();
    let spawned = builder.spawn(move || {
        let mut assembler = LineAssembler::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    for line in assembler.push(&chunk[..n]) {
                        fan_in.send_claude_line(line);
                    }
                }
                Err(err) => {
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    // PTY masters report EIO once the child side closes.
                    break;
                }
            }
        }
        let _ = eof_tx.try_send(());
    });
    if let Err(err) = spawned {
        log_debug(&format!("failed to spawn output pump: {err}"));
        let _ = eof_tx_spawn_failed.try_send(());
    }
}

/// Parser-event wiring: attaches worker tailers and monitors in the order the
/// dispatch protocol requires (tailer before monitor on start, tailer stop
/// before monitor stop on completion).
struct DispatchWiring {
    paths: WorkspacePaths,
    fan_in: Arc<FanIn>,
    coordinator: ShutdownCoordinator,
    tracker: Arc<dyn IssueTracker>,
    session_id: String,
    run_log: Arc<Mutex<RotatingLog>>,
    store: StateStore,
    run_state: RunState,
    monitors: HashMap<u64, Arc<IssueMonitor>>,
    current_issue: Option<u64>,
}

impl DispatchWiring {
    fn log(&self, message: &str) {
        lock_or_recover(&self.run_log, "wiring::log").write_line(message);
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.run_state) {
            log_debug(&format!("failed to persist run state: {err}"));
        }
    }
}

impl DispatchObserver for DispatchWiring {
    fn on_issue_start(&mut self, issue_id: u64) {
        self.fan_in.start_worker_tailer(&self.paths, issue_id);
        self.current_issue = Some(issue_id);
    }

    fn on_dispatch_worker(&mut self, issue_id: u64) {
        self.log(&format!("[kickoff] worker dispatched for issue #{issue_id}"));

        let run_log = Arc::clone(&self.run_log);
        let callback = Box::new(move |event: MonitorEvent| {
            let line = match event {
                MonitorEvent::Progress { kind, payload } => match payload {
                    Some(payload) => {
                        format!("[kickoff] issue #{issue_id} progress: {kind} ({payload})")
                    }
                    None => format!("[kickoff] issue #{issue_id} progress: {kind}"),
                },
                MonitorEvent::TimedOut => {
                    format!("[kickoff] issue #{issue_id}: no progress for 30m")
                }
                MonitorEvent::Recovered => {
                    format!("[kickoff] issue #{issue_id}: progress resumed")
                }
            };
            lock_or_recover(&run_log, "wiring::monitor_event").write_line(&line);
        });
        let monitor = Arc::new(IssueMonitor::start(
            Arc::clone(&self.tracker),
            issue_id,
            self.session_id.clone(),
            callback,
        ));
        self.coordinator.register_monitor(&monitor);
        self.monitors.insert(issue_id, monitor);

        self.run_state.phase = "worker".to_string();
        if !self.run_state.issues_in_progress.contains(&issue_id) {
            self.run_state.issues_in_progress.push(issue_id);
        }
        self.persist();
    }

    fn on_worker_status(&mut self) {
        self.fan_in.stop_worker_tailer();
    }

    fn on_issue_end(&mut self) {
        let Some(issue_id) = self.current_issue.take() else {
            return;
        };
        if let Some(monitor) = self.monitors.remove(&issue_id) {
            monitor.stop(STOP_REASON_WORKER_COMPLETE);
        }
        self.log(&format!("[kickoff] issue #{issue_id} worker finished"));

        self.run_state.phase = "kickoff".to_string();
        self.run_state.issues_in_progress.retain(|id| *id != issue_id);
        let task = format!("issue-{issue_id}");
        if !self.run_state.completed_tasks.contains(&task) {
            self.run_state.completed_tasks.push(task);
        }
        self.persist();
    }
}
