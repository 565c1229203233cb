//! Polling watcher for dispatched-worker progress comments on a single issue.

use crate::lock_or_recover;
use crate::log_debug;
use crate::markers::{self, KIND_WORKER_COMPLETE};
use crate::threads::join_with_deadline;
use crate::tracker::{IssueState, IssueTracker};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const STOP_REASON_WORKER_COMPLETE: &str = "worker_complete";
pub const STOP_REASON_ISSUE_CLOSED: &str = "issue_closed";
pub const STOP_REASON_PROCESS_EXIT: &str = "process_exit";

/// Ceiling on joining the poll thread; an outstanding remote call is
/// abandoned rather than blocking shutdown.
const STOP_JOIN_DEADLINE: Duration = Duration::from_secs(10);

/// Pacing knobs, overridable in tests.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Steady-state wait between polls.
    pub poll_interval: Duration,
    /// Ceiling for the fetch-error backoff.
    pub max_backoff: Duration,
    /// Quiet period after which the monitor reports a timeout.
    pub activity_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            activity_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Events surfaced to the monitor callback on the poll thread. Callbacks must
/// stay fast; they run between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A new progress marker was observed.
    Progress {
        kind: String,
        payload: Option<String>,
    },
    /// No progress marker arrived within the activity timeout.
    TimedOut,
    /// Progress resumed after a timeout had been reported.
    Recovered,
}

pub type MonitorCallback = Box<dyn FnMut(MonitorEvent) + Send>;

struct MonitorShared {
    stop_reason: Mutex<Option<String>>,
    timed_out: AtomicBool,
    started_at: Instant,
    final_duration: Mutex<Option<Duration>>,
}

impl MonitorShared {
    /// Record `reason` if none is set yet; the first caller wins.
    fn record_stop_reason(&self, reason: &str) {
        let mut slot = lock_or_recover(&self.stop_reason, "issue_monitor::record_stop_reason");
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }
}

/// Poll loop watching one issue for progress markers. Owns its thread and the
/// set of already-seen comment identifiers.
pub struct IssueMonitor {
    issue_id: u64,
    shared: Arc<MonitorShared>,
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IssueMonitor {
    pub fn start(
        tracker: Arc<dyn IssueTracker>,
        issue_id: u64,
        session_id: impl Into<String>,
        callback: MonitorCallback,
    ) -> Self {
        Self::start_with_config(tracker, issue_id, session_id, callback, MonitorConfig::default())
    }

    pub fn start_with_config(
        tracker: Arc<dyn IssueTracker>,
        issue_id: u64,
        session_id: impl Into<String>,
        callback: MonitorCallback,
        config: MonitorConfig,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            stop_reason: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            started_at: Instant::now(),
            final_duration: Mutex::new(None),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let session_id = session_id.into();
        let loop_shared = Arc::clone(&shared);
        let builder = thread::Builder::new().name(format!("kickoff-monitor-{issue_id}"));
        let handle = builder
            .spawn(move || {
                run_poll_loop(
                    tracker.as_ref(),
                    issue_id,
                    &session_id,
                    callback,
                    &config,
                    &loop_shared,
                    &stop_rx,
                );
                let elapsed = loop_shared.started_at.elapsed();
                let mut slot =
                    lock_or_recover(&loop_shared.final_duration, "issue_monitor::poll_exit");
                *slot = Some(elapsed);
            })
            .ok();
        if handle.is_none() {
            log_debug(&format!("failed to spawn monitor thread for issue {issue_id}"));
        }

        Self {
            issue_id,
            shared,
            stop_tx,
            handle: Mutex::new(handle),
        }
    }

    pub fn issue_id(&self) -> u64 {
        self.issue_id
    }

    /// Request shutdown with `reason` and wait for the poll thread, with a
    /// ten-second ceiling. Idempotent; only the first reason is recorded.
    pub fn stop(&self, reason: &str) {
        self.shared.record_stop_reason(reason);
        let _ = self.stop_tx.try_send(());
        let handle = lock_or_recover(&self.handle, "issue_monitor::stop").take();
        if let Some(handle) = handle {
            if !join_with_deadline(handle, STOP_JOIN_DEADLINE) {
                log_debug(&format!(
                    "monitor for issue {} still in a remote call; abandoned",
                    self.issue_id
                ));
            }
        }
    }

    /// Reason recorded by the first stop, whether internal or caller-driven.
    pub fn stop_reason(&self) -> Option<String> {
        lock_or_recover(&self.shared.stop_reason, "issue_monitor::stop_reason").clone()
    }

    /// True while the activity timeout has fired and no later progress
    /// comment has cleared it.
    pub fn is_timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    /// Time the monitor has been (or was) running.
    pub fn duration(&self) -> Duration {
        let finished = *lock_or_recover(&self.shared.final_duration, "issue_monitor::duration");
        finished.unwrap_or_else(|| self.shared.started_at.elapsed())
    }
}

fn run_poll_loop(
    tracker: &dyn IssueTracker,
    issue_id: u64,
    session_id: &str,
    mut callback: MonitorCallback,
    config: &MonitorConfig,
    shared: &MonitorShared,
    stop_rx: &Receiver<()>,
) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut delay = config.poll_interval;
    let mut last_activity = Instant::now();

    loop {
        match tracker.fetch(issue_id) {
            Err(err) => {
                delay = next_delay_after_error(delay, config.max_backoff);
                log_debug(&format!(
                    "issue {issue_id} fetch failed ({err}); next poll in {delay:?}"
                ));
            }
            Ok(snapshot) => {
                delay = config.poll_interval;
                let mut worker_complete = false;

                for comment in &snapshot.comments {
                    if !seen.insert(comment.id.clone()) {
                        continue;
                    }
                    let Some(marker) = markers::parse_marker(&comment.body) else {
                        continue;
                    };
                    if !session_id.is_empty() && marker.session_id != session_id {
                        continue;
                    }

                    last_activity = Instant::now();
                    if shared.timed_out.swap(false, Ordering::SeqCst) {
                        callback(MonitorEvent::Recovered);
                    }
                    if marker.kind == KIND_WORKER_COMPLETE {
                        worker_complete = true;
                    }
                    callback(MonitorEvent::Progress {
                        kind: marker.kind,
                        payload: marker.payload,
                    });
                }

                if worker_complete {
                    shared.record_stop_reason(STOP_REASON_WORKER_COMPLETE);
                    return;
                }
                if snapshot.state == IssueState::Closed {
                    shared.record_stop_reason(STOP_REASON_ISSUE_CLOSED);
                    return;
                }
            }
        }

        if last_activity.elapsed() >= config.activity_timeout
            && !shared.timed_out.swap(true, Ordering::SeqCst)
        {
            callback(MonitorEvent::TimedOut);
        }

        match stop_rx.recv_timeout(delay) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Double the poll delay after a fetch error, up to the configured ceiling.
fn next_delay_after_error(current: Duration, max_backoff: Duration) -> Duration {
    (current * 2).min(max_backoff)
}
