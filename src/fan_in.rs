//! Multiplexer that merges the live Principal stream and file tailers into one channel.

use crate::lock_or_recover;
use crate::log_debug;
use crate::paths::WorkspacePaths;
use crate::tailer::Tailer;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Capacity of the merged output channel. The live source drops lines when
/// the buffer is full rather than blocking shutdown.
const CHANNEL_CAPACITY: usize = 256;

/// Origin of a merged log line; the only cross-source ordering discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    /// Live bytes from the Principal's terminal.
    Claude,
    /// The Principal's own log file.
    Principal,
    /// The per-issue worker log file.
    Worker,
}

impl LineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSource::Claude => "claude",
            LineSource::Principal => "principal",
            LineSource::Worker => "worker",
        }
    }
}

impl fmt::Display for LineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of merged output. Trailing LF and any preceding CR are already
/// stripped; `issue_id` is zero when the line is not issue-scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LineSource,
    pub issue_id: u64,
    pub text: String,
}

/// Fan-in of N file tailers plus the live Principal stream.
///
/// Owns its tailers and the output channel: `stop` joins every tailer before
/// the channel closes, so consumers observe a clean end-of-stream exactly
/// once and senders can never hit a closed channel.
pub struct FanIn {
    tx: Mutex<Option<Sender<LogLine>>>,
    rx: Receiver<LogLine>,
    principal_tailer: Mutex<Option<Tailer>>,
    worker_tailer: Mutex<Option<Tailer>>,
    current_issue: AtomicU64,
    stopped: AtomicBool,
}

impl FanIn {
    pub fn new() -> Self {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            principal_tailer: Mutex::new(None),
            worker_tailer: Mutex::new(None),
            current_issue: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Receiver side of the merged channel. Cloneable; closes after `stop`.
    pub fn channel(&self) -> Receiver<LogLine> {
        self.rx.clone()
    }

    /// Enqueue one live line from the Principal's terminal. Never blocks:
    /// when the buffer is full the line is dropped, because the authoritative
    /// record is the tailed log file and a gone consumer must not deadlock
    /// shutdown. Silently discarded after `stop`.
    pub fn send_claude_line(&self, text: impl Into<String>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let guard = lock_or_recover(&self.tx, "fan_in::send_claude_line");
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let line = LogLine {
            source: LineSource::Claude,
            issue_id: 0,
            text: text.into(),
        };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log_debug("fan-in channel full; dropping live line");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Begin tailing the Principal's log file.
    pub fn start_principal_tailer(&self, paths: &WorkspacePaths) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(tx) = self.sender_clone() else {
            return;
        };
        let tailer = Tailer::start(paths.principal_log(), LineSource::Principal, 0, tx);
        let mut slot = lock_or_recover(&self.principal_tailer, "fan_in::start_principal_tailer");
        if let Some(mut previous) = slot.replace(tailer) {
            previous.stop();
        }
    }

    /// Attach the worker tailer for `issue_id`, stopping any prior worker
    /// tailer first. Only one worker tailer exists at a time.
    pub fn start_worker_tailer(&self, paths: &WorkspacePaths, issue_id: u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.stop_worker_tailer();
        let Some(tx) = self.sender_clone() else {
            return;
        };
        let tailer = Tailer::start(paths.worker_log(issue_id), LineSource::Worker, issue_id, tx);
        let mut slot = lock_or_recover(&self.worker_tailer, "fan_in::start_worker_tailer");
        *slot = Some(tailer);
        self.current_issue.store(issue_id, Ordering::SeqCst);
    }

    /// Detach and join the worker tailer, if any.
    pub fn stop_worker_tailer(&self) {
        let previous = lock_or_recover(&self.worker_tailer, "fan_in::stop_worker_tailer").take();
        if let Some(mut tailer) = previous {
            tailer.stop();
        }
        self.current_issue.store(0, Ordering::SeqCst);
    }

    /// Issue id of the active worker tailer; zero when none.
    pub fn current_issue_id(&self) -> u64 {
        self.current_issue.load(Ordering::SeqCst)
    }

    /// Stop all sources and close the output channel. Idempotent.
    ///
    /// Ordering matters: tailers are stopped and joined first, then the last
    /// sender is dropped, so the consumer sees end-of-stream only after every
    /// producer has gone quiet.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut tailer) =
            lock_or_recover(&self.principal_tailer, "fan_in::stop").take()
        {
            tailer.stop();
        }
        self.stop_worker_tailer();
        lock_or_recover(&self.tx, "fan_in::stop").take();
    }

    fn sender_clone(&self) -> Option<Sender<LogLine>> {
        lock_or_recover(&self.tx, "fan_in::sender_clone").clone()
    }
}

impl Default for FanIn {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-stream splitter for the live Principal output: accumulates raw chunks
/// and yields complete lines with LF/CR framing stripped.
pub(crate) struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}
