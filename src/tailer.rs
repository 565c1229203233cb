//! Polling file tailer that survives slow producers, truncation, and late file creation.

use crate::fan_in::{LineSource, LogLine};
use crate::log_debug;
use crate::threads::join_with_deadline;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_DEADLINE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;

/// Follower of one growing log file, emitting complete lines to a channel.
///
/// Only content appended after `start` is emitted; pre-existing bytes are
/// skipped by seeking to end-of-file on open.
pub struct Tailer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl Tailer {
    /// Start tailing `path`, emitting each appended line tagged with `source`
    /// and `issue_id`. A missing file is awaited rather than treated as an
    /// error.
    pub fn start(
        path: impl Into<PathBuf>,
        source: LineSource,
        issue_id: u64,
        out: Sender<LogLine>,
    ) -> Self {
        let path = path.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_path = path.clone();
        let builder = thread::Builder::new().name(format!("kickoff-tail-{source}"));
        let handle = builder
            .spawn(move || run_tail_loop(&thread_path, source, issue_id, &out, &stop_rx))
            .ok();
        if handle.is_none() {
            log_debug(&format!("failed to spawn tailer thread for {}", path.display()));
        }
        Self {
            stop_tx,
            handle,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the tailer. Idempotent; returns within one second even when the
    /// tail loop is blocked waiting for the file, a read, or the channel.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if !join_with_deadline(handle, STOP_DEADLINE) {
                log_debug(&format!(
                    "tailer for {} did not stop within deadline; abandoned",
                    self.path.display()
                ));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tail_loop(
    path: &Path,
    source: LineSource,
    issue_id: u64,
    out: &Sender<LogLine>,
    stop_rx: &Receiver<()>,
) {
    // Wait for the file to appear, checking the stop channel each poll.
    let mut file = loop {
        match File::open(path) {
            Ok(file) => break file,
            Err(_) => {
                if wait_or_stop(stop_rx, POLL_INTERVAL) {
                    return;
                }
            }
        }
    };

    // Pre-existing content is never emitted.
    let mut offset = match file.seek(SeekFrom::End(0)) {
        Ok(offset) => offset,
        Err(err) => {
            log_debug(&format!("tailer seek failed for {}: {err}", path.display()));
            return;
        }
    };
    let mut partial: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                log_debug(&format!(
                    "tailer metadata failed for {}: {err}",
                    path.display()
                ));
                return;
            }
        };

        // Truncation: the producer rewrote the file in place. Start over from
        // offset zero so no post-truncation content is missed.
        if len < offset {
            if file.seek(SeekFrom::Start(0)).is_err() {
                return;
            }
            offset = 0;
            partial.clear();
        }

        match file.read(&mut chunk) {
            Ok(0) => {
                if wait_or_stop(stop_rx, POLL_INTERVAL) {
                    return;
                }
            }
            Ok(n) => {
                offset += n as u64;
                partial.extend_from_slice(&chunk[..n]);
                while let Some(line) = take_complete_line(&mut partial) {
                    let log_line = LogLine {
                        source,
                        issue_id,
                        text: line,
                    };
                    // Blocked sends stay cancellable so stop() keeps its bound.
                    select! {
                        send(out, log_line) -> res => {
                            if res.is_err() {
                                return;
                            }
                        }
                        recv(stop_rx) -> _ => return,
                    }
                }
            }
            Err(err) => {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log_debug(&format!("tailer read failed for {}: {err}", path.display()));
                return;
            }
        }
    }
}

/// Sleep for `interval`, returning true when a stop was requested.
fn wait_or_stop(stop_rx: &Receiver<()>, interval: Duration) -> bool {
    match stop_rx.recv_timeout(interval) {
        Ok(()) => true,
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => true,
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => false,
    }
}

/// Pop the first LF-terminated line from `buffer`, stripping the trailing LF
/// and an optional preceding CR. Returns `None` when only a partial line
/// remains buffered.
fn take_complete_line(buffer: &mut Vec<u8>) -> Option<String> {
    let newline = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=newline).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_file(label: &str) -> PathBuf {
        let pid = std::process::id();
        let seq = TEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("kickoff-tail-test-{label}-{pid}-{seq}"));
        fs::create_dir_all(&dir).expect("create test dir");
        dir.join("tailed.log")
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        file.write_all(data.as_bytes()).expect("append");
    }

    fn recv_line(rx: &Receiver<LogLine>) -> LogLine {
        rx.recv_timeout(Duration::from_secs(3)).expect("line within 3s")
    }

    #[test]
    fn take_complete_line_strips_crlf_and_keeps_partial() {
        let mut buffer = b"one\r\ntwo\nthree".to_vec();
        assert_eq!(take_complete_line(&mut buffer).as_deref(), Some("one"));
        assert_eq!(take_complete_line(&mut buffer).as_deref(), Some("two"));
        assert_eq!(take_complete_line(&mut buffer), None);
        assert_eq!(buffer, b"three");
    }

    #[test]
    fn pre_existing_content_is_never_emitted() {
        let path = test_file("preexisting");
        append(&path, "old line\n");

        let (tx, rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Principal, 0, tx);
        // Give the tailer time to open and seek.
        thread::sleep(Duration::from_millis(300));
        append(&path, "new line\n");

        let line = recv_line(&rx);
        assert_eq!(line.text, "new line");
        assert_eq!(line.source, LineSource::Principal);
        tailer.stop();
        cleanup(&path);
    }

    #[test]
    fn waits_for_file_to_appear() {
        let path = test_file("late-create");
        let (tx, rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Worker, 7, tx);

        thread::sleep(Duration::from_millis(250));
        append(&path, "first\n");

        let line = recv_line(&rx);
        assert_eq!(line.text, "first");
        assert_eq!(line.issue_id, 7);
        tailer.stop();
        cleanup(&path);
    }

    #[test]
    fn truncation_resets_and_content_keeps_flowing() {
        let path = test_file("truncate");
        append(&path, "");
        let (tx, rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Worker, 3, tx);
        thread::sleep(Duration::from_millis(300));

        append(&path, "a\n");
        append(&path, "b\n");
        assert_eq!(recv_line(&rx).text, "a");
        assert_eq!(recv_line(&rx).text, "b");

        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .expect("truncate");
        thread::sleep(Duration::from_millis(250));
        append(&path, "c\n");
        assert_eq!(recv_line(&rx).text, "c");

        tailer.stop();
        cleanup(&path);
    }

    #[test]
    fn partial_lines_are_buffered_until_terminated() {
        let path = test_file("partial");
        append(&path, "");
        let (tx, rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Principal, 0, tx);
        thread::sleep(Duration::from_millis(300));

        append(&path, "beginning");
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "unterminated line must not be emitted"
        );
        append(&path, " and end\n");
        assert_eq!(recv_line(&rx).text, "beginning and end");

        tailer.stop();
        cleanup(&path);
    }

    #[test]
    fn stop_while_waiting_for_file_returns_quickly() {
        let path = test_file("stop-waiting");
        let (tx, _rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Principal, 0, tx);
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        tailer.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        cleanup(&path);
    }

    #[test]
    fn stop_while_blocked_on_full_channel_returns_quickly() {
        let path = test_file("stop-blocked");
        append(&path, "");
        let (tx, rx) = bounded(1);
        let mut tailer = Tailer::start(&path, LineSource::Worker, 1, tx);
        thread::sleep(Duration::from_millis(300));

        // Two lines: the first fills the bounded channel, the second blocks
        // the tail loop inside the cancellable send.
        append(&path, "fill\nblocked\n");
        thread::sleep(Duration::from_millis(300));

        let start = Instant::now();
        tailer.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).expect("first line").text, "fill");
        cleanup(&path);
    }

    #[test]
    fn stop_is_idempotent() {
        let path = test_file("stop-twice");
        let (tx, _rx) = unbounded();
        let mut tailer = Tailer::start(&path, LineSource::Principal, 0, tx);
        tailer.stop();
        tailer.stop();
        cleanup(&path);
    }
}
