//! Issue-tracker access through the `gh` CLI, bounded so a hung call never wedges polling.

use crate::log_debug;
use crate::retry::{self, Retryable};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Ceiling for one remote call; expiry is treated as a retryable failure.
const REMOTE_CALL_DEADLINE: Duration = Duration::from_secs(30);
const EXIT_POLL_MS: u64 = 50;

/// Tracker-side state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

/// One comment on an issue. Identifiers are opaque and compared only for
/// equality; the tracker may reorder the list between polls.
#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Combined issue state plus comments, fetched atomically per poll.
#[derive(Debug, Clone)]
pub struct IssueSnapshot {
    pub state: IssueState,
    pub comments: Vec<Comment>,
}

/// Failure talking to the tracker. Carries the process exit code so the
/// retry classifier can weigh it alongside the message text.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl RemoteError {
    fn new(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

impl Retryable for RemoteError {
    fn retryable(&self) -> bool {
        retry::is_retryable(&self.message, self.exit_code)
    }
}

/// Remote issue-tracker operations used by the monitor.
pub trait IssueTracker: Send + Sync {
    fn fetch(&self, issue_id: u64) -> Result<IssueSnapshot, RemoteError>;
}

/// Tracker backed by the `gh` CLI run against a repository checkout.
#[derive(Debug, Clone)]
pub struct GhCliTracker {
    repo_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct GhIssueView {
    state: String,
    #[serde(default)]
    comments: Vec<GhComment>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: String,
    body: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

impl GhCliTracker {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    fn fetch_once(&self, issue_id: u64) -> Result<IssueSnapshot, RemoteError> {
        let mut command = Command::new("gh");
        command
            .current_dir(&self.repo_path)
            .args([
                "issue",
                "view",
                &issue_id.to_string(),
                "--json",
                "state,comments",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = run_with_deadline(&mut command, REMOTE_CALL_DEADLINE)?;
        if !output.exit_code.map(|code| code == 0).unwrap_or(false) {
            let detail = if output.stderr.trim().is_empty() {
                "gh exited with failure".to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(RemoteError::new(detail, output.exit_code));
        }

        let view: GhIssueView = serde_json::from_str(&output.stdout)
            .map_err(|e| RemoteError::new(format!("unexpected gh output: {e}"), Some(0)))?;
        Ok(IssueSnapshot {
            state: if view.state.eq_ignore_ascii_case("closed") {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            comments: view
                .comments
                .into_iter()
                .map(|c| Comment {
                    id: c.id,
                    body: c.body,
                    created_at: c.created_at,
                })
                .collect(),
        })
    }
}

impl IssueTracker for GhCliTracker {
    fn fetch(&self, issue_id: u64) -> Result<IssueSnapshot, RemoteError> {
        retry::with_retry(retry::DEFAULT_ATTEMPTS, retry::INITIAL_BACKOFF, || {
            self.fetch_once(issue_id)
        })
    }
}

#[derive(Debug)]
pub(crate) struct BoundedOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: Option<i32>,
}

/// Run a subprocess, killing it once `deadline` elapses. Output is drained on
/// reader threads so a chatty child cannot stall on a full pipe.
pub(crate) fn run_with_deadline(
    command: &mut Command,
    deadline: Duration,
) -> Result<BoundedOutput, RemoteError> {
    let mut child = command
        .spawn()
        .map_err(|e| RemoteError::new(format!("failed to run gh: {e}"), None))?;

    let stdout_handle = child.stdout.take().map(spawn_capture_thread);
    let stderr_handle = child.stderr.take().map(spawn_capture_thread);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= deadline {
                    kill_and_reap(&mut child);
                    return Err(RemoteError::new(
                        format!("gh call timed out after {}s", deadline.as_secs()),
                        None,
                    ));
                }
                thread::sleep(Duration::from_millis(EXIT_POLL_MS));
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(RemoteError::new(format!("wait on gh failed: {e}"), None));
            }
        }
    };

    Ok(BoundedOutput {
        stdout: join_capture(stdout_handle),
        stderr: join_capture(stderr_handle),
        exit_code: status.code(),
    })
}

fn spawn_capture_thread<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut collected = String::new();
        let _ = source.read_to_string(&mut collected);
        collected
    })
}

fn join_capture(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        log_debug(&format!("failed to kill timed-out gh call: {err}"));
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gh_issue_view_json_parses() {
        let raw = r#"{
            "state": "OPEN",
            "comments": [
                {"id": "IC_1", "body": "working", "createdAt": "2026-08-01T10:00:00Z"},
                {"id": "IC_2", "body": "done", "createdAt": "2026-08-01T10:05:00Z"}
            ]
        }"#;
        let view: GhIssueView = serde_json::from_str(raw).expect("parse");
        assert_eq!(view.state, "OPEN");
        assert_eq!(view.comments.len(), 2);
        assert_eq!(view.comments[0].id, "IC_1");
    }

    #[test]
    fn missing_comments_default_to_empty() {
        let view: GhIssueView =
            serde_json::from_str(r#"{"state": "CLOSED"}"#).expect("parse");
        assert_eq!(view.state, "CLOSED");
        assert!(view.comments.is_empty());
    }

    #[test]
    fn timeout_errors_are_retryable() {
        let err = RemoteError::new("gh call timed out after 30s", None);
        assert!(err.retryable());
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        let err = RemoteError::new("gh: To get started with GitHub CLI, run gh auth login", Some(1));
        assert!(!err.retryable());
    }

    #[cfg(unix)]
    #[test]
    fn run_with_deadline_kills_overrunning_child() {
        let mut command = Command::new("/bin/sh");
        command
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let start = Instant::now();
        let err = run_with_deadline(&mut command, Duration::from_millis(200))
            .expect_err("deadline should fire");
        assert!(err.message.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_deadline_captures_output_and_exit_code() {
        let mut command = Command::new("/bin/sh");
        command
            .args(["-c", "printf out; printf err >&2; exit 3"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = run_with_deadline(&mut command, Duration::from_secs(5)).expect("run");
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert_eq!(output.exit_code, Some(3));
    }
}
