//! Recognition of worker dispatch and completion events in Principal output.

use regex::Regex;
use std::sync::OnceLock;

/// Receiver of parsed dispatch lifecycle events.
///
/// For a dispatch line the parser calls `on_issue_start` before
/// `on_dispatch_worker`, so the worker tailer is attached before any
/// spinner-style UI reacts. Completion mirrors that: `on_worker_status`
/// (tailer teardown) fires before `on_issue_end`.
pub trait DispatchObserver {
    fn on_issue_start(&mut self, issue_id: u64);
    fn on_dispatch_worker(&mut self, issue_id: u64);
    fn on_worker_status(&mut self);
    fn on_issue_end(&mut self);
}

/// Line-at-a-time parser for the Principal's output stream.
#[derive(Debug, Default)]
pub struct OutputParser;

impl OutputParser {
    pub fn new() -> Self {
        Self
    }

    /// Feed one raw output line. At most one event fires per line; dispatch
    /// patterns are tested before completion patterns. ANSI sequences are
    /// stripped before matching so colored output still parses.
    pub fn feed_line(&mut self, raw: &str, observer: &mut dyn DispatchObserver) {
        let cleaned_bytes = strip_ansi_escapes::strip(raw.as_bytes());
        let line = String::from_utf8_lossy(&cleaned_bytes);

        if let Some(issue_id) = match_dispatch(&line) {
            observer.on_issue_start(issue_id);
            observer.on_dispatch_worker(issue_id);
            return;
        }
        if matches_completion(&line) {
            observer.on_worker_status();
            observer.on_issue_end();
        }
    }
}

fn dispatch_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Localized step-3 log line mentioning the issue number.
            r"STEP-3.*(?i:issue)\s*#(\d+)",
            // Command trace of the dispatch script.
            r"(?i)dispatch[-_]worker(?:\.sh)?\b.*--issue\s+(\d+)",
            // Human phrasing used by the zh-TW workflow docs.
            r"派工\s*(?i:issue)\s*#(\d+)",
            // Structured dispatch announcement.
            r"(?i)dispatch_worker:\s*issue=(\d+)",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn completion_status_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)WORKER_STATUS=(success|failed)").ok())
        .as_ref()
}

fn match_dispatch(line: &str) -> Option<u64> {
    for pattern in dispatch_patterns() {
        if let Some(captures) = pattern.captures(line) {
            if let Some(id) = captures.get(1).and_then(|m| m.as_str().parse().ok()) {
                return Some(id);
            }
        }
    }
    None
}

fn matches_completion(line: &str) -> bool {
    line.contains("STEP-4")
        || line.contains("Worker 執行完成")
        || completion_status_pattern()
            .map(|pattern| pattern.is_match(line))
            .unwrap_or(false)
}
