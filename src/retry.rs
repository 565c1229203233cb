//! Remote-error classification and bounded exponential backoff for tracker calls.

use crate::log_debug;
use std::time::Duration;

/// Substrings that mark an error as worth retrying.
const RETRYABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "403",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "no such host",
    "network",
    "temporary failure",
];

/// Substrings that mark an error as permanent. These win over retryable
/// matches when both appear in one message.
const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "authentication",
    "auth",
    "login",
    "not found",
    "404",
    "422",
    "validation failed",
    "already exists",
];

/// Classify a remote failure by message text and process exit code.
///
/// Non-retryable patterns beat retryable ones; with no pattern match, a
/// non-zero exit code alone makes the failure retryable.
pub fn is_retryable(message: &str, exit_code: Option<i32>) -> bool {
    let lowered = message.to_lowercase();
    if NON_RETRYABLE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return false;
    }
    if RETRYABLE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return true;
    }
    matches!(exit_code, Some(code) if code != 0)
}

/// Default attempt budget for remote calls.
pub const DEFAULT_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that know whether retrying could help.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

/// Run `call` up to `attempts` times, sleeping `initial_backoff << n` between
/// retryable failures. Non-retryable failures surface immediately.
pub fn with_retry<T, E, F>(attempts: u32, initial_backoff: Duration, mut call: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.retryable() || attempt >= attempts.max(1) {
                    return Err(err);
                }
                let backoff = initial_backoff * (1 << (attempt - 1));
                log_debug(&format!(
                    "retryable remote failure (attempt {attempt}/{attempts}): {err}; backing off {backoff:?}"
                ));
                std::thread::sleep(backoff);
            }
        }
    }
}
