//! Bounded thread joins so shutdown never hangs on a stuck worker.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const JOIN_POLL_MS: u64 = 10;

/// Join a worker thread, giving up after `deadline`.
///
/// Returns `true` when the thread finished and was joined; `false` when the
/// deadline expired and the thread was abandoned to finish on its own.
pub(crate) fn join_with_deadline<T>(handle: JoinHandle<T>, deadline: Duration) -> bool {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(JOIN_POLL_MS));
    }
    let _ = handle.join();
    true
}
