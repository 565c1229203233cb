//! Supervisor run log with size-based rotation and oldest-first pruning.

use crate::log_debug;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 10;
const FILE_PREFIX: &str = "kickoff-";
const FILE_SUFFIX: &str = ".log";

/// Append-only, timestamp-prefixed log that rotates to a fresh file once the
/// current one exceeds the size ceiling.
pub struct RotatingLog {
    dir: PathBuf,
    file: Option<File>,
    path: PathBuf,
    bytes_written: u64,
    max_bytes: u64,
    max_files: usize,
    write_error_reported: bool,
}

impl RotatingLog {
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::with_limits(dir, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES)
    }

    pub fn with_limits(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        max_files: usize,
    ) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (file, path) = open_fresh_file(&dir)?;
        let log = Self {
            dir,
            file: Some(file),
            path,
            bytes_written: 0,
            max_bytes,
            max_files,
            write_error_reported: false,
        };
        log.prune();
        Ok(log)
    }

    /// Append one line, prefixed with the wall-clock timestamp.
    ///
    /// Rotation happens before the write once the file has grown past the
    /// ceiling, so a file sitting exactly at the ceiling rotates on the next
    /// write, not eagerly. Write failures are reported once; later lines are
    /// dropped rather than aborting the run.
    pub fn write_line(&mut self, text: &str) {
        if self.bytes_written >= self.max_bytes {
            if let Err(err) = self.rotate() {
                self.report_write_error(&format!("rotate failed: {err}"));
                return;
            }
        }
        let line = format!("{} {text}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let Some(file) = self.file.as_mut() else {
            return;
        };
        match file.write_all(line.as_bytes()) {
            Ok(()) => {
                self.bytes_written = self.bytes_written.saturating_add(line.len() as u64);
            }
            Err(err) => {
                let message = format!("log write failed: {err}");
                self.report_write_error(&message);
            }
        }
    }

    /// Close the current file and start a fresh one, then prune old files.
    pub fn rotate(&mut self) -> anyhow::Result<()> {
        self.file = None;
        let (file, path) = open_fresh_file(&self.dir)?;
        self.file = Some(file);
        self.path = path;
        self.bytes_written = 0;
        self.prune();
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn report_write_error(&mut self, message: &str) {
        if self.write_error_reported {
            return;
        }
        self.write_error_reported = true;
        log_debug(message);
        tracing::warn!(target: "rotating_log", "{message}; further writes dropped");
    }

    /// Delete oldest-modified log files beyond the file-count ceiling.
    fn prune(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut logs: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                    return None;
                }
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, path))
            })
            .collect();
        if logs.len() <= self.max_files {
            return;
        }
        logs.sort_by_key(|(modified, _)| *modified);
        let excess = logs.len() - self.max_files;
        for (_, path) in logs.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
    }
}

fn open_fresh_file(dir: &Path) -> anyhow::Result<(File, PathBuf)> {
    // Sortable timestamp name; millisecond suffix keeps rapid rotations distinct.
    let stamp = Local::now().format("%Y%m%d-%H%M%S%3f");
    let path = dir.join(format!("{FILE_PREFIX}{stamp}{FILE_SUFFIX}"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_dir(label: &str) -> PathBuf {
        let pid = std::process::id();
        let seq = TEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("kickoff-rotlog-test-{label}-{pid}-{seq}"));
        fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    fn log_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .expect("read dir")
            .flatten()
            .map(|e| e.path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn lines_carry_wall_clock_prefix() {
        let dir = test_dir("prefix");
        let mut log = RotatingLog::create(&dir).expect("create log");
        log.write_line("hello supervisor");
        log.close();

        let contents = fs::read_to_string(log.file_path()).expect("read log");
        let line = contents.lines().next().expect("one line");
        assert!(line.ends_with("hello supervisor"));
        // "YYYY-MM-DD HH:MM:SS " prefix is 20 bytes.
        assert_eq!(&line[4..5], "-");
        assert_eq!(&line[10..11], " ");
        assert_eq!(&line[13..14], ":");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn file_at_ceiling_rotates_on_next_write() {
        let dir = test_dir("rotate");
        let mut log = RotatingLog::with_limits(&dir, 64, 10).expect("create log");
        let first_path = log.file_path().to_path_buf();

        log.write_line("0123456789012345678901234567890123456789012");
        assert_eq!(log.file_path(), first_path, "under ceiling, no rotation");

        log.bytes_written = 64;
        assert_eq!(log.file_path(), first_path, "at ceiling, not yet rotated");

        std::thread::sleep(Duration::from_millis(5));
        log.write_line("next write rotates");
        assert_ne!(log.file_path(), first_path);
        assert_eq!(log_files(&dir).len(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn prune_keeps_newest_files() {
        let dir = test_dir("prune");
        for i in 0..4 {
            let path = dir.join(format!("kickoff-0000000{i}.log"));
            fs::write(&path, "old").expect("seed old log");
            // Distinct mtimes so oldest-first ordering is deterministic.
            std::thread::sleep(Duration::from_millis(5));
        }

        let log = RotatingLog::with_limits(&dir, 1024, 3).expect("create log");
        let files = log_files(&dir);
        assert_eq!(files.len(), 3);
        assert!(
            !files.iter().any(|p| p.ends_with("kickoff-00000000.log")),
            "oldest seeded file should be pruned"
        );
        assert!(files.contains(&log.file_path().to_path_buf()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unrelated_files_survive_pruning() {
        let dir = test_dir("unrelated");
        let keep = dir.join("notes.txt");
        fs::write(&keep, "keep me").expect("seed file");
        for i in 0..5 {
            fs::write(dir.join(format!("kickoff-1111111{i}.log")), "old").expect("seed log");
            std::thread::sleep(Duration::from_millis(5));
        }

        let _log = RotatingLog::with_limits(&dir, 1024, 2).expect("create log");
        assert!(keep.exists());
        let _ = fs::remove_dir_all(dir);
    }
}
