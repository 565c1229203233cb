//! Durable run state so an interrupted kickoff can resume where it stopped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// State considered stale after this long; stale state is never auto-resumed.
const STALE_AFTER_HOURS: i64 = 24;

/// Snapshot of a run, persisted after each phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub phase: String,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub pending_tasks: Vec<String>,
    #[serde(default)]
    pub issues_in_progress: Vec<u64>,
    #[serde(default = "epoch")]
    pub saved_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl RunState {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            completed_tasks: Vec::new(),
            pending_tasks: Vec::new(),
            issues_in_progress: Vec::new(),
            saved_at: epoch(),
        }
    }
}

/// Atomic persister for [`RunState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, stamping `saved_at` with the current wall clock.
    ///
    /// Writes a `.tmp` sibling, removes any existing target, then renames.
    /// The pre-remove keeps rename working on hosts that refuse to rename
    /// over an existing file; the instance lock prevents concurrent writers.
    pub fn save(&self, state: &RunState) -> anyhow::Result<()> {
        let mut stamped = state.clone();
        stamped.saved_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&stamped)?)?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<RunState> {
        let contents = fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&contents)?;
        Ok(state)
    }

    /// True iff the file exists, parses, and carries a non-epoch `saved_at`.
    pub fn has_valid_state(&self) -> bool {
        match self.load() {
            Ok(state) => state.saved_at > epoch(),
            Err(_) => false,
        }
    }

    /// True iff the state is valid and older than 24 hours. Exactly 24 hours
    /// old is not yet stale.
    pub fn is_stale(&self) -> bool {
        match self.load() {
            Ok(state) if state.saved_at > epoch() => {
                Utc::now().signed_duration_since(state.saved_at)
                    > Duration::hours(STALE_AFTER_HOURS)
            }
            _ => false,
        }
    }

    /// Remove the state file; a missing file is a no-op.
    pub fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
