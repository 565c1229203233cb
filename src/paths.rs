//! Workspace `.ai` layout derivation shared by lock, logs, state, and shutdown.

use std::path::{Path, PathBuf};

/// Resolver for every file the supervisor reads or writes under a workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for runtime state (lock, stop marker, run state, supervisor logs).
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".ai").join("state")
    }

    /// Directory the Principal and Workers write their execution logs into.
    pub fn exe_logs_dir(&self) -> PathBuf {
        self.root.join(".ai").join("exe-logs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join("kickoff.lock")
    }

    pub fn stop_marker(&self) -> PathBuf {
        self.state_dir().join("STOP")
    }

    pub fn last_run(&self) -> PathBuf {
        self.state_dir().join("last_run.json")
    }

    pub fn project_config(&self) -> PathBuf {
        self.root.join(".ai").join("workflow.yml")
    }

    pub fn principal_log(&self) -> PathBuf {
        self.exe_logs_dir().join("principal.log")
    }

    pub fn worker_log(&self, issue_id: u64) -> PathBuf {
        self.exe_logs_dir().join(format!("issue-{issue_id}.worker.log"))
    }

    pub fn worker_pid_file(&self) -> PathBuf {
        self.state_dir().join("worker_pid.txt")
    }

    pub fn codex_pid_file(&self) -> PathBuf {
        self.state_dir().join("codex_pid.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_dot_ai() {
        let paths = WorkspacePaths::new("/work");
        assert_eq!(paths.lock_file(), PathBuf::from("/work/.ai/state/kickoff.lock"));
        assert_eq!(paths.stop_marker(), PathBuf::from("/work/.ai/state/STOP"));
        assert_eq!(paths.last_run(), PathBuf::from("/work/.ai/state/last_run.json"));
        assert_eq!(
            paths.principal_log(),
            PathBuf::from("/work/.ai/exe-logs/principal.log")
        );
    }

    #[test]
    fn worker_log_carries_issue_id() {
        let paths = WorkspacePaths::new("/work");
        assert_eq!(
            paths.worker_log(42),
            PathBuf::from("/work/.ai/exe-logs/issue-42.worker.log")
        );
    }
}
