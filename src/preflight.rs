//! Preflight checks and doctor-report assembly run before the Principal starts.

use crate::config::{AppConfig, ProjectConfig};
use crate::instance_lock::InstanceLock;
use crate::paths::WorkspacePaths;
use crate::tracker::run_with_deadline;
use portable_pty::{native_pty_system, PtySize};
use std::fmt::Display;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Bound on preflight subprocess probes (gh auth, git status).
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

impl CheckStatus {
    fn label(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warning => "warn",
            CheckStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn warning(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warning,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

/// Run all checks in order, stopping after the first hard failure. Warnings
/// accumulate and never abort.
pub fn run_preflight(config: &AppConfig, paths: &WorkspacePaths) -> Vec<CheckResult> {
    let mut results = Vec::new();
    let checks: Vec<fn(&AppConfig, &WorkspacePaths) -> CheckResult> = vec![
        check_lock_file,
        check_project_config,
        check_pty,
        check_stop_marker,
        check_principal_binary,
        check_gh_binary,
        check_gh_auth,
        check_working_tree,
    ];
    for check in checks {
        let result = check(config, paths);
        let failed = result.status == CheckStatus::Fail;
        results.push(result);
        if failed {
            break;
        }
    }
    results
}

pub fn first_failure(results: &[CheckResult]) -> Option<&CheckResult> {
    results
        .iter()
        .find(|result| result.status == CheckStatus::Fail)
}

fn check_lock_file(_config: &AppConfig, paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Lock File";
    let lock_path = paths.lock_file();
    if !lock_path.exists() {
        return CheckResult::pass(NAME, "not held");
    }
    match InstanceLock::read(&lock_path) {
        Some(info) if !InstanceLock::is_stale(&lock_path) => CheckResult::fail(
            NAME,
            format!(
                "held by live pid {} on {} since {}",
                info.pid, info.hostname, info.start_time
            ),
        ),
        Some(info) => CheckResult::pass(
            NAME,
            format!("stale lock from dead pid {}; will be reclaimed", info.pid),
        ),
        None => CheckResult::pass(NAME, "unparseable lock file; will be reclaimed"),
    }
}

fn check_project_config(_config: &AppConfig, paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Config";
    match ProjectConfig::load(&paths.project_config()) {
        Ok(project) => CheckResult::pass(NAME, format!("project \"{}\"", project.project)),
        Err(err) => CheckResult::fail(NAME, err.to_string()),
    }
}

fn check_pty(_config: &AppConfig, _paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "PTY";
    match native_pty_system().openpty(PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(_pair) => CheckResult::pass(NAME, "pseudo-terminal available"),
        Err(err) => CheckResult::warning(
            NAME,
            format!("pseudo-terminal unavailable ({err}); will fall back to pipes"),
        ),
    }
}

fn check_stop_marker(config: &AppConfig, paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Stop Marker";
    let marker = paths.stop_marker();
    if !marker.exists() {
        return CheckResult::pass(NAME, "absent");
    }
    if config.force_delete_stop {
        return match std::fs::remove_file(&marker) {
            Ok(()) => CheckResult::pass(NAME, "leftover marker removed"),
            Err(err) => CheckResult::fail(NAME, format!("failed to remove marker: {err}")),
        };
    }
    CheckResult::fail(
        NAME,
        format!(
            "{} exists from a previous shutdown; rerun with --force-delete-stop",
            marker.display()
        ),
    )
}

fn check_principal_binary(config: &AppConfig, _paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Principal";
    let argv = match config.principal_argv() {
        Ok(argv) => argv,
        Err(err) => return CheckResult::fail(NAME, err.to_string()),
    };
    let program = &argv[0];
    match find_in_path(program) {
        Some(found) => CheckResult::pass(NAME, format!("{} ({})", program, found.display())),
        None => CheckResult::fail(NAME, format!("`{program}` not found in PATH")),
    }
}

fn check_gh_binary(_config: &AppConfig, _paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "gh CLI";
    match find_in_path("gh") {
        Some(found) => CheckResult::pass(NAME, found.display().to_string()),
        None => CheckResult::fail(NAME, "`gh` not found in PATH"),
    }
}

fn check_gh_auth(_config: &AppConfig, paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Remote Auth";
    let mut command = Command::new("gh");
    command
        .current_dir(paths.root())
        .args(["auth", "status"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    match run_with_deadline(&mut command, PROBE_DEADLINE) {
        Ok(output) if output.exit_code == Some(0) => {
            CheckResult::pass(NAME, "gh auth status ok")
        }
        Ok(output) => CheckResult::fail(
            NAME,
            first_line_or(&output.stderr, "gh auth status reported failure"),
        ),
        Err(err) => CheckResult::fail(NAME, err.to_string()),
    }
}

fn check_working_tree(_config: &AppConfig, paths: &WorkspacePaths) -> CheckResult {
    const NAME: &str = "Working Tree";
    let mut command = Command::new("git");
    command
        .current_dir(paths.root())
        .args(["status", "--porcelain"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    match run_with_deadline(&mut command, PROBE_DEADLINE) {
        Ok(output) if output.exit_code == Some(0) => {
            let dirty = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
            if dirty == 0 {
                CheckResult::pass(NAME, "clean")
            } else {
                CheckResult::warning(NAME, format!("{dirty} uncommitted change(s)"))
            }
        }
        Ok(output) => CheckResult::warning(
            NAME,
            first_line_or(&output.stderr, "git status reported failure"),
        ),
        Err(err) => CheckResult::warning(NAME, err.to_string()),
    }
}

fn first_line_or(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Structured text report builder used by `--doctor` and `--dry-run` output.
pub struct PreflightReport {
    lines: Vec<String>,
}

impl PreflightReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Assemble the doctor report: environment info plus check outcomes.
pub fn render_report(config: &AppConfig, paths: &WorkspacePaths, results: &[CheckResult]) -> String {
    let mut report = PreflightReport::new("Kickoff Doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH));
    report.push_kv("workspace", paths.root().display());
    report.push_kv("session", config.session_id());

    report.section("Checks");
    for result in results {
        report.push_kv(result.name, format!("[{}] {}", result.status.label(), result.detail));
    }

    report.section("Paths");
    report.push_kv("lock", paths.lock_file().display());
    report.push_kv("stop_marker", paths.stop_marker().display());
    report.push_kv("run_state", paths.last_run().display());
    report.push_kv("principal_log", paths.principal_log().display());
    report.push_kv("debug_log", crate::log_file_path().display());

    report.render()
}
