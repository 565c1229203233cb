//! CLI flag schema and project config loading so startup behavior is explicit.

use clap::Parser;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_PRINCIPAL_CMD: &str = "claude";

/// Supervisor CLI configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kickoff",
    version,
    about = "Workflow kickoff supervisor for Claude-driven coding sessions",
    next_line_help = false
)]
pub struct AppConfig {
    /// Workspace root containing the .ai directory.
    #[arg(long, default_value = ".", value_name = "DIR")]
    pub workspace: PathBuf,

    /// Principal command line (program plus arguments, shell-quoted).
    #[arg(long, value_name = "CMD", env = "KICKOFF_PRINCIPAL_CMD")]
    pub principal_cmd: Option<String>,

    /// Session identifier threaded into worker progress markers.
    #[arg(long, value_name = "ID")]
    pub session_id: Option<String>,

    /// Resume the previous run without prompting.
    #[arg(long)]
    pub resume: bool,

    /// Discard any previous run state without prompting.
    #[arg(long)]
    pub fresh: bool,

    /// Delete a leftover STOP marker instead of failing preflight.
    #[arg(long)]
    pub force_delete_stop: bool,

    /// Print the doctor report and exit.
    #[arg(long)]
    pub doctor: bool,

    /// Run preflight checks and exit without starting the Principal.
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug/trace logging to temp files.
    #[arg(long)]
    pub logs: bool,

    /// Disable all optional logging, overriding --logs.
    #[arg(long)]
    pub no_logs: bool,
}

impl AppConfig {
    /// Validate flag combinations and fill derived defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.resume && self.fresh {
            return Err(ConfigError::Invalid {
                field: "--resume/--fresh".to_string(),
                reason: "flags are mutually exclusive".to_string(),
            });
        }
        if self.session_id.is_none() {
            self.session_id = Some(default_session_id());
        }
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or("")
    }

    /// Principal argv: the configured command line or the default, split with
    /// shell quoting rules.
    pub fn principal_argv(&self) -> Result<Vec<String>, ConfigError> {
        let raw = self
            .principal_cmd
            .as_deref()
            .unwrap_or(DEFAULT_PRINCIPAL_CMD);
        let argv = shell_words::split(raw).map_err(|e| ConfigError::Invalid {
            field: "--principal-cmd".to_string(),
            reason: e.to_string(),
        })?;
        if argv.is_empty() {
            return Err(ConfigError::Missing {
                field: "--principal-cmd".to_string(),
            });
        }
        Ok(argv)
    }
}

fn default_session_id() -> String {
    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("kickoff-{epoch_secs}")
}

/// Configuration problem that refuses startup, surfaced with the failing field.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: {field} is required")]
    Missing { field: String },
    #[error("config: {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Yaml(#[from] serde_norway::Error),
}

/// Kind of project the workflow drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    Monorepo,
    SingleRepo,
}

/// How a repo entry is attached to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Root,
    Directory,
    Submodule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type")]
    pub repo_type: RepoType,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_dispatch: Option<String>,
    #[serde(default)]
    pub post_complete: Option<String>,
}

/// Project-level workflow configuration from `.ai/workflow.yml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project: String,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub integration_branch: String,
    #[serde(default)]
    pub release_branch: Option<String>,
    #[serde(default)]
    pub commit_format: Option<String>,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ProjectConfig = serde_norway::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "project".to_string(),
            });
        }
        if self.integration_branch.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "integration_branch".to_string(),
            });
        }
        for (index, repo) in self.repos.iter().enumerate() {
            let context = format!("repos[{index}]");
            if repo.name.trim().is_empty() {
                return Err(ConfigError::Missing {
                    field: format!("{context}.name"),
                });
            }
            if repo.path.trim().is_empty() {
                return Err(ConfigError::Missing {
                    field: format!("{context}.path"),
                });
            }
            if repo.repo_type == RepoType::Root && repo.path != "." && repo.path != "./" {
                return Err(ConfigError::Invalid {
                    field: format!("{context}.path"),
                    reason: "type=root requires path \".\" or \"./\"".to_string(),
                });
            }
            if has_parent_traversal(&repo.path) {
                return Err(ConfigError::Invalid {
                    field: format!("{context}.path"),
                    reason: "path traversal is not allowed".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn has_parent_traversal(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> AppConfig {
        AppConfig::parse_from(args)
    }

    const MINIMAL_YAML: &str = r#"
project: demo
type: single-repo
integration_branch: develop
repos:
  - name: demo
    path: "."
    type: root
    language: rust
    build_command: cargo build
    test_command: cargo test
"#;

    #[test]
    fn resume_and_fresh_conflict() {
        let mut cfg = parse_args(&["kickoff", "--resume", "--fresh"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_id_defaults_when_missing() {
        let mut cfg = parse_args(&["kickoff"]);
        cfg.validate().expect("valid");
        assert!(cfg.session_id().starts_with("kickoff-"));
    }

    #[test]
    fn principal_argv_splits_quoted_command() {
        let mut cfg = parse_args(&["kickoff", "--principal-cmd", "claude --project 'my proj'"]);
        cfg.validate().expect("valid");
        let argv = cfg.principal_argv().expect("argv");
        assert_eq!(argv, vec!["claude", "--project", "my proj"]);
    }

    #[test]
    fn principal_argv_defaults_to_claude() {
        let cfg = parse_args(&["kickoff"]);
        assert_eq!(cfg.principal_argv().expect("argv"), vec!["claude"]);
    }

    #[test]
    fn empty_principal_cmd_is_missing() {
        let cfg = parse_args(&["kickoff", "--principal-cmd", "  "]);
        assert!(matches!(
            cfg.principal_argv(),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn minimal_project_config_parses_and_validates() {
        let config: ProjectConfig = serde_norway::from_str(MINIMAL_YAML).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.project, "demo");
        assert_eq!(config.project_type, ProjectType::SingleRepo);
        assert_eq!(config.repos[0].repo_type, RepoType::Root);
    }

    #[test]
    fn missing_project_name_is_rejected() {
        let yaml = MINIMAL_YAML.replace("project: demo", "project: \"\"");
        let config: ProjectConfig = serde_norway::from_str(&yaml).expect("parse");
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("project"));
    }

    #[test]
    fn missing_integration_branch_is_rejected() {
        let yaml = MINIMAL_YAML.replace("integration_branch: develop", "integration_branch: \"\"");
        let config: ProjectConfig = serde_norway::from_str(&yaml).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn root_repo_requires_dot_path() {
        let yaml = MINIMAL_YAML.replace("path: \".\"", "path: \"src\"");
        let config: ProjectConfig = serde_norway::from_str(&yaml).expect("parse");
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("type=root"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let yaml = MINIMAL_YAML
            .replace("path: \".\"", "path: \"../outside\"")
            .replace("type: root", "type: directory");
        let config: ProjectConfig = serde_norway::from_str(&yaml).expect("parse");
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn dot_dot_inside_segments_is_rejected() {
        let yaml = MINIMAL_YAML
            .replace("path: \".\"", "path: \"a/../b\"")
            .replace("type: root", "type: directory");
        let config: ProjectConfig = serde_norway::from_str(&yaml).expect("parse");
        assert!(config.validate().is_err());
    }
}
