//! Configuration for the ticket orchestrator.
//!
//! Loaded once at startup from a TOML file and passed by reference into every
//! component. Precedence: CLI flags > environment > config file > defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TICKETD_CONFIG";

/// Environment variable overriding `board.token`.
pub const BOARD_TOKEN_ENV: &str = "TICKETD_BOARD_TOKEN";

/// Environment variable overriding `board.url`.
pub const BOARD_URL_ENV: &str = "TICKETD_BOARD_URL";

/// Default maximum concurrent jobs.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("missing required setting: {0}")]
    Missing(String),
}

/// Board column names used as queues and as result statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusNames {
    /// Queue of tickets waiting for a review job.
    pub review: String,
    /// Queue of tickets waiting for an execute job.
    pub execute: String,
    pub in_progress: String,
    pub scored: String,
    pub done: String,
    pub failed: String,
}

impl Default for StatusNames {
    fn default() -> Self {
        Self {
            review: "To Review".to_string(),
            execute: "To Execute".to_string(),
            in_progress: "In Progress".to_string(),
            scored: "Scored".to_string(),
            done: "Done".to_string(),
            failed: "Failed".to_string(),
        }
    }
}

/// Connection settings for the HTTP board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_sec: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_sec: 30,
        }
    }
}

/// A registered repository that tickets can target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Absolute path to the git repository.
    pub path: PathBuf,
    /// Shell command run inside the workspace before any push.
    pub build_command: Option<String>,
    /// Overrides the detected default branch.
    pub base_branch: Option<String>,
    /// Glob patterns an execute job must never modify.
    pub blocked_files: Vec<String>,
    pub skip_pr: bool,
    /// Lets the agent run local dev servers and loopback HTTP calls.
    pub dev_access: bool,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Scheduling
    pub max_concurrent: usize,
    pub poll_interval_sec: u64,
    pub stale_lock_timeout_sec: u64,
    pub shutdown_timeout_sec: u64,
    pub shutdown_poll_sec: u64,

    // Agent runtime
    pub model: String,
    pub agent_bin: PathBuf,
    /// Hard kill timer per agent session in seconds (0 = none).
    pub agent_timeout_sec: u64,
    pub review_max_turns: u32,
    pub review_max_budget_usd: f64,
    pub execute_max_turns: u32,
    pub execute_max_budget_usd: f64,

    // Execute pipeline
    pub build_timeout_sec: u64,
    pub branch_prefix: String,

    // Transcript logs
    pub log_dir: PathBuf,

    pub board: BoardConfig,
    pub statuses: StatusNames,
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval_sec: 30,
            stale_lock_timeout_sec: 30 * 60,
            shutdown_timeout_sec: 5 * 60,
            shutdown_poll_sec: 5,
            model: "sonnet".to_string(),
            agent_bin: PathBuf::from("claude"),
            agent_timeout_sec: 0,
            review_max_turns: 30,
            review_max_budget_usd: 2.0,
            execute_max_turns: 120,
            execute_max_budget_usd: 10.0,
            build_timeout_sec: 600,
            branch_prefix: "ticket".to_string(),
            log_dir: dirs::data_local_dir().map_or_else(
                || PathBuf::from(".ticketd/logs"),
                |d| d.join("ticketd").join("logs"),
            ),
            board: BoardConfig::default(),
            statuses: StatusNames::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Parse config content in TOML format.
    pub fn from_toml(content: &str, source: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: source.to_string(),
            message: e.to_string(),
        })
    }

    /// Default config location: `$TICKETD_CONFIG`, else `<config dir>/ticketd/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ticketd")
            .join("config.toml")
    }

    /// Apply environment overrides for board credentials.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(BOARD_TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.board.token = Some(token);
            }
        }
        if let Ok(url) = std::env::var(BOARD_URL_ENV) {
            if !url.trim().is_empty() {
                self.board.url = Some(url);
            }
        }
    }

    /// Check invariants that would otherwise surface mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_sec == 0 {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval_sec".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "branch_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for (name, project) in &self.projects {
            if !project.path.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    key: format!("projects.{name}.path"),
                    message: format!("must be absolute, got {}", project.path.display()),
                });
            }
            for pattern in &project.blocked_files {
                if let Err(e) = glob::Pattern::new(pattern) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("projects.{name}.blocked_files"),
                        message: format!("bad glob {pattern:?}: {e}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Require board credentials. Missing credentials are a fatal startup error.
    pub fn require_board(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .board
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing(format!("board.url (or {BOARD_URL_ENV})")))?;
        let token = self
            .board
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing(format!("board.token (or {BOARD_TOKEN_ENV})")))?;
        Ok((url, token))
    }

    /// Registry view over the configured projects.
    pub fn registry(&self) -> ProjectRegistry<'_> {
        ProjectRegistry {
            projects: &self.projects,
        }
    }
}

/// Read-only lookup of project settings by name.
#[derive(Debug, Clone, Copy)]
pub struct ProjectRegistry<'a> {
    projects: &'a BTreeMap<String, ProjectConfig>,
}

impl<'a> ProjectRegistry<'a> {
    pub fn get(&self, name: &str) -> Option<&'a ProjectConfig> {
        self.projects.get(name)
    }

    pub fn project_dir(&self, name: &str) -> Option<&'a Path> {
        self.get(name).map(|p| p.path.as_path())
    }

    pub fn build_command(&self, name: &str) -> Option<&'a str> {
        self.get(name)
            .and_then(|p| p.build_command.as_deref())
            .filter(|c| !c.trim().is_empty())
    }

    pub fn base_branch(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|p| p.base_branch.as_deref())
    }

    pub fn blocked_files(&self, name: &str) -> &'a [String] {
        self.get(name).map_or(&[], |p| p.blocked_files.as_slice())
    }

    pub fn skip_pr(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.skip_pr)
    }

    pub fn dev_access(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.dev_access)
    }

    /// Registered project names, sorted.
    pub fn project_names(&self) -> Vec<&'a str> {
        self.projects.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
max_concurrent = 2
poll_interval_sec = 10

[board]
url = "https://board.example.com/api"
token = "secret"

[statuses]
review = "Backlog"

[projects.Alpha]
path = "/tmp/alpha"
build_command = "cargo build"
blocked_files = ["*.lock", ".github/**"]

[projects.Beta]
path = "/tmp/beta"
skip_pr = true
dev_access = true
base_branch = "develop"
"#;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.poll_interval_sec, 30);
        assert_eq!(config.stale_lock_timeout_sec, 1800);
        assert_eq!(config.shutdown_timeout_sec, 300);
        assert_eq!(config.branch_prefix, "ticket");
        assert_eq!(config.statuses.scored, "Scored");
        assert_eq!(config.statuses.failed, "Failed");
        assert!(config.projects.is_empty());
    }

    #[test]
    fn parses_toml_and_keeps_defaults() {
        let config = Config::from_toml(SAMPLE, "sample").unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.poll_interval_sec, 10);
        assert_eq!(config.stale_lock_timeout_sec, 1800);
        assert_eq!(config.statuses.review, "Backlog");
        assert_eq!(config.statuses.execute, "To Execute");
        assert_eq!(config.projects.len(), 2);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.board.token.as_deref(), Some("secret"));
        assert_eq!(config.board.timeout_sec, 30);
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let result = Config::from_file(Path::new("/nonexistent/ticketd.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let result = Config::from_toml("max_concurrent = \"many\"", "inline");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn registry_lookups() {
        let config = Config::from_toml(SAMPLE, "sample").unwrap();
        let registry = config.registry();

        assert_eq!(registry.project_dir("Alpha"), Some(Path::new("/tmp/alpha")));
        assert_eq!(registry.build_command("Alpha"), Some("cargo build"));
        assert_eq!(registry.build_command("Beta"), None);
        assert_eq!(registry.base_branch("Beta"), Some("develop"));
        assert_eq!(registry.blocked_files("Alpha").len(), 2);
        assert!(registry.blocked_files("Bogus").is_empty());
        assert!(registry.skip_pr("Beta"));
        assert!(!registry.skip_pr("Alpha"));
        assert!(registry.dev_access("Beta"));
        assert_eq!(registry.project_names(), vec!["Alpha", "Beta"]);
        assert!(registry.project_dir("Bogus").is_none());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "max_concurrent"
        ));
    }

    #[test]
    fn validate_rejects_relative_project_path() {
        let mut config = Config::default();
        config.projects.insert(
            "Rel".to_string(),
            ProjectConfig {
                path: PathBuf::from("relative/repo"),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_glob() {
        let mut config = Config::default();
        config.projects.insert(
            "Alpha".to_string(),
            ProjectConfig {
                path: PathBuf::from("/tmp/alpha"),
                blocked_files: vec!["[unclosed".to_string()],
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn require_board_reports_missing_token() {
        let mut config = Config::default();
        config.board.url = Some("https://board.example.com".to_string());
        let err = config.require_board().unwrap_err();
        assert!(err.to_string().contains("board.token"));
    }
}
