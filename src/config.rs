//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Restart-budget configuration (`R_MAX` within a rolling window `W`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Maximum automatic restarts allowed within `window_seconds`.
    #[serde(default = "default_restart_max")]
    pub max_restarts: u32,
    /// Rolling window, in seconds, over which `max_restarts` applies.
    #[serde(default = "default_restart_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_restart_max(),
            window_seconds: default_restart_window_seconds(),
        }
    }
}

const fn default_restart_max() -> u32 {
    3
}

const fn default_restart_window_seconds() -> u64 {
    300
}

/// Markdown stream buffer timing and size parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct MarkdownConfig {
    /// Hard inactivity flush window, in milliseconds (default ~2s).
    #[serde(default = "default_hard_inactivity_ms")]
    pub hard_inactivity_ms: u64,
    /// Soft inactivity flush window, in milliseconds (default ~200ms).
    #[serde(default = "default_soft_inactivity_ms")]
    pub soft_inactivity_ms: u64,
    /// Size ceiling, in bytes, for an accumulating fenced code block.
    #[serde(default = "default_code_size_ceiling")]
    pub code_size_ceiling_bytes: usize,
    /// Size ceiling, in bytes, for an accumulating non-block paragraph.
    #[serde(default = "default_paragraph_size_ceiling")]
    pub paragraph_size_ceiling_bytes: usize,
}

impl Default for MarkdownConfig {
    fn default() -> Self {
        Self {
            hard_inactivity_ms: default_hard_inactivity_ms(),
            soft_inactivity_ms: default_soft_inactivity_ms(),
            code_size_ceiling_bytes: default_code_size_ceiling(),
            paragraph_size_ceiling_bytes: default_paragraph_size_ceiling(),
        }
    }
}

const fn default_hard_inactivity_ms() -> u64 {
    2_000
}

const fn default_soft_inactivity_ms() -> u64 {
    200
}

const fn default_code_size_ceiling() -> usize {
    64 * 1024
}

const fn default_paragraph_size_ceiling() -> usize {
    4 * 1024
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Absolute workspace root handed to the agent subprocess as its working directory.
    pub workspace_root: PathBuf,
    /// Agent executable to spawn (e.g. a local build of an ACP-speaking agent).
    pub host_cli: String,
    /// Default arguments passed to `host_cli`.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Address the WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub http_bind_addr: String,
    /// Path to the `SQLite` database file. A relative path is resolved under `workspace_root`.
    #[serde(default = "default_db_file")]
    pub db_path: PathBuf,
    /// Agent subprocess startup timeout, in seconds.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Default timeout for a UI prompt with no caller-supplied value.
    #[serde(default = "default_ui_prompt_timeout_seconds")]
    pub ui_prompt_timeout_seconds: u64,
    /// Inter-prompt delay enforced before draining the next queued message.
    #[serde(default = "default_queue_drain_delay_seconds")]
    pub queue_drain_delay_seconds: u64,
    /// Automatic restart budget.
    #[serde(default)]
    pub restart: RestartConfig,
    /// Markdown stream buffer tuning.
    #[serde(default)]
    pub markdown: MarkdownConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_db_file() -> PathBuf {
    PathBuf::from("agent-relay.sqlite3")
}

const fn default_startup_timeout_seconds() -> u64 {
    10
}

const fn default_ui_prompt_timeout_seconds() -> u64 {
    300
}

const fn default_queue_drain_delay_seconds() -> u64 {
    2
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolved path to the `SQLite` database file.
    #[must_use]
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.workspace_root.join(&self.db_path)
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }

        if self.restart.max_restarts == 0 {
            return Err(AppError::Config(
                "restart.max_restarts must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host_cli() {
        let toml = r#"
            workspace_root = "."
            host_cli = ""
        "#;
        let err = GlobalConfig::from_toml_str(toml).expect_err("should fail validation");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn applies_defaults() {
        let toml = r#"
            workspace_root = "."
            host_cli = "echo"
        "#;
        let config = GlobalConfig::from_toml_str(toml).expect("valid config");
        assert_eq!(config.restart.max_restarts, 3);
        assert_eq!(config.markdown.hard_inactivity_ms, 2_000);
        assert_eq!(config.http_bind_addr, "127.0.0.1:8787");
    }

    #[test]
    fn resolves_relative_db_path_under_workspace_root() {
        let toml = r#"
            workspace_root = "."
            host_cli = "echo"
            db_path = "state.sqlite3"
        "#;
        let config = GlobalConfig::from_toml_str(toml).expect("valid config");
        assert!(config.resolved_db_path().ends_with("state.sqlite3"));
        assert!(config.resolved_db_path().is_absolute());
    }
}
