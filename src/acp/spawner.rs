//! ACP agent process spawner.
//!
//! Spawns headless agent processes with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist so secrets in the server's own
//!   environment never leak into the child.
//! - A configurable startup timeout: if the agent does not emit its ready
//!   signal (first stdout line) within the window, the process is killed and
//!   `AppError::Acp("startup timeout")` is returned.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{AppError, Result};

use super::adapter::AgentNotification;

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the server's environment is stripped via
/// `env_clear()` before the child is launched. Database paths and other
/// server-side secrets are therefore never visible to the agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for spawning an ACP agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Host CLI binary (e.g., `claude`, `gh`, `python`).
    pub host_cli: String,
    /// Default arguments passed to the host CLI before the prompt.
    pub host_cli_args: Vec<String>,
    /// Workspace root directory; the child process starts in this directory.
    pub workspace_root: PathBuf,
    /// Maximum time to wait for the agent's ready signal (first stdout line).
    ///
    /// If no line is received within this window the spawner kills the
    /// process and returns `AppError::Acp("startup timeout …")`.
    pub startup_timeout: Duration,
}

// ── Connection handle ────────────────────────────────────────────────────────

/// Active stdio connection to a spawned ACP agent process.
#[derive(Debug)]
pub struct AcpConnection {
    /// Session identifier that the process was launched for.
    pub session_id: String,
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for sending JSON-RPC messages to the agent.
    pub stdin: ChildStdin,
    /// Buffered reader over the agent's stdout for line-by-line NDJSON parsing.
    pub stdout: BufReader<ChildStdout>,
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn an ACP agent process and wait for its ready signal.
///
/// The initial prompt is **not** passed as a CLI argument. It is sent over
/// the stream via [`crate::acp::adapter::AgentAdapter::prompt`] after
/// `initialize`/`new_session` (or `load_session`) completes.
///
/// # Errors
///
/// - `AppError::Acp("failed to spawn agent: …")` — OS spawn failure.
/// - `AppError::Acp("startup timeout …")` — no ready line within the window.
/// - `AppError::Acp("agent process exited before ready signal")` — early EOF.
pub async fn spawn_agent(config: &SpawnConfig, session_id: &str) -> Result<AcpConnection> {
    let mut cmd = Command::new(&config.host_cli);

    for arg in &config.host_cli_args {
        cmd.arg(arg);
    }

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    cmd.env("AGENT_RELAY_SESSION_ID", session_id);

    cmd.current_dir(&config.workspace_root)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| AppError::Acp(format!("failed to spawn agent: {err}")))?;

    let stdin = child.stdin.take().ok_or_else(|| AppError::Acp("failed to capture agent stdin".into()))?;
    let stdout_raw = child.stdout.take().ok_or_else(|| AppError::Acp("failed to capture agent stdout".into()))?;

    let mut reader = BufReader::new(stdout_raw);
    let mut line = String::new();

    match tokio::time::timeout(config.startup_timeout, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {
            info!(session_id, ready_line = line.trim(), "agent emitted ready signal");
        }
        Ok(Ok(_)) => {
            return Err(AppError::Acp("agent process exited before ready signal".into()));
        }
        Ok(Err(err)) => {
            return Err(AppError::Acp(format!("failed to read agent ready signal: {err}")));
        }
        Err(_elapsed) => {
            child.kill().await.ok();
            return Err(AppError::Acp(format!(
                "startup timeout: agent did not emit ready signal within {:?}",
                config.startup_timeout
            )));
        }
    }

    Ok(AcpConnection { session_id: session_id.to_owned(), child, stdin, stdout: reader })
}

// ── Exit monitor ─────────────────────────────────────────────────────────────

/// Spawn a background task that awaits child-process exit and emits
/// [`AgentNotification::ProcessExited`] when it happens.
///
/// Respects `cancel`: when the token fires the task exits without emitting a
/// notification, since the caller is already tearing things down in order.
#[must_use]
pub fn monitor_exit(
    session_id: String,
    mut child: Child,
    notify_tx: mpsc::Sender<AgentNotification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let (exit_code, reason) = match result {
                    Ok(status) => {
                        let code = status.code();
                        let reason = code.map_or_else(
                            || "process terminated by signal".to_owned(),
                            |c| format!("process exited with code {c}"),
                        );
                        (code, reason)
                    }
                    Err(err) => {
                        warn!(session_id, %err, "error waiting for agent child process");
                        (None, format!("wait error: {err}"))
                    }
                };

                if notify_tx.send(AgentNotification::ProcessExited { exit_code, reason }).await.is_err() {
                    warn!(session_id, "notify_tx closed before ProcessExited could be delivered");
                }
            }
            () = cancel.cancelled() => {
                info!(session_id, "monitor_exit: cancellation received, exiting monitor");
            }
        }
    })
}
