//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Agent subprocess adapter failure: spawn, protocol framing, or write-after-close.
    Acp(String),
    /// The agent process disconnected (pipe closed, child exited) outside of a
    /// requested cancel. Distinguished from `Acp` so restart logic can match on it.
    AgentDisconnected(String),
    /// An agent RPC reported a timeout on the agent side.
    AgentTimeout(String),
    /// An agent RPC reported a rate-limit condition.
    RateLimited(String),
    /// The restart budget (`R_MAX` within `W`) has been exhausted.
    RestartBudgetExhausted(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// A session operation was attempted while another was already in flight
    /// (e.g. `prompt()` while `is_prompting`).
    Conflict(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Malformed or unexpected JSON payload.
    Json(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::AgentDisconnected(msg) => write!(f, "agent disconnected: {msg}"),
            Self::AgentTimeout(msg) => write!(f, "agent timeout: {msg}"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::RestartBudgetExhausted(msg) => write!(f, "restart budget exhausted: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Json(msg) => write!(f, "json: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Categorize a raw agent-reported error string into a stable, user-facing
/// bucket. Mirrors the pattern-match classification called for by the error
/// handling design: timeouts, rate limits, and cancellation each get their
/// own user message rather than a raw protocol string.
#[must_use]
pub fn classify_agent_error(raw: &str) -> AppError {
    let lowered = raw.to_ascii_lowercase();
    if lowered.contains("cancel") {
        AppError::Conflict(raw.to_owned())
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        AppError::AgentTimeout(raw.to_owned())
    } else if lowered.contains("rate limit") || lowered.contains("rate-limit") {
        AppError::RateLimited(raw.to_owned())
    } else if lowered.contains("disconnect")
        || lowered.contains("broken pipe")
        || lowered.contains("connection reset")
    {
        AppError::AgentDisconnected(raw.to_owned())
    } else {
        AppError::Acp(raw.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeout() {
        assert!(matches!(
            classify_agent_error("operation timed out"),
            AppError::AgentTimeout(_)
        ));
    }

    #[test]
    fn classifies_rate_limit() {
        assert!(matches!(
            classify_agent_error("429 rate limit exceeded"),
            AppError::RateLimited(_)
        ));
    }

    #[test]
    fn classifies_cancellation_as_conflict_not_error() {
        assert!(matches!(
            classify_agent_error("request cancelled by user"),
            AppError::Conflict(_)
        ));
    }

    #[test]
    fn falls_back_to_acp() {
        assert!(matches!(
            classify_agent_error("something weird happened"),
            AppError::Acp(_)
        ));
    }
}
