//! Domain types stored in the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of one logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A coalesced, rendered agent message fragment.
    AgentMessage,
    /// A coalesced, rendered agent "thinking" fragment.
    AgentThought,
    /// A tool invocation started by the agent.
    ToolCall,
    /// A status update for a previously-logged tool call.
    ToolUpdate,
    /// A plan/checklist update from the agent.
    Plan,
    /// A file read performed by the agent.
    FileRead,
    /// A file write performed by the agent.
    FileWrite,
    /// A message sent by the user (or drained from the queue).
    UserPrompt,
    /// A UI-prompt question/answer record.
    Permission,
    /// Marks the conversation as ended (never emitted on `server_shutdown`).
    SessionEnd,
}

impl EventType {
    /// Whether this event kind is a streaming (coalescing) type versus discrete.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::AgentMessage | Self::AgentThought)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::AgentMessage => "agent_message",
            Self::AgentThought => "agent_thought",
            Self::ToolCall => "tool_call",
            Self::ToolUpdate => "tool_update",
            Self::Plan => "plan",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::UserPrompt => "user_prompt",
            Self::Permission => "permission",
            Self::SessionEnd => "session_end",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "agent_message" => Self::AgentMessage,
            "agent_thought" => Self::AgentThought,
            "tool_call" => Self::ToolCall,
            "tool_update" => Self::ToolUpdate,
            "plan" => Self::Plan,
            "file_read" => Self::FileRead,
            "file_write" => Self::FileWrite,
            "user_prompt" => Self::UserPrompt,
            "permission" => Self::Permission,
            "session_end" => Self::SessionEnd,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record in one session's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotone, sparse, per-session sequence number.
    pub seq: i64,
    /// Owning session.
    pub session_id: String,
    /// The kind of event.
    pub event_type: EventType,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Type-specific structured payload.
    pub data: serde_json::Value,
}

impl Event {
    /// Construct a new event at the current time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, seq: i64, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            seq,
            session_id: session_id.into(),
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

pub(super) fn event_type_str(t: EventType) -> &'static str {
    t.as_str()
}

pub(super) fn parse_event_type(raw: &str) -> Option<EventType> {
    EventType::parse(raw)
}

/// Session lifecycle status recorded in [`SessionMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Conversation is live; an agent subprocess may or may not currently be running.
    Active,
    /// Conversation was closed for a reason other than explicit completion
    /// (e.g. `server_shutdown`) and is expected to resume.
    Suspended,
    /// Conversation ended explicitly; a `session_end` event was appended.
    Completed,
}

impl SessionStatus {
    pub(super) const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }

    pub(super) fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "active" => Self::Active,
            "suspended" => Self::Suspended,
            "completed" => Self::Completed,
            _ => return None,
        })
    }
}

/// Per-session record tracking seq authority and display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Unique session identifier.
    pub session_id: String,
    /// The agent command line used to spawn the subprocess.
    pub agent_command: String,
    /// Working directory handed to the agent subprocess.
    pub working_directory: String,
    /// Human-readable conversation name; empty until auto-titled (out of scope to generate).
    pub name: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Number of events ever appended.
    pub event_count: i64,
    /// Largest seq ever assigned. May exceed `event_count` due to coalescing.
    pub max_seq: i64,
    /// Agent-side session handle; may change across restarts.
    pub acp_session_id: Option<String>,
    /// Opaque map of boolean feature flags.
    pub advanced_settings: serde_json::Map<String, serde_json::Value>,
}

impl SessionMetadata {
    /// Construct fresh metadata for a brand-new session.
    #[must_use]
    pub fn new(session_id: impl Into<String>, agent_command: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_command: agent_command.into(),
            working_directory: working_directory.into(),
            name: String::new(),
            status: SessionStatus::Active,
            event_count: 0,
            max_seq: 0,
            acp_session_id: None,
            advanced_settings: serde_json::Map::new(),
        }
    }

    /// The seq authority rule: `next_seq := max(event_count, max_seq) + 1`, never less than 1.
    ///
    /// Using `event_count + 1` alone is a bug — sparse seqs from coalescing
    /// mean `max_seq` can exceed `event_count`, and reusing a seq after
    /// resume would violate the per-session strict-ordering invariant.
    #[must_use]
    pub fn next_seq(&self) -> i64 {
        self.event_count.max(self.max_seq) + 1
    }
}
