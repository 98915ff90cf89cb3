//! Shared types crossing the Session / Observer / Subscriber boundary.

use serde::{Deserialize, Serialize};

use crate::eventlog::EventType;

/// Metadata accompanying a user-originated prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptMeta {
    /// The message text to send to the agent.
    pub message_text: String,
    /// Identifier of the sending client or queue worker.
    pub sender_id: String,
    /// Caller-supplied idempotency id for this prompt.
    pub prompt_id: String,
    /// Attached image identifiers (upload itself is out of scope).
    #[serde(default)]
    pub image_ids: Vec<String>,
    /// Attached file identifiers (upload itself is out of scope).
    #[serde(default)]
    pub file_ids: Vec<String>,
}

/// A persisted prompt waiting to be dispatched once the Session goes idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique queue entry id.
    pub id: String,
    /// The message text to send.
    pub message_text: String,
    /// Attached image identifiers.
    pub image_ids: Vec<String>,
    /// Attached file identifiers.
    pub file_ids: Vec<String>,
    /// Identifier of the client that enqueued this message.
    pub sender_id: String,
    /// When the message was enqueued.
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// The kind of UI prompt being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiPromptKind {
    /// A yes/no confirmation.
    YesNo,
    /// A tool permission request.
    Permission,
    /// A free-form multiple-choice selection.
    Select,
}

/// One selectable option in a [`UiPromptRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiPromptOption {
    /// Stable option identifier returned in the answer.
    pub option_id: String,
    /// Human-readable label.
    pub label: String,
}

/// An agent-initiated or tool-originated question blocking on a UI answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiPromptRequest {
    /// Correlates the request with its eventual response.
    pub request_id: String,
    /// The kind of question being asked.
    pub kind: UiPromptKind,
    /// The question text.
    pub question: String,
    /// Selectable options.
    pub options: Vec<UiPromptOption>,
    /// Seconds to wait before timing out. Default 300 if zero.
    pub timeout_seconds: u64,
    /// Whether the agent is blocked awaiting this answer.
    pub blocking: bool,
}

/// The operator's answer to a [`UiPromptRequest`], or a timeout marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiPromptResponse {
    /// Echoes the request id being answered.
    pub request_id: String,
    /// The chosen option id, absent on timeout.
    pub option_id: Option<String>,
    /// The chosen option's label, absent on timeout.
    pub label: Option<String>,
    /// Whether this response represents a timeout rather than a real answer.
    pub timed_out: bool,
}

/// Why a UI prompt was dismissed without a normal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    /// A newer `ui_prompt` call replaced this one.
    Replaced,
    /// The timeout elapsed.
    Timeout,
    /// `cancel()` was called (e.g. the user hit Stop).
    Cancelled,
}

impl DismissReason {
    /// Stable wire string for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything a live observer (typically one WebSocket) can be notified of.
///
/// This is the Session-internal vocabulary; the subscriber layer translates
/// it into the wire `type` + `data` envelope described in the external
/// interfaces.
#[derive(Debug)]
pub enum ObserverEvent {
    /// A coalesced agent-message or agent-thought HTML fragment.
    AgentMessage {
        /// Seq of the first contributing chunk.
        seq: i64,
        /// Rendered HTML.
        html: String,
        /// Whether this fragment is the agent's reasoning ("thought") rather
        /// than its reply.
        is_thought: bool,
        /// Whether the Session is still prompting.
        is_prompting: bool,
    },
    /// A discrete event (tool call, tool update, plan, file op, user prompt, permission).
    Discrete {
        /// Assigned seq.
        seq: i64,
        /// The event kind.
        event_type: EventType,
        /// Structured payload.
        data: serde_json::Value,
    },
    /// The current prompt attempt has concluded.
    PromptComplete {
        /// Total events ever appended, snapshotted at completion.
        event_count: i64,
    },
    /// The agent subprocess stopped; `reason` distinguishes shutdown-suspend
    /// from a real close.
    AcpStopped {
        /// Human-readable stop reason.
        reason: String,
    },
    /// A blocking UI prompt has been issued (or replayed on connect).
    UiPrompt(UiPromptRequest),
    /// A previously-issued UI prompt was dismissed without a normal answer.
    UiPromptDismiss {
        /// The dismissed request's id.
        request_id: String,
        /// Why it was dismissed.
        reason: DismissReason,
    },
    /// The oldest queued message is about to be dispatched.
    QueueMessageSending {
        /// Queue entry id.
        id: String,
    },
    /// A queued message finished dispatching.
    QueueMessageSent {
        /// Queue entry id.
        id: String,
    },
    /// A non-fatal, user-facing error occurred.
    OnError {
        /// Human-readable message.
        message: String,
    },
}
