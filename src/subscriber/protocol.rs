//! Wire shapes for the client-facing WebSocket protocol: a `type` + `data`
//! envelope in both directions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::eventlog::Event;
use crate::session::ObserverEvent;

/// One outbound `type` + `data` frame.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: Value,
}

impl OutboundFrame {
    /// Construct a frame from any `Into<String>` type tag and JSON payload.
    pub fn new(frame_type: impl Into<String>, data: Value) -> Self {
        Self { frame_type: frame_type.into(), data }
    }

    /// Serialize to a JSON text frame body. Falls back to a generic error
    /// frame rather than panicking — every field here is already-valid JSON,
    /// so this can only fail on a pathological non-UTF-8 string, never in
    /// practice.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"on_error","data":{"message":"frame serialization failed"}}"#.to_owned())
    }
}

/// One inbound client message, tagged by `type` with payload under `data`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Request a page of history: `{limit?, before_seq?, after_seq?}`.
    LoadEvents {
        /// Maximum events to return; default 50, capped at 500.
        #[serde(default)]
        limit: Option<u32>,
        /// Pagination mode: request events older than this seq.
        #[serde(default)]
        before_seq: Option<i64>,
        /// Sync mode: request events newer than this seq.
        #[serde(default)]
        after_seq: Option<i64>,
    },
    /// Dispatch (or queue) a new prompt.
    Prompt {
        /// Message text.
        message: String,
        /// Caller-supplied idempotency id.
        prompt_id: String,
        /// Attached image identifiers.
        #[serde(default)]
        image_ids: Vec<String>,
        /// Attached file identifiers.
        #[serde(default)]
        file_ids: Vec<String>,
    },
    /// Interrupt the in-flight prompt.
    Cancel,
    /// Clear prompt state and the durable queue unconditionally.
    ForceReset,
    /// Answer a pending UI prompt.
    UiPromptAnswer {
        /// Id of the prompt being answered.
        request_id: String,
        /// Chosen option id.
        #[serde(default)]
        option_id: Option<String>,
        /// Chosen option's label.
        #[serde(default)]
        label: Option<String>,
    },
    /// Liveness probe carrying the client's last-seen watermark.
    Keepalive {
        /// Client-supplied clock reading, echoed back unchanged.
        client_time: i64,
        /// Largest seq the client has actually rendered.
        #[serde(default)]
        last_seen_seq: i64,
    },
}

/// Build the outbound frame for one persisted [`Event`] (used for historical
/// loads, as opposed to [`frame_for_observer_event`] for live dispatch).
#[must_use]
pub fn frame_for_event(event: &Event, is_prompting: bool) -> OutboundFrame {
    let mut data = event.data.clone();
    if let Value::Object(ref mut map) = data {
        map.insert("seq".to_owned(), json!(event.seq));
        if event.event_type.is_streaming() {
            map.insert("is_prompting".to_owned(), json!(is_prompting));
        }
    }
    OutboundFrame::new(event.event_type.to_string(), data)
}

/// Translate one Session-internal [`ObserverEvent`] into its wire frame.
#[must_use]
pub fn frame_for_observer_event(event: &ObserverEvent) -> OutboundFrame {
    match event {
        ObserverEvent::AgentMessage { seq, html, is_thought, is_prompting } => {
            let frame_type = if *is_thought { "agent_thought" } else { "agent_message" };
            OutboundFrame::new(frame_type, json!({ "seq": seq, "html": html, "is_prompting": is_prompting }))
        }
        ObserverEvent::Discrete { seq, event_type, data } => {
            let mut payload = data.clone();
            if let Value::Object(ref mut map) = payload {
                map.insert("seq".to_owned(), json!(seq));
            }
            OutboundFrame::new(event_type.to_string(), payload)
        }
        ObserverEvent::PromptComplete { event_count } => {
            OutboundFrame::new("prompt_complete", json!({ "event_count": event_count }))
        }
        ObserverEvent::AcpStopped { reason } => OutboundFrame::new("acp_stopped", json!({ "reason": reason })),
        ObserverEvent::UiPrompt(request) => {
            OutboundFrame::new("ui_prompt", serde_json::to_value(request).unwrap_or_default())
        }
        ObserverEvent::UiPromptDismiss { request_id, reason } => {
            OutboundFrame::new("ui_prompt_dismiss", json!({ "request_id": request_id, "reason": reason.as_str() }))
        }
        ObserverEvent::QueueMessageSending { id } => OutboundFrame::new("queue_message_sending", json!({ "id": id })),
        ObserverEvent::QueueMessageSent { id } => OutboundFrame::new("queue_message_sent", json!({ "id": id })),
        ObserverEvent::OnError { message } => OutboundFrame::new("on_error", json!({ "message": message })),
    }
}

/// The seq carried by a streaming or discrete event, for dedup purposes.
/// `None` for events that are never deduplicated (control frames).
#[must_use]
pub fn observer_event_seq(event: &ObserverEvent) -> Option<i64> {
    match event {
        ObserverEvent::AgentMessage { seq, .. } | ObserverEvent::Discrete { seq, .. } => Some(*seq),
        _ => None,
    }
}

/// Whether `event` follows the streaming (rather than discrete) dedup rule.
#[must_use]
pub fn observer_event_is_streaming(event: &ObserverEvent) -> bool {
    matches!(event, ObserverEvent::AgentMessage { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_events_parses_initial_mode() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type":"load_events","data":{}}"#).expect("parses");
        let InboundFrame::LoadEvents { limit, before_seq, after_seq } = frame else {
            panic!("expected LoadEvents");
        };
        assert_eq!(limit, None);
        assert_eq!(before_seq, None);
        assert_eq!(after_seq, None);
    }

    #[test]
    fn prompt_frame_parses_required_and_optional_fields() {
        let raw = r#"{"type":"prompt","data":{"message":"hi","prompt_id":"p1"}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).expect("parses");
        let InboundFrame::Prompt { message, prompt_id, image_ids, file_ids } = frame else {
            panic!("expected Prompt");
        };
        assert_eq!(message, "hi");
        assert_eq!(prompt_id, "p1");
        assert!(image_ids.is_empty());
        assert!(file_ids.is_empty());
    }

    #[test]
    fn discrete_observer_event_carries_its_seq_for_dedup() {
        let event = ObserverEvent::Discrete {
            seq: 7,
            event_type: crate::eventlog::EventType::ToolCall,
            data: json!({}),
        };
        assert_eq!(observer_event_seq(&event), Some(7));
        assert!(!observer_event_is_streaming(&event));
    }
}
