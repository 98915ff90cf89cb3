//! Wire-level JSON-RPC envelope types for the agent subprocess stream.
//!
//! The agent speaks line-delimited JSON-RPC 2.0 over its stdio. Three shapes
//! cross the wire: requests we send (`method` + `id`, expect a `result`),
//! notifications the agent sends (`method`, no `id`), and responses to our
//! requests (`id` + `result`/`error`, no `method`). A fourth, ACP-specific
//! shape is a request *from* the agent back to us (`method` + `id`, e.g.
//! `session/request_permission`) — we answer it with a response envelope of
//! our own.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outbound JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct OutboundRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: &'static str,
    pub params: Value,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(id: i64, method: &'static str, params: Value) -> Self {
        Self { jsonrpc: "2.0", id, method, params }
    }
}

/// An outbound JSON-RPC response, used to answer an agent-initiated request
/// such as `session/request_permission`.
#[derive(Debug, Serialize)]
pub struct OutboundResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

/// Loosely-typed inbound envelope: exactly one of `{method, result, error}`
/// meaningfully set, distinguishing notification / response / agent-request.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// What an [`InboundEnvelope`] turned out to be.
pub enum Inbound {
    /// A response to a request we sent, keyed by numeric id.
    Response { id: i64, result: Result<Value, Value> },
    /// A one-way notification from the agent.
    Notification { method: String, params: Value },
    /// A request from the agent that expects a response from us.
    AgentRequest { id: Value, method: String, params: Value },
}

/// Classify a raw [`InboundEnvelope`] into an [`Inbound`] variant.
///
/// Returns `None` for malformed envelopes that match none of the three
/// shapes (e.g. both `method` and `result` absent with no `id`).
#[must_use]
pub fn classify(envelope: InboundEnvelope) -> Option<Inbound> {
    match (envelope.id, envelope.method) {
        (Some(id), Some(method)) => Some(Inbound::AgentRequest {
            id,
            method,
            params: envelope.params.unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Some(Inbound::Notification {
            method,
            params: envelope.params.unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            let id = id.as_i64()?;
            let result = match envelope.error {
                Some(err) => Err(err),
                None => Ok(envelope.result.unwrap_or(Value::Null)),
            };
            Some(Inbound::Response { id, result })
        }
        (None, None) => None,
    }
}
