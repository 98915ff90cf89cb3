//! Protocol-agnostic-in-spirit, ACP-concrete agent subprocess adapter.
//!
//! [`AgentAdapter`] is the seam the Session programs against: four async
//! capabilities (`initialize`, `new_session`, `load_session`, `prompt`) plus
//! `cancel`, with incoming notifications delivered out-of-band on a channel
//! handed to the adapter at construction. Mirrors the host project's
//! `AgentDriver` trait shape (`Pin<Box<dyn Future<...> + Send + '_>>`
//! methods on a plain trait object) rather than pulling in `async-trait`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{AppError, Result};

use super::protocol::{classify, Inbound, InboundEnvelope, OutboundRequest, OutboundResponse};
use super::spawner::{self, AcpConnection, SpawnConfig};
use super::{reader, writer};

/// One notification pushed by the agent, classified by ACP method name.
#[derive(Debug, Clone)]
pub enum AgentNotification {
    /// `agent_message_chunk`: a fragment of the agent's streamed reply.
    AgentMessageChunk { text: String },
    /// `agent_thought_chunk`: a fragment of the agent's streamed reasoning.
    AgentThoughtChunk { text: String },
    /// `tool_call`: a new tool invocation was started.
    ToolCall { data: Value },
    /// `tool_call_update`: progress or completion of an existing tool call.
    ToolCallUpdate { data: Value },
    /// `plan`: the agent published or revised its plan.
    Plan { data: Value },
    /// `session/request_permission`: the agent is blocked awaiting a yes/no
    /// or choice answer. `id` must be echoed back via
    /// [`AgentAdapter::respond_permission`].
    RequestPermission { id: Value, data: Value },
    /// `available_commands_updated`: the agent's command palette changed.
    AvailableCommandsUpdated { data: Value },
    /// `current_mode_updated`: the agent switched operating modes.
    CurrentModeUpdated { data: Value },
    /// An ACP method this core does not interpret. Recorded as a no-op.
    Unrecognized { method: String },
    /// The child process exited or its stdout stream closed.
    ProcessExited { exit_code: Option<i32>, reason: String },
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The Session's view of an agent subprocess: four lifecycle RPCs plus
/// cancellation. Implementations deliver notifications on the channel
/// supplied at construction rather than through this trait.
pub trait AgentAdapter: Send + Sync {
    /// Perform the ACP `initialize` handshake.
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    /// Ask the agent to create a fresh session, returning its `acp_session_id`.
    fn new_session(&self) -> BoxFuture<'_, Result<String>>;

    /// Ask the agent to resume a previously created session.
    fn load_session(&self, acp_session_id: &str) -> BoxFuture<'_, Result<()>>;

    /// Send a prompt (already-assembled content blocks) and await the
    /// agent's stop reason. Notifications streamed while the prompt is in
    /// flight arrive separately on the notification channel.
    fn prompt(&self, blocks: Value) -> BoxFuture<'_, Result<Value>>;

    /// Best-effort interrupt of the current prompt.
    fn cancel(&self) -> BoxFuture<'_, Result<()>>;

    /// Answer an outstanding `session/request_permission` agent-request.
    fn respond_permission(&self, id: Value, outcome: Value) -> BoxFuture<'_, Result<()>>;

    /// Tail of the agent's stderr, for attaching to error reports.
    fn stderr_tail(&self) -> String;
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Value, Value>>>>>;

/// Concrete [`AgentAdapter`] speaking ACP over a spawned child process's stdio.
pub struct AcpAdapter {
    session_id: String,
    to_agent: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicI64,
    cancel_token: CancellationToken,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    _writer_task: JoinHandle<Result<()>>,
    _reader_task: JoinHandle<()>,
    _exit_task: JoinHandle<()>,
}

impl AcpAdapter {
    /// Spawn the agent process and start its reader/writer tasks.
    ///
    /// `notify_tx` receives every parsed [`AgentNotification`], including a
    /// final [`AgentNotification::ProcessExited`] when the stream closes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` if spawning or the startup handshake fails.
    pub async fn spawn(
        session_id: &str,
        config: &SpawnConfig,
        notify_tx: mpsc::Sender<AgentNotification>,
    ) -> Result<Self> {
        let connection = spawner::spawn_agent(config, session_id).await?;
        Self::from_connection(session_id, connection, notify_tx)
    }

    fn from_connection(
        session_id: &str,
        connection: AcpConnection,
        notify_tx: mpsc::Sender<AgentNotification>,
    ) -> Result<Self> {
        let AcpConnection { session_id: _, child, stdin, stdout } = connection;

        let cancel_token = CancellationToken::new();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));

        let (to_agent_tx, to_agent_rx) = mpsc::channel::<Value>(64);

        let writer_task = tokio::spawn(writer::run_writer(
            session_id.to_owned(),
            stdin,
            to_agent_rx,
            cancel_token.clone(),
        ));

        let reader_task = tokio::spawn(reader::run_reader(
            session_id.to_owned(),
            stdout,
            Arc::clone(&pending),
            notify_tx.clone(),
            cancel_token.clone(),
        ));

        let exit_task = spawner::monitor_exit(session_id.to_owned(), child, notify_tx, cancel_token.clone());

        Ok(Self {
            session_id: session_id.to_owned(),
            to_agent: to_agent_tx,
            pending,
            next_id: AtomicI64::new(1),
            cancel_token,
            stderr_tail,
            _writer_task: writer_task,
            _reader_task: reader_task,
            _exit_task: exit_task,
        })
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, method: &'static str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = OutboundRequest::new(id, method, params);
        let request_value = serde_json::to_value(&request)?;

        if self.to_agent.send(request_value).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::AgentDisconnected(format!(
                "session {}: agent stdin channel closed before sending {method}",
                self.session_id
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(AppError::Acp(format!("{method} failed: {error}"))),
            Ok(Err(_dropped)) => Err(AppError::AgentDisconnected(format!(
                "session {}: {method} response channel dropped",
                self.session_id
            ))),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(AppError::AgentTimeout(format!("{method} did not respond within {timeout:?}")))
            }
        }
    }
}

impl AgentAdapter for AcpAdapter {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.call(
                "initialize",
                json!({ "protocolVersion": 1, "clientCapabilities": {} }),
                Duration::from_secs(30),
            )
            .await?;
            Ok(())
        })
    }

    fn new_session(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let result = self.call("new_session", json!({}), Duration::from_secs(30)).await?;
            result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| AppError::Acp("new_session response missing sessionId".into()))
        })
    }

    fn load_session(&self, acp_session_id: &str) -> BoxFuture<'_, Result<()>> {
        let acp_session_id = acp_session_id.to_owned();
        Box::pin(async move {
            self.call("load_session", json!({ "sessionId": acp_session_id }), Duration::from_secs(30))
                .await?;
            Ok(())
        })
    }

    fn prompt(&self, blocks: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { self.call("prompt", json!({ "prompt": blocks }), Duration::from_secs(3600)).await })
    }

    fn cancel(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let id = self.next_request_id();
            let request = OutboundRequest::new(id, "cancel", json!({}));
            let value = serde_json::to_value(&request)?;
            // Best-effort: do not wait for a response, the agent may never
            // send one if it has already stopped.
            let _ = self.to_agent.send(value).await;
            Ok(())
        })
    }

    fn respond_permission(&self, id: Value, outcome: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let response = OutboundResponse { jsonrpc: "2.0", id, result: outcome };
            let value = serde_json::to_value(&response)?;
            self.to_agent
                .send(value)
                .await
                .map_err(|_| AppError::AgentDisconnected("agent stdin channel closed".into()))
        })
    }

    fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl Drop for AcpAdapter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Parse a raw inbound line into whichever of "response to our request",
/// "notification", or "agent-initiated request" it represents, resolving
/// pending requests against `pending` directly.
pub(super) async fn handle_inbound_line(line: &str, pending: &PendingMap) -> Option<AgentNotification> {
    let envelope: InboundEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(_) => return None,
    };

    match classify(envelope)? {
        Inbound::Response { id, result } => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(result);
            } else {
                warn!(id, "acp adapter: response to unknown or already-resolved request id");
            }
            None
        }
        Inbound::Notification { method, params } => Some(notification_from_method(&method, params)),
        Inbound::AgentRequest { id, method, params } => match method.as_str() {
            "session/request_permission" => Some(AgentNotification::RequestPermission { id, data: params }),
            other => Some(AgentNotification::Unrecognized { method: other.to_owned() }),
        },
    }
}

fn notification_from_method(method: &str, params: Value) -> AgentNotification {
    match method {
        "agent_message_chunk" => AgentNotification::AgentMessageChunk { text: extract_text(&params) },
        "agent_thought_chunk" => AgentNotification::AgentThoughtChunk { text: extract_text(&params) },
        "tool_call" => AgentNotification::ToolCall { data: params },
        "tool_call_update" => AgentNotification::ToolCallUpdate { data: params },
        "plan" => AgentNotification::Plan { data: params },
        "available_commands_updated" => AgentNotification::AvailableCommandsUpdated { data: params },
        "current_mode_updated" => AgentNotification::CurrentModeUpdated { data: params },
        other => AgentNotification::Unrecognized { method: other.to_owned() },
    }
}

fn extract_text(params: &Value) -> String {
    params
        .get("content")
        .and_then(|content| content.get("text"))
        .and_then(Value::as_str)
        .or_else(|| params.get("text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_resolves_pending_request() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let line = r#"{"jsonrpc":"2.0","id":1,"result":{"sessionId":"abc"}}"#;
        let outcome = handle_inbound_line(line, &pending).await;
        assert!(outcome.is_none());

        let result = rx.await.expect("resolved").expect("ok");
        assert_eq!(result.get("sessionId").and_then(Value::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn agent_message_chunk_extracts_text() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let line = r#"{"jsonrpc":"2.0","method":"agent_message_chunk","params":{"content":{"text":"hi"}}}"#;
        let outcome = handle_inbound_line(line, &pending).await;
        let Some(AgentNotification::AgentMessageChunk { text }) = outcome else {
            panic!("expected an agent message chunk");
        };
        assert_eq!(text, "hi");
    }

    #[tokio::test]
    async fn unknown_method_is_unrecognized_not_fatal() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let line = r#"{"jsonrpc":"2.0","method":"some_future_method","params":{}}"#;
        let outcome = handle_inbound_line(line, &pending).await;
        let Some(AgentNotification::Unrecognized { method }) = outcome else {
            panic!("expected an unrecognized notification");
        };
        assert_eq!(method, "some_future_method");
    }
}
