//! The Session: owns one conversation's agent subprocess lifecycle, the
//! per-session sequence-number authority, markdown coalescing, observer
//! fan-out, the durable message queue, and the blocking UI-prompt
//! rendezvous.
//!
//! A `Session` is always held behind an `Arc` — several of its methods take
//! `self: &Arc<Self>` because they spawn background tasks (driving a
//! long-running `prompt`, an auto-restart, a delayed queue drain) that need
//! their own owned handle back to the Session.

pub mod observer;
pub mod queue;
pub mod restart;
pub mod types;
pub mod ui_prompt;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::spawner::SpawnConfig;
use crate::acp::{AcpAdapter, AgentAdapter, AgentNotification};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::GlobalConfig;
use crate::eventlog::{Event, EventLog, EventType, SessionMetadata, SessionStatus};
use crate::markdown::{BufferLimits, Flushed, HtmlRenderer, MarkdownBuffer};
use crate::errors::classify_agent_error;
use crate::{AppError, Result};

pub use observer::{Observer, ObserverRegistry};
pub use queue::MessageQueue;
pub use restart::RestartBudget;
pub use types::{
    DismissReason, ObserverEvent, PromptMeta, QueuedMessage, UiPromptKind, UiPromptOption, UiPromptRequest,
    UiPromptResponse,
};
pub use ui_prompt::{RendezvousOutcome, UiPromptRendezvous};

#[derive(Debug, Clone, Default)]
struct PromptState {
    is_prompting: bool,
    prompt_started_at: Option<DateTime<Utc>>,
}

/// Owns one conversation between a UI and an agent subprocess.
pub struct Session {
    session_id: String,
    event_log: EventLog,
    queue: MessageQueue,
    observers: ObserverRegistry,
    markdown: AsyncMutex<MarkdownBuffer>,
    thought_markdown: AsyncMutex<MarkdownBuffer>,
    next_seq: AsyncMutex<i64>,
    prompt_state: AsyncMutex<PromptState>,
    response_complete: Notify,
    ui_prompt: UiPromptRendezvous,
    restart_budget: AsyncMutex<RestartBudget>,
    adapter: AsyncMutex<Option<Arc<dyn AgentAdapter>>>,
    acp_session_id: AsyncMutex<Option<String>>,
    deferred_discrete: AsyncMutex<Vec<(i64, EventType, Value)>>,
    cancel_token: CancellationToken,
    closed: AtomicBool,
    child_alive: AtomicBool,
    spawn_config: SpawnConfig,
    queue_drain_delay: Duration,
    ui_prompt_timeout_seconds: u64,
    audit: Option<Arc<dyn AuditLogger>>,
    notify_tx: mpsc::Sender<AgentNotification>,
}

impl Session {
    /// Create and spawn a brand-new session: inserts its metadata row, spawns
    /// the agent subprocess, and runs the ACP `initialize` + `new_session`
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata row cannot be created or the agent
    /// subprocess fails to spawn and complete its handshake.
    pub async fn spawn_new(
        session_id: String,
        event_log: EventLog,
        spawn_config: SpawnConfig,
        global: &GlobalConfig,
        renderer: Arc<dyn HtmlRenderer>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Arc<Self>> {
        let command_line = format!("{} {}", spawn_config.host_cli, spawn_config.host_cli_args.join(" "));
        let metadata = SessionMetadata::new(&session_id, command_line, spawn_config.workspace_root.to_string_lossy());
        event_log.create_session(&metadata).await?;
        Self::from_metadata(metadata, event_log, spawn_config, global, renderer, audit).await
    }

    /// Resume a previously persisted session: re-derives the seq authority
    /// from stored metadata and respawns the agent subprocess, attempting
    /// `load_session` before falling back to a fresh `new_session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent subprocess fails to spawn and complete
    /// its handshake.
    pub async fn resume(
        metadata: SessionMetadata,
        event_log: EventLog,
        spawn_config: SpawnConfig,
        global: &GlobalConfig,
        renderer: Arc<dyn HtmlRenderer>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Arc<Self>> {
        Self::from_metadata(metadata, event_log, spawn_config, global, renderer, audit).await
    }

    async fn from_metadata(
        metadata: SessionMetadata,
        event_log: EventLog,
        spawn_config: SpawnConfig,
        global: &GlobalConfig,
        renderer: Arc<dyn HtmlRenderer>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Arc<Self>> {
        let session_id = metadata.session_id.clone();
        let queue = MessageQueue::new(event_log.pool(), session_id.clone());
        let next_seq = metadata.next_seq();
        let acp_session_id = metadata.acp_session_id.clone();

        let limits = BufferLimits {
            hard_inactivity: Duration::from_millis(global.markdown.hard_inactivity_ms),
            soft_inactivity: Duration::from_millis(global.markdown.soft_inactivity_ms),
            code_ceiling_bytes: global.markdown.code_size_ceiling_bytes,
            paragraph_ceiling_bytes: global.markdown.paragraph_size_ceiling_bytes,
        };

        let (notify_tx, mut notify_rx) = mpsc::channel::<AgentNotification>(256);

        let session = Arc::new(Self {
            session_id: session_id.clone(),
            event_log,
            queue,
            observers: ObserverRegistry::new(),
            markdown: AsyncMutex::new(MarkdownBuffer::new(Arc::clone(&renderer), limits)),
            thought_markdown: AsyncMutex::new(MarkdownBuffer::new(renderer, limits)),
            next_seq: AsyncMutex::new(next_seq),
            prompt_state: AsyncMutex::new(PromptState::default()),
            response_complete: Notify::new(),
            ui_prompt: UiPromptRendezvous::new(),
            restart_budget: AsyncMutex::new(RestartBudget::new(
                global.restart.max_restarts,
                Duration::from_secs(global.restart.window_seconds),
            )),
            adapter: AsyncMutex::new(None),
            acp_session_id: AsyncMutex::new(acp_session_id),
            deferred_discrete: AsyncMutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            child_alive: AtomicBool::new(false),
            spawn_config,
            queue_drain_delay: Duration::from_secs(global.queue_drain_delay_seconds),
            ui_prompt_timeout_seconds: global.ui_prompt_timeout_seconds,
            audit,
            notify_tx: notify_tx.clone(),
        });

        let window_seconds = i64::try_from(global.restart.window_seconds).unwrap_or(300);
        let since = Utc::now() - ChronoDuration::seconds(window_seconds);
        if let Ok(history) = session.event_log.restarts_since(&session_id, since).await {
            session.restart_budget.lock().await.seed(history);
        }

        {
            let dispatch_session = Arc::clone(&session);
            let cancel = session.cancel_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        received = notify_rx.recv() => {
                            match received {
                                Some(notification) => dispatch_session.handle_notification(notification).await,
                                None => break,
                            }
                        }
                    }
                }
            });
        }

        {
            let ticker_session = Arc::clone(&session);
            let cancel = session.cancel_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(50));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = ticker_session.run_inactivity_check().await {
                                warn!(session_id = %ticker_session.session_id, error = %err, "inactivity check failed");
                            }
                        }
                    }
                }
            });
        }

        let adapter = AcpAdapter::spawn(&session_id, &session.spawn_config, notify_tx).await?;
        adapter.initialize().await?;
        session.child_alive.store(true, Ordering::SeqCst);

        let existing_acp_session_id = session.acp_session_id.lock().await.clone();
        let resumed = match existing_acp_session_id {
            Some(id) => adapter.load_session(&id).await.is_ok(),
            None => false,
        };
        if !resumed {
            let new_id = adapter.new_session().await?;
            *session.acp_session_id.lock().await = Some(new_id.clone());
            session
                .event_log
                .update_metadata(&session_id, |m| m.acp_session_id = Some(new_id.clone()))
                .await?;
        }

        *session.adapter.lock().await = Some(Arc::new(adapter));

        if let Some(audit) = &session.audit {
            let _ = audit.log_entry(AuditEntry::new(AuditEventType::SessionStart).with_session(session_id.clone()));
        }

        Ok(session)
    }

    /// This session's unique identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a prompt is currently in flight.
    pub async fn is_prompting(&self) -> bool {
        self.prompt_state.lock().await.is_prompting
    }

    /// Register an observer (typically one per WebSocket connection).
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.add(observer);
    }

    /// Remove a previously registered observer.
    pub fn remove_observer(&self, client_id: &str) {
        self.observers.remove(client_id);
    }

    /// The currently pending UI prompt, if any, for replay to a client
    /// connecting mid-question.
    #[must_use]
    pub fn current_ui_prompt(&self) -> Option<UiPromptRequest> {
        self.ui_prompt.current()
    }

    /// Deliver an operator's answer to the currently pending UI prompt.
    /// Returns `false` if the id does not match the pending prompt (a stale
    /// answer).
    pub fn handle_ui_answer(&self, response: UiPromptResponse) -> bool {
        self.ui_prompt.answer(response)
    }

    /// The largest seq ever assigned, for a client deciding whether it has
    /// missed anything since its last known seq. Takes the max of the
    /// persisted `max_seq` and the in-memory seq counter, since a seq is
    /// assigned (and buffered in the markdown accumulator or the deferred
    /// queue) before the event it belongs to is actually appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata row cannot be read.
    pub async fn get_max_assigned_seq(&self) -> Result<i64> {
        let persisted_max = self.event_log.get_metadata(&self.session_id).await?.max_seq;
        let in_memory_max = *self.next_seq.lock().await - 1;
        Ok(persisted_max.max(in_memory_max))
    }

    /// Events strictly after `after_seq`, in seq order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_buffered_events(&self, after_seq: i64) -> Result<Vec<Event>> {
        self.event_log.read_from(&self.session_id, after_seq).await
    }

    /// Up to `limit` events strictly older than `before_seq` (or the newest
    /// `limit` events when `before_seq` is zero), in seq order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get_events_page(&self, limit: u32, before_seq: i64) -> Result<Vec<Event>> {
        self.event_log.read_last(&self.session_id, limit, before_seq).await
    }

    /// The seq and `promptId` of the most recent `user_prompt` event, if any,
    /// within the last 200 recorded events. Used to let a reconnecting client
    /// clear a locally-pending prompt that actually made it through.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn last_user_prompt(&self) -> Result<Option<(i64, String)>> {
        let events = self.event_log.read_last(&self.session_id, 200, 0).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == EventType::UserPrompt).and_then(|e| {
            let prompt_id = e.data.get("promptId").and_then(Value::as_str)?.to_owned();
            Some((e.seq, prompt_id))
        }))
    }

    /// Number of messages currently in the durable queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn queue_length(&self) -> Result<i64> {
        self.queue.len().await
    }

    /// Whether the agent subprocess is currently believed to be alive.
    #[must_use]
    pub fn is_agent_alive(&self) -> bool {
        self.child_alive.load(Ordering::SeqCst)
    }

    /// Queue a message for dispatch once the current prompt attempt (if any)
    /// finishes. Durable: survives a server restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn enqueue(&self, meta: PromptMeta) -> Result<QueuedMessage> {
        self.queue.enqueue(&meta.message_text, &meta.image_ids, &meta.file_ids, &meta.sender_id).await
    }

    /// Dispatch `meta` to the agent immediately.
    ///
    /// Returns `AppError::Conflict` if a prompt is already in flight and the
    /// agent subprocess is still alive. If the subprocess has died, this
    /// kicks off an automatic restart in the background and still returns
    /// `AppError::Conflict` so the caller knows to resend once the restart
    /// completes — it is not queued automatically, since the caller may want
    /// to show restart progress instead of silently absorbing the message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` when busy, or any error the event log
    /// append raises.
    pub async fn prompt(self: &Arc<Self>, meta: PromptMeta) -> Result<()> {
        {
            let mut state = self.prompt_state.lock().await;
            if state.is_prompting {
                if self.child_alive.load(Ordering::SeqCst) {
                    return Err(AppError::Conflict(format!("session {} is already prompting", self.session_id)));
                }
                drop(state);
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = session.restart_agent("dead_on_prompt").await {
                        warn!(session_id = %session.session_id, error = %err, "auto-restart failed");
                    }
                });
                return Err(AppError::Conflict(format!(
                    "session {} agent is restarting, resend the prompt once restarted",
                    self.session_id
                )));
            }
            state.is_prompting = true;
            state.prompt_started_at = Some(Utc::now());
        }

        let seq = self.next_seq().await;
        let data = json!({
            "text": meta.message_text,
            "senderId": meta.sender_id,
            "promptId": meta.prompt_id,
            "imageIds": meta.image_ids,
            "fileIds": meta.file_ids,
        });
        self.append_event(seq, EventType::UserPrompt, data.clone()).await?;
        self.observers.notify_all(&ObserverEvent::Discrete { seq, event_type: EventType::UserPrompt, data });

        let blocks = build_prompt_blocks(&meta);
        let session = Arc::clone(self);
        tokio::spawn(async move { session.drive_prompt(blocks).await });
        Ok(())
    }

    /// Best-effort interrupt of the in-flight prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter call itself fails to send.
    pub async fn cancel(self: &Arc<Self>) -> Result<()> {
        let adapter = self.adapter.lock().await.clone();
        if let Some(adapter) = adapter {
            adapter.cancel().await?;
        }
        Ok(())
    }

    /// Clear the prompt state, the durable queue, and any pending UI prompt,
    /// without closing the session. Used when a client wants a clean slate
    /// after a stuck or unwanted prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if clearing the durable queue fails.
    pub async fn force_reset(self: &Arc<Self>) -> Result<()> {
        let _ = self.cancel().await;
        self.queue.clear().await?;
        {
            let mut state = self.prompt_state.lock().await;
            state.is_prompting = false;
            state.prompt_started_at = None;
        }
        if let Some(request_id) = self.ui_prompt.cancel() {
            self.observers.notify_all(&ObserverEvent::UiPromptDismiss { request_id, reason: DismissReason::Cancelled });
        }
        self.deferred_discrete.lock().await.clear();
        self.response_complete.notify_waiters();
        Ok(())
    }

    /// Wait for the current prompt attempt to finish, up to `timeout`.
    /// Returns `true` immediately if nothing is in flight.
    pub async fn wait_for_response_complete(&self, timeout: Duration) -> bool {
        let notified = self.response_complete.notified();
        if !self.prompt_state.lock().await.is_prompting {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Close the session.
    ///
    /// `reason == "server_shutdown"` suspends the conversation without
    /// ending it: status moves to `suspended` and no `session_end` event is
    /// appended, so [`resume`](Self::resume) can pick it back up. Any other
    /// reason ends the conversation: a `session_end` event is appended and
    /// status moves to `completed`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata update or final event append fails.
    pub async fn close(self: &Arc<Self>, reason: &str) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Notify before tearing anything down, so observers can deny further
        // writes while the subprocess and context are still live.
        self.observers.notify_all(&ObserverEvent::AcpStopped { reason: reason.to_owned() });

        self.cancel_token.cancel();
        self.ui_prompt.cancel();

        if let Some(adapter) = self.adapter.lock().await.take() {
            let _ = adapter.cancel().await;
        }

        // The inactivity ticker just died with the cancel above, so it will
        // never close out a block left open mid-stream; flush and drain here
        // or any event deferred behind it is lost for good.
        self.flush_markdown_buffers().await?;
        self.drain_deferred_if_block_closed().await?;

        if reason == "server_shutdown" {
            self.event_log.update_metadata(&self.session_id, |m| m.status = SessionStatus::Suspended).await?;
        } else {
            let seq = self.next_seq().await;
            let data = json!({ "reason": reason });
            self.append_event(seq, EventType::SessionEnd, data.clone()).await?;
            self.event_log.update_metadata(&self.session_id, |m| m.status = SessionStatus::Completed).await?;
            self.observers.notify_all(&ObserverEvent::Discrete { seq, event_type: EventType::SessionEnd, data });
        }

        if let Some(audit) = &self.audit {
            let _ = audit.log_entry(
                AuditEntry::new(AuditEventType::SessionTerminate)
                    .with_session(self.session_id.clone())
                    .with_reason(reason.to_owned()),
            );
        }

        self.observers.drain();
        Ok(())
    }

    // ── Internal: seq authority ─────────────────────────────────────────

    async fn next_seq(&self) -> i64 {
        let mut guard = self.next_seq.lock().await;
        let seq = *guard;
        *guard += 1;
        seq
    }

    /// Re-sync the in-memory seq counter from persisted metadata. Called
    /// after resume so a restarted server never reuses a seq.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata read fails.
    pub async fn refresh_next_seq(&self) -> Result<()> {
        let metadata = self.event_log.get_metadata(&self.session_id).await?;
        *self.next_seq.lock().await = metadata.next_seq();
        Ok(())
    }

    async fn append_event(&self, seq: i64, event_type: EventType, data: Value) -> Result<()> {
        let event = Event::new(&self.session_id, seq, event_type, data);
        self.event_log.append(&event).await
    }

    // ── Internal: markdown + discrete dispatch ──────────────────────────

    async fn any_buffer_in_block(&self) -> bool {
        self.markdown.lock().await.is_in_block() || self.thought_markdown.lock().await.is_in_block()
    }

    async fn commit_streaming(&self, event_type: EventType, is_thought: bool, flushed: Flushed) -> Result<()> {
        self.append_event(flushed.seq, event_type, json!({ "html": flushed.html })).await?;
        let is_prompting = self.prompt_state.lock().await.is_prompting;
        self.observers.notify_all(&ObserverEvent::AgentMessage {
            seq: flushed.seq,
            html: flushed.html,
            is_thought,
            is_prompting,
        });
        Ok(())
    }

    async fn flush_markdown_buffers(&self) -> Result<()> {
        let message_flush = self.markdown.lock().await.flush();
        if let Some(flushed) = message_flush {
            self.commit_streaming(EventType::AgentMessage, false, flushed).await?;
        }
        let thought_flush = self.thought_markdown.lock().await.flush();
        if let Some(flushed) = thought_flush {
            self.commit_streaming(EventType::AgentThought, true, flushed).await?;
        }
        Ok(())
    }

    async fn commit_discrete(&self, seq: i64, event_type: EventType, data: Value) -> Result<()> {
        self.append_event(seq, event_type, data.clone()).await?;
        self.observers.notify_all(&ObserverEvent::Discrete { seq, event_type, data });
        Ok(())
    }

    /// A discrete (non-streaming) event arriving from the agent. Per the
    /// mid-block policy, a discrete event arriving while either markdown
    /// buffer has an open block (list, table, or fenced code) is deferred
    /// until the block closes, rather than force-closing it — splitting a
    /// tight list or table to make room for an interleaved tool call would
    /// produce two broken fragments instead of one intact one.
    async fn emit_or_defer_discrete(&self, event_type: EventType, data: Value) -> Result<()> {
        let seq = self.next_seq().await;
        if self.any_buffer_in_block().await {
            self.deferred_discrete.lock().await.push((seq, event_type, data));
            return Ok(());
        }
        self.flush_markdown_buffers().await?;
        self.commit_discrete(seq, event_type, data).await
    }

    async fn drain_deferred_if_block_closed(&self) -> Result<()> {
        if self.any_buffer_in_block().await {
            return Ok(());
        }
        let deferred = std::mem::take(&mut *self.deferred_discrete.lock().await);
        for (seq, event_type, data) in deferred {
            self.commit_discrete(seq, event_type, data).await?;
        }
        Ok(())
    }

    async fn run_inactivity_check(&self) -> Result<()> {
        let now = Instant::now();
        let message_flush = self.markdown.lock().await.check_inactivity(now);
        if let Some(flushed) = message_flush {
            self.commit_streaming(EventType::AgentMessage, false, flushed).await?;
        }
        let thought_flush = self.thought_markdown.lock().await.check_inactivity(now);
        if let Some(flushed) = thought_flush {
            self.commit_streaming(EventType::AgentThought, true, flushed).await?;
        }
        self.drain_deferred_if_block_closed().await
    }

    async fn on_stream_chunk(&self, is_thought: bool, text: String) -> Result<()> {
        let seq = self.next_seq().await;
        let flushes = if is_thought {
            self.thought_markdown.lock().await.write(seq, &text)
        } else {
            self.markdown.lock().await.write(seq, &text)
        };
        let event_type = if is_thought { EventType::AgentThought } else { EventType::AgentMessage };
        for flushed in flushes {
            self.commit_streaming(event_type, is_thought, flushed).await?;
        }
        self.drain_deferred_if_block_closed().await
    }

    // ── Internal: agent notification dispatch ───────────────────────────

    async fn handle_notification(self: &Arc<Self>, notification: AgentNotification) {
        let result = match notification {
            AgentNotification::AgentMessageChunk { text } => self.on_stream_chunk(false, text).await,
            AgentNotification::AgentThoughtChunk { text } => self.on_stream_chunk(true, text).await,
            AgentNotification::ToolCall { data } => self.emit_or_defer_discrete(EventType::ToolCall, data).await,
            AgentNotification::ToolCallUpdate { data } => self.emit_or_defer_discrete(EventType::ToolUpdate, data).await,
            AgentNotification::Plan { data } => self.emit_or_defer_discrete(EventType::Plan, data).await,
            AgentNotification::RequestPermission { id, data } => self.on_request_permission(id, data).await,
            AgentNotification::AvailableCommandsUpdated { .. } | AgentNotification::CurrentModeUpdated { .. } => {
                // Live UI hints with no slot in the closed event-type set; not
                // persisted, not fanned out — the agent re-sends them on
                // reconnect so nothing is lost by dropping them here.
                debug!(session_id = %self.session_id, "ephemeral agent notification, not persisted");
                Ok(())
            }
            AgentNotification::Unrecognized { method } => {
                debug!(session_id = %self.session_id, method, "unrecognized agent notification, ignored");
                Ok(())
            }
            AgentNotification::ProcessExited { exit_code, reason } => self.on_process_exited(exit_code, reason).await,
        };

        if let Err(err) = result {
            warn!(session_id = %self.session_id, error = %err, "error handling agent notification");
            self.observers.notify_all(&ObserverEvent::OnError { message: err.to_string() });
        }
    }

    async fn on_request_permission(self: &Arc<Self>, id: Value, data: Value) -> Result<()> {
        self.flush_markdown_buffers().await?;

        let request = UiPromptRequest {
            request_id: Uuid::new_v4().to_string(),
            kind: UiPromptKind::Permission,
            question: data
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or("The agent is requesting permission")
                .to_owned(),
            options: parse_permission_options(&data),
            timeout_seconds: self.ui_prompt_timeout_seconds,
            blocking: true,
        };

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let question = request.question.clone();
            let response = session.ui_prompt(request).await;
            let outcome = if response.timed_out {
                json!({ "outcome": "cancelled" })
            } else {
                json!({ "outcome": "selected", "optionId": response.option_id })
            };

            let record = json!({
                "question": question,
                "optionId": response.option_id,
                "label": response.label,
                "timedOut": response.timed_out,
            });
            if let Err(err) = session.emit_or_defer_discrete(EventType::Permission, record).await {
                warn!(session_id = %session.session_id, error = %err, "failed to persist permission record");
            }

            let adapter = session.adapter.lock().await.clone();
            if let Some(adapter) = adapter {
                if let Err(err) = adapter.respond_permission(id, outcome).await {
                    warn!(session_id = %session.session_id, error = %err, "failed to respond to permission request");
                }
            }
        });

        Ok(())
    }

    async fn on_process_exited(self: &Arc<Self>, exit_code: Option<i32>, reason: String) -> Result<()> {
        self.child_alive.store(false, Ordering::SeqCst);
        warn!(session_id = %self.session_id, ?exit_code, reason, "agent process exited");

        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let was_prompting = self.prompt_state.lock().await.is_prompting;
        if was_prompting {
            // The child is gone, so drive_prompt's own reader loop will never
            // resolve: it's left awaiting a pending response for up to the
            // adapter's prompt timeout. Reset the prompting state here rather
            // than waiting for that, or the session falsely reports
            // "already prompting" on the very next prompt, even once the
            // restart below succeeds.
            self.finish_prompt(Some(format!("agent exited unexpectedly: {reason}"))).await;
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = session.restart_agent("process_exited").await {
                    warn!(session_id = %session.session_id, error = %err, "auto-restart failed");
                }
            });
        } else {
            self.observers.notify_all(&ObserverEvent::AcpStopped { reason });
        }

        Ok(())
    }

    /// Issue a blocking UI prompt and wait for an answer, a timeout, or
    /// replacement by a newer prompt. Flushes pending markdown first so the
    /// question's surrounding context is visible before it.
    pub async fn ui_prompt(self: &Arc<Self>, mut request: UiPromptRequest) -> UiPromptResponse {
        if request.timeout_seconds == 0 {
            request.timeout_seconds = self.ui_prompt_timeout_seconds;
        }
        if let Err(err) = self.flush_markdown_buffers().await {
            warn!(session_id = %self.session_id, error = %err, "failed to flush markdown before ui prompt");
        }

        if let Some(previous) = self.ui_prompt.current() {
            self.observers.notify_all(&ObserverEvent::UiPromptDismiss {
                request_id: previous.request_id,
                reason: DismissReason::Replaced,
            });
        }

        let rx = self.ui_prompt.issue(request.clone());
        self.observers.notify_all(&ObserverEvent::UiPrompt(request.clone()));

        match self.ui_prompt.wait(rx, request.timeout_seconds).await {
            RendezvousOutcome::Answered(response) => {
                if let Some(audit) = &self.audit {
                    let _ = audit.log_entry(
                        AuditEntry::new(AuditEventType::Approval)
                            .with_session(self.session_id.clone())
                            .with_request_id(response.request_id.clone()),
                    );
                }
                response
            }
            RendezvousOutcome::TimedOut => {
                self.observers.notify_all(&ObserverEvent::UiPromptDismiss {
                    request_id: request.request_id.clone(),
                    reason: DismissReason::Timeout,
                });
                UiPromptResponse { request_id: request.request_id, option_id: None, label: None, timed_out: true }
            }
            RendezvousOutcome::Dropped => {
                UiPromptResponse { request_id: request.request_id, option_id: None, label: None, timed_out: true }
            }
        }
    }

    // ── Internal: prompt lifecycle ───────────────────────────────────────

    fn drive_prompt(self: Arc<Self>, blocks: Value) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let adapter = self.adapter.lock().await.clone();
            let Some(adapter) = adapter else {
                self.finish_prompt(Some("no agent adapter attached".to_owned())).await;
                return;
            };

            match adapter.prompt(blocks).await {
                Ok(_stop_info) => {
                    if let Err(err) = self.flush_markdown_buffers().await {
                        warn!(session_id = %self.session_id, error = %err, "failed to flush markdown on prompt completion");
                    }
                    if let Err(err) = self.drain_deferred_if_block_closed().await {
                        warn!(session_id = %self.session_id, error = %err, "failed to drain deferred discrete events");
                    }
                    self.finish_prompt(None).await;
                }
                Err(err) => {
                    // The adapter wraps every failed RPC in AppError::Acp; reclassify the
                    // raw message so timeouts/rate-limits/disconnects reach the observer
                    // (and the restart decision below) as their own bucket rather than a
                    // generic protocol error.
                    let classified = classify_agent_error(&err.to_string());
                    let should_restart = matches!(classified, AppError::AgentDisconnected(_));
                    self.finish_prompt(Some(classified.to_string())).await;
                    if should_restart {
                        if let Err(err) = self.restart_agent("prompt_disconnected").await {
                            warn!(session_id = %self.session_id, error = %err, "auto-restart failed");
                        }
                    }
                }
            }
        })
    }

    async fn finish_prompt(self: &Arc<Self>, error: Option<String>) {
        {
            let mut state = self.prompt_state.lock().await;
            state.is_prompting = false;
            state.prompt_started_at = None;
        }

        if let Some(message) = error {
            self.observers.notify_all(&ObserverEvent::OnError { message });
        }

        let event_count = self.event_log.get_metadata(&self.session_id).await.map(|m| m.event_count).unwrap_or(0);
        self.observers.notify_all(&ObserverEvent::PromptComplete { event_count });
        self.response_complete.notify_waiters();

        let session = Arc::clone(self);
        tokio::spawn(async move { session.drain_queue_after_delay().await });
    }

    async fn drain_queue_after_delay(self: Arc<Self>) {
        tokio::time::sleep(self.queue_drain_delay).await;

        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.prompt_state.lock().await.is_prompting {
            return;
        }

        match self.queue.pop_oldest().await {
            Ok(Some(message)) => {
                self.observers.notify_all(&ObserverEvent::QueueMessageSending { id: message.id.clone() });
                let queued_id = message.id.clone();
                let meta = PromptMeta {
                    message_text: message.message_text,
                    sender_id: message.sender_id,
                    prompt_id: message.id,
                    image_ids: message.image_ids,
                    file_ids: message.file_ids,
                };
                match self.prompt(meta).await {
                    Ok(()) => self.observers.notify_all(&ObserverEvent::QueueMessageSent { id: queued_id }),
                    Err(err) => {
                        warn!(session_id = %self.session_id, error = %err, "failed to dispatch queued message, not re-enqueued");
                        self.observers.notify_all(&ObserverEvent::OnError { message: err.to_string() });
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "failed to pop queued message");
            }
        }
    }

    // ── Internal: restart ────────────────────────────────────────────────

    async fn restart_agent(self: &Arc<Self>, trigger: &str) -> Result<()> {
        let now = Utc::now();
        let allowed = self.restart_budget.lock().await.allows_restart(now);
        if !allowed {
            self.observers.notify_all(&ObserverEvent::OnError {
                message: "restart budget exhausted, session will not auto-restart".to_owned(),
            });
            self.event_log.update_metadata(&self.session_id, |m| m.status = SessionStatus::Suspended).await?;
            return Err(AppError::RestartBudgetExhausted(format!(
                "session {} exceeded its restart budget",
                self.session_id
            )));
        }

        self.restart_budget.lock().await.record(now);
        self.event_log.record_restart(&self.session_id, now).await?;

        *self.adapter.lock().await = None;

        let new_adapter = AcpAdapter::spawn(&self.session_id, &self.spawn_config, self.notify_tx.clone()).await?;
        new_adapter.initialize().await?;
        self.child_alive.store(true, Ordering::SeqCst);

        let existing_acp_session_id = self.acp_session_id.lock().await.clone();
        let resumed = match existing_acp_session_id {
            Some(id) => new_adapter.load_session(&id).await.is_ok(),
            None => false,
        };
        if !resumed {
            let new_id = new_adapter.new_session().await?;
            *self.acp_session_id.lock().await = Some(new_id.clone());
            self.event_log
                .update_metadata(&self.session_id, |m| m.acp_session_id = Some(new_id.clone()))
                .await?;
        }

        *self.adapter.lock().await = Some(Arc::new(new_adapter));
        info!(session_id = %self.session_id, trigger, resumed, "agent restarted");
        Ok(())
    }
}

fn parse_permission_options(data: &Value) -> Vec<UiPromptOption> {
    data.get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| {
                    let option_id = option.get("optionId").and_then(Value::as_str)?.to_owned();
                    let label = option
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(option_id.as_str())
                        .to_owned();
                    Some(UiPromptOption { option_id, label })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_prompt_blocks(meta: &PromptMeta) -> Value {
    let mut blocks = vec![json!({ "type": "text", "text": meta.message_text })];
    for image_id in &meta.image_ids {
        blocks.push(json!({ "type": "image_ref", "imageId": image_id }));
    }
    for file_id in &meta.file_ids {
        blocks.push(json!({ "type": "file_ref", "fileId": file_id }));
    }
    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::SessionMetadata;
    use crate::markdown::PulldownRenderer;

    /// Builds a `Session` with no attached adapter, for exercising the
    /// markdown/discrete dispatch and seq-authority logic directly without a
    /// live agent subprocess.
    async fn test_session(session_id: &str) -> Arc<Session> {
        let event_log = EventLog::connect_memory().await.expect("connect");
        event_log.create_session(&SessionMetadata::new(session_id, "echo", "/tmp")).await.expect("create session");

        let renderer: Arc<dyn HtmlRenderer> = Arc::new(PulldownRenderer);
        let limits = BufferLimits::default();
        let (notify_tx, _notify_rx) = mpsc::channel(8);

        Arc::new(Session {
            session_id: session_id.to_owned(),
            queue: MessageQueue::new(event_log.pool(), session_id.to_owned()),
            event_log,
            observers: ObserverRegistry::new(),
            markdown: AsyncMutex::new(MarkdownBuffer::new(Arc::clone(&renderer), limits)),
            thought_markdown: AsyncMutex::new(MarkdownBuffer::new(renderer, limits)),
            next_seq: AsyncMutex::new(1),
            prompt_state: AsyncMutex::new(PromptState::default()),
            response_complete: Notify::new(),
            ui_prompt: UiPromptRendezvous::new(),
            restart_budget: AsyncMutex::new(RestartBudget::new(3, Duration::from_secs(300))),
            adapter: AsyncMutex::new(None),
            acp_session_id: AsyncMutex::new(None),
            deferred_discrete: AsyncMutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            child_alive: AtomicBool::new(false),
            spawn_config: SpawnConfig {
                host_cli: "echo".to_owned(),
                host_cli_args: Vec::new(),
                workspace_root: std::env::temp_dir(),
                startup_timeout: Duration::from_secs(5),
            },
            queue_drain_delay: Duration::from_secs(5),
            ui_prompt_timeout_seconds: 60,
            audit: None,
            notify_tx,
        })
    }

    #[tokio::test]
    async fn discrete_event_mid_list_is_deferred_and_drains_once_the_list_closes() {
        let session = test_session("s-defer").await;

        assert!(session.on_stream_chunk(false, "- item one\n".to_owned()).await.is_ok());
        assert!(session.any_buffer_in_block().await, "list must still be open after one item");

        session
            .emit_or_defer_discrete(EventType::ToolCall, json!({ "tool": "grep" }))
            .await
            .expect("defer");
        assert!(
            session.get_buffered_events(0).await.expect("read").is_empty(),
            "deferred tool call must not be persisted while the list is open"
        );

        // Blank line closes the list and the subsequent drain commits the
        // deferred tool call right after it, preserving the seq it was
        // assigned at defer time rather than the seq at drain time.
        assert!(session.on_stream_chunk(false, "\n".to_owned()).await.is_ok());

        let events = session.get_buffered_events(0).await.expect("read");
        assert_eq!(events.len(), 2, "list fragment then the deferred tool call, never interleaved");
        assert_eq!(events[0].event_type, EventType::AgentMessage);
        assert_eq!(events[1].event_type, EventType::ToolCall);
        assert!(events[0].seq < events[1].seq, "tool call was assigned its seq after the list's first chunk");
    }

    #[tokio::test]
    async fn discrete_event_outside_a_block_is_committed_immediately() {
        let session = test_session("s-immediate").await;

        session.emit_or_defer_discrete(EventType::Plan, json!({ "steps": [] })).await.expect("commit");

        let events = session.get_buffered_events(0).await.expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Plan);
        assert!(session.deferred_discrete.lock().await.is_empty());
    }

    #[tokio::test]
    async fn streaming_chunks_across_two_writes_coalesce_under_the_first_seq() {
        let session = test_session("s-coalesce").await;

        assert!(session.on_stream_chunk(false, "Hello, ".to_owned()).await.is_ok());
        assert!(session.on_stream_chunk(false, "world.\n\n".to_owned()).await.is_ok());

        let events = session.get_buffered_events(0).await.expect("read");
        assert_eq!(events.len(), 1, "both chunks must coalesce into a single fragment");
        assert_eq!(events[0].event_type, EventType::AgentMessage);
        assert_eq!(events[0].seq, 1, "fragment keeps the seq of its first contributing chunk");
    }

    #[tokio::test]
    async fn close_with_non_shutdown_reason_ends_the_session_and_appends_session_end() {
        let session = test_session("s-close").await;

        session.close("user_requested").await.expect("close");

        let events = session.get_buffered_events(0).await.expect("read");
        assert_eq!(events.last().map(|e| e.event_type), Some(EventType::SessionEnd));

        // Idempotent: closing again is a no-op, not a second session_end.
        session.close("user_requested").await.expect("close again");
        let events = session.get_buffered_events(0).await.expect("read");
        assert_eq!(events.iter().filter(|e| e.event_type == EventType::SessionEnd).count(), 1);
    }

    #[tokio::test]
    async fn force_reset_clears_deferred_discrete_events_and_prompt_state() {
        let session = test_session("s-reset").await;

        assert!(session.on_stream_chunk(false, "- open item\n".to_owned()).await.is_ok());
        session.emit_or_defer_discrete(EventType::ToolCall, json!({})).await.expect("defer");
        assert_eq!(session.deferred_discrete.lock().await.len(), 1);

        session.force_reset().await.expect("force reset");

        assert!(session.deferred_discrete.lock().await.is_empty());
        assert!(!session.is_prompting().await);
    }

    #[tokio::test]
    async fn process_exit_mid_prompt_resets_prompting_state_before_restart_completes() {
        let session = test_session("s-crash").await;

        // Simulate a prompt in flight when the child dies.
        {
            let mut state = session.prompt_state.lock().await;
            state.is_prompting = true;
            state.prompt_started_at = Some(Utc::now());
        }
        session.child_alive.store(true, Ordering::SeqCst);

        // The background restart this spawns is fire-and-forget; the
        // prompting-state reset it must not wait on happens synchronously
        // before that spawn, so asserting right after the await is enough.
        session.on_process_exited(None, "child closed stdout".to_owned()).await.expect("on_process_exited");

        assert!(!session.is_prompting().await, "a dead child must not leave the session stuck \"prompting\"");

        // A prompt issued right after the crash must be accepted rather than
        // rejected with Conflict("already prompting"), even though the
        // auto-restart it kicked off hasn't finished yet.
        let meta = PromptMeta {
            message_text: "are you there?".to_owned(),
            sender_id: "U_TEST".to_owned(),
            prompt_id: "p1".to_owned(),
            image_ids: Vec::new(),
            file_ids: Vec::new(),
        };
        assert!(session.prompt(meta).await.is_ok(), "prompt must be accepted once the crash has been handled");
    }
}
