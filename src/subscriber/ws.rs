//! Thin axum WebSocket handler: the bring-up sequence (connect → first
//! `load_events` → register), then a single read/write select loop bridging
//! one client's socket to its [`Subscriber`].
//!
//! The upgrade itself and the read/write loop shape are plumbing, not a
//! property under test — only the message sequence exchanged once the
//! socket is open matters.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::eventlog::Event;
use crate::session::{PromptMeta, Session, UiPromptResponse};
use crate::AppError;

use super::dedup::{Subscriber, OUTBOUND_CAPACITY};
use super::protocol::{frame_for_event, InboundFrame, OutboundFrame};

/// Shared state handed to every WebSocket upgrade: the live session table.
#[derive(Clone, Default)]
pub struct AppState {
    /// Live sessions keyed by session id.
    pub sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

/// `GET /ws/:session_id` — upgrades to a WebSocket bridging that session's
/// event stream to this connection.
pub async fn ws_handler(ws: WebSocketUpgrade, Path(session_id): Path<String>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(mut socket: WebSocket, session_id: String, state: AppState) {
    let session = { state.sessions.lock().await.get(&session_id).cloned() };
    let Some(session) = session else {
        let _ = socket
            .send(Message::Text(
                OutboundFrame::new("on_error", json!({ "message": format!("unknown session {session_id}") })).to_json().into(),
            ))
            .await;
        return;
    };

    let client_id = Uuid::new_v4().to_string();

    if send_connected_frame(&mut socket, &session, &client_id).await.is_err() {
        debug!(client_id, "failed to send connected frame");
        return;
    }

    let Some((limit, after_seq)) = await_first_load_events(&mut socket).await else {
        debug!(client_id, "connection closed before first load_events");
        return;
    };

    let last_sent_seq = match deliver_initial_load(&mut socket, &session, limit, after_seq).await {
        Ok(seq) => seq,
        Err(err) => {
            warn!(client_id, %err, "failed to load initial events");
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CAPACITY);
    let cancel_token = CancellationToken::new();
    let subscriber = Subscriber::new(client_id.clone(), last_sent_seq, outbound_tx, cancel_token.clone());
    session.add_observer(Arc::clone(&subscriber) as Arc<dyn crate::session::Observer>);

    if let Ok(gap_events) = session.get_buffered_events(subscriber.last_sent_seq()).await {
        let is_prompting = session.is_prompting().await;
        for event in &gap_events {
            subscriber.advance(event.seq);
            if outbound_forward(&mut socket, &frame_for_event(event, is_prompting)).await.is_err() {
                session.remove_observer(&client_id);
                return;
            }
        }
    }

    if let Some(pending) = session.current_ui_prompt() {
        let frame = OutboundFrame::new("ui_prompt", serde_json::to_value(&pending).unwrap_or_default());
        let _ = outbound_forward(&mut socket, &frame).await;
    }

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(client_id, "subscriber unhealthy, closing connection");
                break;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if outbound_forward(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&text, &session, &client_id, &mut socket).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_) | Message::Pong(_))) => {}
                    Some(Err(err)) => {
                        debug!(client_id, %err, "websocket recv error");
                        break;
                    }
                }
            }
        }
    }

    session.remove_observer(&client_id);
    debug!(client_id, "subscriber connection closed");
}

async fn send_connected_frame(socket: &mut WebSocket, session: &Arc<Session>, client_id: &str) -> Result<(), axum::Error> {
    let last_prompt = session.last_user_prompt().await.ok().flatten();
    let queue_length = session.queue_length().await.unwrap_or(0);
    let data = json!({
        "session_id": session.session_id(),
        "client_id": client_id,
        "queue_length": queue_length,
        "last_user_prompt": last_prompt.map(|(seq, prompt_id)| json!({ "seq": seq, "prompt_id": prompt_id })),
    });
    socket.send(Message::Text(OutboundFrame::new("connected", data).to_json().into())).await
}

/// Block until the client's first `load_events` request arrives, ignoring
/// any other frame type sent before it. Returns `None` if the connection
/// closes first.
async fn await_first_load_events(socket: &mut WebSocket) -> Option<(u32, i64)> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                if let Ok(InboundFrame::LoadEvents { limit, after_seq, .. }) = serde_json::from_str(&text) {
                    let limit = limit.unwrap_or(50).min(500);
                    return Some((limit, after_seq.unwrap_or(0)));
                }
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => {}
        }
    }
}

/// Deliver the bring-up load (Initial or Sync mode; a Sync request ahead of
/// the server falls back to Initial). Returns the subscriber's seeded
/// `last_sent_seq`.
async fn deliver_initial_load(
    socket: &mut WebSocket,
    session: &Arc<Session>,
    limit: u32,
    after_seq: i64,
) -> Result<i64, AppError> {
    let is_prompting = session.is_prompting().await;

    if after_seq > 0 {
        let server_max_seq = session.get_max_assigned_seq().await?;
        if after_seq <= server_max_seq {
            let events = session.get_buffered_events(after_seq).await?;
            let max_loaded = events.last().map_or(after_seq, |e| e.seq);
            send_events_loaded(socket, &events, false, false, is_prompting).await;
            return Ok(after_seq.max(max_loaded));
        }
    }

    let events = session.get_events_page(limit, 0).await?;
    let max_loaded = events.last().map_or(0, |e| e.seq);
    send_events_loaded(socket, &events, false, false, is_prompting).await;
    Ok(max_loaded)
}

async fn send_events_loaded(socket: &mut WebSocket, events: &[Event], prepend: bool, has_more: bool, is_prompting: bool) {
    let first_seq = events.first().map_or(0, |e| e.seq);
    let last_seq = events.last().map_or(0, |e| e.seq);
    let frames: Vec<serde_json::Value> = events
        .iter()
        .map(|event| {
            let frame = frame_for_event(event, is_prompting);
            json!({ "type": frame.frame_type, "data": frame.data })
        })
        .collect();
    let data = json!({
        "events": frames,
        "prepend": prepend,
        "has_more": has_more,
        "first_seq": first_seq,
        "last_seq": last_seq,
        "total_count": events.len(),
        "is_running": true,
        "is_prompting": is_prompting,
    });
    let _ = socket.send(Message::Text(OutboundFrame::new("events_loaded", data).to_json().into())).await;
}

async fn outbound_forward(socket: &mut WebSocket, frame: &OutboundFrame) -> Result<(), axum::Error> {
    socket.send(Message::Text(frame.to_json().into())).await
}

async fn handle_inbound_text(text: &str, session: &Arc<Session>, client_id: &str, socket: &mut WebSocket) {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return;
    };

    match frame {
        InboundFrame::LoadEvents { limit, before_seq, .. } => {
            if let Some(before_seq) = before_seq.filter(|seq| *seq > 0) {
                let limit = limit.unwrap_or(50).min(500);
                if let Ok(events) = session.get_events_page(limit, before_seq).await {
                    let has_more = events.first().is_some_and(|e| e.seq > 1);
                    let is_prompting = session.is_prompting().await;
                    send_events_loaded(socket, &events, true, has_more, is_prompting).await;
                }
            }
        }
        InboundFrame::Prompt { message, prompt_id, image_ids, file_ids } => {
            let meta = PromptMeta { message_text: message, sender_id: client_id.to_owned(), prompt_id, image_ids, file_ids };
            match session.prompt(meta.clone()).await {
                Ok(()) => {}
                Err(AppError::Conflict(_)) => {
                    if let Err(err) = session.enqueue(meta).await {
                        warn!(client_id, %err, "failed to enqueue prompt after conflict");
                    }
                }
                Err(err) => warn!(client_id, %err, "prompt dispatch failed"),
            }
        }
        InboundFrame::Cancel => {
            let _ = session.cancel().await;
        }
        InboundFrame::ForceReset => {
            let _ = session.force_reset().await;
        }
        InboundFrame::UiPromptAnswer { request_id, option_id, label } => {
            session.handle_ui_answer(UiPromptResponse { request_id, option_id, label, timed_out: false });
        }
        InboundFrame::Keepalive { client_time, last_seen_seq: _ } => {
            let server_max_seq = session.get_max_assigned_seq().await.unwrap_or(0);
            let is_prompting = session.is_prompting().await;
            let queue_length = session.queue_length().await.unwrap_or(0);
            let data = json!({
                "client_time": client_time,
                "server_time": chrono::Utc::now().timestamp_millis(),
                "server_max_seq": server_max_seq,
                "is_prompting": is_prompting,
                "is_running": session.is_agent_alive(),
                "queue_length": queue_length,
                "status": if is_prompting { "prompting" } else { "idle" },
            });
            let _ = socket.send(Message::Text(OutboundFrame::new("keepalive_ack", data).to_json().into())).await;
        }
    }
}
