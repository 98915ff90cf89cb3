//! ACP reader task.
//!
//! Reads newline-delimited JSON from an agent's stdout and classifies each
//! complete line as a response to an outstanding request, a notification, or
//! an agent-initiated request, forwarding notifications through an `mpsc`
//! channel. Non-JSON lines (terminal escape noise, banner text some agents
//! print before becoming protocol-clean) are discarded rather than treated
//! as errors.
//!
//! Driven by [`FramedRead`] backed by [`AcpCodec`], which enforces the 1 MiB
//! per-line limit before any heap allocation for JSON parsing.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::adapter::{handle_inbound_line, AgentNotification};
use crate::acp::codec::AcpCodec;
use crate::AppError;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Value, Value>>>>>;

/// ACP reader task — reads NDJSON lines from `stdout`, resolves pending
/// requests against `pending`, and forwards notifications through `notify_tx`.
///
/// On clean EOF, the task simply stops; the exit monitor spawned alongside
/// it is responsible for emitting [`AgentNotification::ProcessExited`].
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits cleanly.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    pending: PendingMap,
    notify_tx: mpsc::Sender<AgentNotification>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "acp reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "acp reader: EOF detected");
                        break;
                    }
                    Some(Err(AppError::Acp(ref msg))) => {
                        warn!(session_id, error = msg.as_str(), "acp reader: codec framing error, skipping");
                    }
                    Some(Err(err)) => {
                        warn!(session_id, error = %err, "acp reader: IO error, stopping");
                        break;
                    }
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Some(notification) = handle_inbound_line(&line, &pending).await {
                            if notify_tx.send(notification).await.is_err() {
                                debug!(session_id, "acp reader: notify_tx closed, stopping");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
