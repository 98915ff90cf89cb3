//! Per-connection dedup: tracks `last_sent_seq` and applies the live-dispatch
//! rule table, fanning a Session's [`ObserverEvent`]s into one client's
//! bounded outbound queue.
//!
//! Runs on the Session's own dispatch task (see [`Observer`] and its
//! non-blocking contract), so [`Subscriber::notify`] never awaits: a full
//! queue is handled with `try_send`, never a blocking `send`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::session::{Observer, ObserverEvent};

use super::protocol::{frame_for_observer_event, observer_event_is_streaming, observer_event_seq, OutboundFrame};

/// Bounded outbound queue capacity for one subscriber's frames.
pub const OUTBOUND_CAPACITY: usize = 256;

/// One live connection's view of a Session's event stream: a dedup
/// watermark plus a queue of frames waiting to be written to the socket.
pub struct Subscriber {
    client_id: String,
    last_sent_seq: AtomicI64,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel_token: CancellationToken,
}

impl Subscriber {
    /// Construct a subscriber seeded at `last_sent_seq`, delivering frames on
    /// `outbound`. `cancel_token` is cancelled when backpressure forces the
    /// connection closed; the owning WebSocket loop observes it to stop.
    #[must_use]
    pub fn new(
        client_id: String,
        last_sent_seq: i64,
        outbound: mpsc::Sender<OutboundFrame>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self { client_id, last_sent_seq: AtomicI64::new(last_sent_seq), outbound, cancel_token })
    }

    /// Current dedup watermark.
    #[must_use]
    pub fn last_sent_seq(&self) -> i64 {
        self.last_sent_seq.load(Ordering::SeqCst)
    }

    /// Raise the watermark to `seq` if it is newer. Never moves it backwards.
    pub fn advance(&self, seq: i64) {
        self.last_sent_seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// The token this subscriber cancels on backpressure; the WebSocket loop
    /// should select on it to close the connection promptly.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn enqueue(&self, frame: OutboundFrame, is_streaming: bool) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if is_streaming {
                    warn!(client_id = %self.client_id, "outbound queue full on a streaming frame, closing connection");
                } else {
                    warn!(client_id = %self.client_id, "outbound queue full, connection marked unhealthy");
                }
                self.cancel_token.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel_token.cancel();
            }
        }
    }
}

impl Observer for Subscriber {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn notify(&self, event: ObserverEvent) {
        let Some(seq) = observer_event_seq(&event) else {
            let is_streaming = false;
            self.enqueue(frame_for_observer_event(&event), is_streaming);
            return;
        };

        let is_streaming = observer_event_is_streaming(&event);
        if seq != 0 {
            let last_sent = self.last_sent_seq();
            let drop_as_stale = if is_streaming { seq < last_sent } else { seq <= last_sent };
            if drop_as_stale {
                return;
            }
            self.advance(seq);
        }

        self.enqueue(frame_for_observer_event(&event), is_streaming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn discrete(seq: i64) -> ObserverEvent {
        ObserverEvent::Discrete { seq, event_type: crate::eventlog::EventType::ToolCall, data: json!({}) }
    }

    fn agent_message(seq: i64) -> ObserverEvent {
        ObserverEvent::AgentMessage { seq, html: "<p>hi</p>".into(), is_thought: false, is_prompting: true }
    }

    #[tokio::test]
    async fn discrete_event_at_or_below_watermark_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = Subscriber::new("c1".into(), 5, tx, CancellationToken::new());

        subscriber.notify(discrete(5));
        subscriber.notify(discrete(4));
        subscriber.notify(discrete(6));

        let received = rx.recv().await.expect("one frame");
        assert_eq!(received.data["seq"], 6);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn streaming_event_equal_to_watermark_is_a_continuation_and_is_sent() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = Subscriber::new("c1".into(), 10, tx, CancellationToken::new());

        subscriber.notify(agent_message(10));

        let received = rx.recv().await.expect("continuation frame sent");
        assert_eq!(received.frame_type, "agent_message");
    }

    #[tokio::test]
    async fn seq_zero_late_chunk_is_sent_without_moving_watermark() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = Subscriber::new("c1".into(), 10, tx, CancellationToken::new());

        subscriber.notify(agent_message(0));

        assert!(rx.recv().await.is_some());
        assert_eq!(subscriber.last_sent_seq(), 10);
    }

    #[tokio::test]
    async fn full_queue_on_streaming_frame_cancels_the_token() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let subscriber = Subscriber::new("c1".into(), 0, tx, cancel.clone());

        subscriber.notify(agent_message(1));
        subscriber.notify(agent_message(2));

        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn control_frames_bypass_the_seq_watermark() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = Subscriber::new("c1".into(), 100, tx, CancellationToken::new());

        subscriber.notify(ObserverEvent::PromptComplete { event_count: 42 });

        let received = rx.recv().await.expect("control frame always delivered");
        assert_eq!(received.frame_type, "prompt_complete");
    }
}
