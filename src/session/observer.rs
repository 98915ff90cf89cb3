//! Observer registration and reentrancy-safe dispatch.
//!
//! Observer callbacks run on the Session's own dispatch task, so they must
//! never block and must never call back into the Session directly — doing so
//! would recursively re-enter the very call stack that is currently mutating
//! Session state. Implementations push frames into their own outbound queue
//! and return; answers to UI prompts flow back through
//! [`Session::handle_ui_answer`](super::Session::handle_ui_answer), which is
//! a plain method call from the *subscriber's* task, not a callback invoked
//! from inside observer dispatch.

use std::sync::Arc;

use super::types::ObserverEvent;

/// A live, registered receiver of one session's events — typically one per
/// WebSocket connection.
pub trait Observer: Send + Sync {
    /// Stable identifier for this observer (its `client_id`).
    fn client_id(&self) -> &str;

    /// Deliver one event. Must return promptly: push into an outbound queue
    /// and return, never block on I/O.
    fn notify(&self, event: ObserverEvent);
}

/// Thread-safe registry of observers, keyed by identity (client id).
///
/// Read-mostly: `notify_all` only needs a read lock's worth of access in
/// spirit, but since this sits behind a single-threaded dispatch task per
/// Session, a plain `Mutex` (matching the host project's own style for
/// small, short-held critical sections) is sufficient rather than a
/// dedicated reader-writer lock.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: std::sync::Mutex<Vec<Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. If one with the same `client_id` is already
    /// registered, it is replaced.
    pub fn add(&self, observer: Arc<dyn Observer>) {
        let mut guard = self.observers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.retain(|o| o.client_id() != observer.client_id());
        guard.push(observer);
    }

    /// Remove an observer by client id. Idempotent.
    pub fn remove(&self, client_id: &str) {
        let mut guard = self.observers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.retain(|o| o.client_id() != client_id);
    }

    /// Snapshot the currently registered observers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Deliver `event` to every registered observer. Observer panics are not
    /// caught — an observer is expected to be a thin, non-panicking queue
    /// push; a panic there indicates a bug in that observer, not in the
    /// Session.
    pub fn notify_all(&self, event: &ObserverEvent) {
        for observer in self.snapshot() {
            observer.notify(event.clone());
        }
    }

    /// Drain and clear the registry, used by `close()` teardown so observers
    /// are released before the subprocess is torn down.
    pub fn drain(&self) -> Vec<Arc<dyn Observer>> {
        let mut guard = self.observers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

impl Clone for ObserverEvent {
    fn clone(&self) -> Self {
        match self {
            Self::AgentMessage { seq, html, is_thought, is_prompting } => Self::AgentMessage {
                seq: *seq,
                html: html.clone(),
                is_thought: *is_thought,
                is_prompting: *is_prompting,
            },
            Self::Discrete { seq, event_type, data } => Self::Discrete {
                seq: *seq,
                event_type: *event_type,
                data: data.clone(),
            },
            Self::PromptComplete { event_count } => Self::PromptComplete { event_count: *event_count },
            Self::AcpStopped { reason } => Self::AcpStopped { reason: reason.clone() },
            Self::UiPrompt(req) => Self::UiPrompt(req.clone()),
            Self::UiPromptDismiss { request_id, reason } => Self::UiPromptDismiss {
                request_id: request_id.clone(),
                reason: *reason,
            },
            Self::QueueMessageSending { id } => Self::QueueMessageSending { id: id.clone() },
            Self::QueueMessageSent { id } => Self::QueueMessageSent { id: id.clone() },
            Self::OnError { message } => Self::OnError { message: message.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        id: String,
        received: Arc<StdMutex<Vec<i64>>>,
    }

    impl Observer for RecordingObserver {
        fn client_id(&self) -> &str {
            &self.id
        }

        fn notify(&self, event: ObserverEvent) {
            if let ObserverEvent::Discrete { seq, .. } = event {
                self.received.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(seq);
            }
        }
    }

    #[test]
    fn re_adding_same_client_id_replaces_not_duplicates() {
        let registry = ObserverRegistry::new();
        let received = Arc::new(StdMutex::new(Vec::new()));
        registry.add(Arc::new(RecordingObserver { id: "c1".into(), received: Arc::clone(&received) }));
        registry.add(Arc::new(RecordingObserver { id: "c1".into(), received: Arc::clone(&received) }));

        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn notify_all_reaches_every_observer_exactly_once() {
        let registry = ObserverRegistry::new();
        let received_a = Arc::new(StdMutex::new(Vec::new()));
        let received_b = Arc::new(StdMutex::new(Vec::new()));
        registry.add(Arc::new(RecordingObserver { id: "a".into(), received: Arc::clone(&received_a) }));
        registry.add(Arc::new(RecordingObserver { id: "b".into(), received: Arc::clone(&received_b) }));

        registry.notify_all(&ObserverEvent::Discrete {
            seq: 7,
            event_type: crate::eventlog::EventType::ToolCall,
            data: serde_json::json!({}),
        });

        assert_eq!(*received_a.lock().unwrap_or_else(std::sync::PoisonError::into_inner), vec![7]);
        assert_eq!(*received_b.lock().unwrap_or_else(std::sync::PoisonError::into_inner), vec![7]);
    }

    #[test]
    fn remove_then_notify_does_not_reach_removed_observer() {
        let registry = ObserverRegistry::new();
        let received = Arc::new(StdMutex::new(Vec::new()));
        registry.add(Arc::new(RecordingObserver { id: "a".into(), received: Arc::clone(&received) }));
        registry.remove("a");

        registry.notify_all(&ObserverEvent::Discrete {
            seq: 1,
            event_type: crate::eventlog::EventType::ToolCall,
            data: serde_json::json!({}),
        });

        assert!(received.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_empty());
    }
}
