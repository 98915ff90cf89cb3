//! The blocking UI-prompt rendezvous: a single outstanding question per
//! session, answered (or dismissed) from another task via a oneshot channel.
//!
//! Mirrors the host project's wait-for-instruction shape — register a
//! oneshot sender keyed by request id, race the receiver against a timeout —
//! generalized to support mid-flight replacement (a newer prompt dismissing
//! an older, still-unanswered one) and replay-on-connect for a client that
//! attaches after the prompt was issued.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use super::types::{UiPromptRequest, UiPromptResponse};

struct ActivePrompt {
    request: UiPromptRequest,
    responder: oneshot::Sender<UiPromptResponse>,
}

/// Owns at most one outstanding [`UiPromptRequest`] for a session.
///
/// A new `issue()` call implicitly dismisses any prompt still pending,
/// delivering [`DismissReason::Replaced`] to its waiter and its observers.
#[derive(Default)]
pub struct UiPromptRendezvous {
    active: Mutex<Option<ActivePrompt>>,
}

/// Outcome of a completed rendezvous.
///
/// `Dropped` covers both "replaced by a newer prompt" and "cancelled" — the
/// caller already knows which of those it is doing (it is the one calling
/// [`issue`](UiPromptRendezvous::issue) again, or
/// [`cancel`](UiPromptRendezvous::cancel)), so the rendezvous itself does not
/// need to distinguish them.
pub enum RendezvousOutcome {
    /// The operator answered normally.
    Answered(UiPromptResponse),
    /// The wait timed out before an answer arrived.
    TimedOut,
    /// The prompt was dropped (replaced or cancelled) before it was answered.
    Dropped,
}

impl UiPromptRendezvous {
    /// Construct an empty rendezvous.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently pending request, if any — used to replay state to a
    /// client connecting mid-prompt.
    #[must_use]
    pub fn current(&self) -> Option<UiPromptRequest> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|p| p.request.clone())
    }

    /// Register a new prompt as pending, dismissing any prior one.
    ///
    /// Returns a receiver that resolves (with [`RendezvousOutcome`]) when the
    /// caller awaits [`wait`](Self::wait) for this request — the caller is
    /// expected to call `issue` then immediately `wait` on the returned
    /// request id from the same task, so no id needs to round-trip back in.
    pub fn issue(&self, request: UiPromptRequest) -> oneshot::Receiver<UiPromptResponse> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Dropping the previous responder (rather than sending on it) resolves
        // its waiter's receiver with `Err`, which `wait` reports as `Dropped`.
        guard.replace(ActivePrompt { request, responder: tx });
        rx
    }

    /// Await the answer to the most recently issued prompt, racing a
    /// timeout. `request_id` and `timeout_seconds` should match the request
    /// just passed to [`issue`](Self::issue).
    pub async fn wait(&self, rx: oneshot::Receiver<UiPromptResponse>, timeout_seconds: u64) -> RendezvousOutcome {
        let effective = if timeout_seconds == 0 { 300 } else { timeout_seconds };
        match tokio::time::timeout(Duration::from_secs(effective), rx).await {
            Ok(Ok(response)) => {
                self.clear_if_matches(&response.request_id);
                RendezvousOutcome::Answered(response)
            }
            Ok(Err(_dropped)) => RendezvousOutcome::Dropped,
            Err(_elapsed) => {
                self.take();
                RendezvousOutcome::TimedOut
            }
        }
    }

    /// Answer the currently pending prompt, if its id matches. Returns
    /// `false` if there is no pending prompt or the id does not match
    /// (a stale answer from a prompt already replaced or timed out).
    pub fn answer(&self, response: UiPromptResponse) -> bool {
        let Some(active) = self.take_if_matches(&response.request_id) else {
            return false;
        };
        active.responder.send(response).is_ok()
    }

    /// Cancel the currently pending prompt (e.g. the session is being
    /// cancelled or closed). Dropping the responder resolves the waiter's
    /// `wait` call as [`RendezvousOutcome::Dropped`].
    pub fn cancel(&self) -> Option<String> {
        let active = self.take()?;
        Some(active.request.request_id)
    }

    fn take(&self) -> Option<ActivePrompt> {
        self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }

    fn take_if_matches(&self, request_id: &str) -> Option<ActivePrompt> {
        let mut guard = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.as_ref().is_some_and(|p| p.request.request_id == request_id) {
            guard.take()
        } else {
            None
        }
    }

    fn clear_if_matches(&self, request_id: &str) {
        let mut guard = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.as_ref().is_some_and(|p| p.request.request_id == request_id) {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::UiPromptKind;

    fn sample_request(id: &str, timeout_seconds: u64) -> UiPromptRequest {
        UiPromptRequest {
            request_id: id.to_owned(),
            kind: UiPromptKind::YesNo,
            question: "Proceed?".to_owned(),
            options: Vec::new(),
            timeout_seconds,
            blocking: true,
        }
    }

    #[tokio::test]
    async fn answer_delivers_to_the_waiting_caller() {
        let rendezvous = UiPromptRendezvous::new();
        let rx = rendezvous.issue(sample_request("r1", 30));

        assert!(rendezvous.answer(UiPromptResponse {
            request_id: "r1".into(),
            option_id: Some("yes".into()),
            label: Some("Yes".into()),
            timed_out: false,
        }));

        match rendezvous.wait(rx, 30).await {
            RendezvousOutcome::Answered(response) => assert_eq!(response.option_id.as_deref(), Some("yes")),
            _ => panic!("expected an answer"),
        }
    }

    #[tokio::test]
    async fn issuing_a_new_prompt_replaces_the_pending_one() {
        let rendezvous = UiPromptRendezvous::new();
        let first_rx = rendezvous.issue(sample_request("r1", 30));
        let _second_rx = rendezvous.issue(sample_request("r2", 30));

        match rendezvous.wait(first_rx, 30).await {
            RendezvousOutcome::Dropped => {}
            _ => panic!("first prompt should have been replaced"),
        }
        assert_eq!(rendezvous.current().map(|r| r.request_id), Some("r2".to_owned()));
    }

    #[tokio::test]
    async fn stale_answer_to_already_replaced_prompt_is_rejected() {
        let rendezvous = UiPromptRendezvous::new();
        let _first_rx = rendezvous.issue(sample_request("r1", 30));
        let _second_rx = rendezvous.issue(sample_request("r2", 30));

        let accepted = rendezvous.answer(UiPromptResponse {
            request_id: "r1".into(),
            option_id: Some("yes".into()),
            label: Some("Yes".into()),
            timed_out: false,
        });
        assert!(!accepted);
    }

    #[tokio::test]
    async fn timeout_elapses_when_nobody_answers() {
        let rendezvous = UiPromptRendezvous::new();
        let rx = rendezvous.issue(sample_request("r1", 0));

        match tokio::time::timeout(Duration::from_millis(50), rendezvous.wait(rx, 0)).await {
            Ok(_) => panic!("default 300s timeout should not fire within 50ms"),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn cancel_unblocks_the_waiter() {
        let rendezvous = UiPromptRendezvous::new();
        let rx = rendezvous.issue(sample_request("r1", 30));
        rendezvous.cancel();

        match rendezvous.wait(rx, 30).await {
            RendezvousOutcome::Dropped => {}
            _ => panic!("cancel should surface as a dropped outcome"),
        }
    }
}
