//! Request/reply pairing: match at-most-one reply to each of two
//! asynchronous client calls per session.

use tokio::sync::oneshot;

/// The tuple `CompleteAuth` ultimately resolves to: `(user, token, success)`.
pub type CompleteResult = (String, String, bool);

/// The two reply slots owned by one session.
///
/// `start_reply` is filled synchronously inline with `StartAuth` processing
/// (it is simply the function's return value, so this type does not model
/// it beyond a one-time guard). `complete_reply` may be bound by
/// `CompleteAuth` before or after the handshake resolves; whichever happens
/// second observes the already-available result.
pub struct ReplySlots {
    start_replied: bool,
    complete_resolved: bool,
    complete_waiter: Option<oneshot::Sender<CompleteResult>>,
    complete_pending_result: Option<CompleteResult>,
}

impl ReplySlots {
    pub fn new() -> Self {
        Self {
            start_replied: false,
            complete_resolved: false,
            complete_waiter: None,
            complete_pending_result: None,
        }
    }

    /// Marks the `StartAuth` reply slot observed. Returns `false` if it was
    /// already observed (a reuse, which must never happen).
    #[must_use]
    pub fn mark_start_replied(&mut self) -> bool {
        if self.start_replied {
            return false;
        }
        self.start_replied = true;
        true
    }

    /// Called when `CompleteAuth` arrives for this session. Returns a
    /// receiver that resolves immediately if the handshake already finished,
    /// or once it does.
    pub fn bind_complete_waiter(&mut self) -> oneshot::Receiver<CompleteResult> {
        let (tx, rx) = oneshot::channel();
        if let Some(result) = self.complete_pending_result.take() {
            let _ = tx.send(result);
        } else if self.complete_resolved {
            // Already resolved and delivered once before; a second
            // CompleteAuth for the same handle gets a failure, never a
            // second real result.
            let _ = tx.send(("".to_string(), "".to_string(), false));
        } else {
            self.complete_waiter = Some(tx);
        }
        rx
    }

    /// Resolves the `CompleteAuth` reply exactly once. If no `CompleteAuth`
    /// has bound yet, the result is stashed until one does.
    pub fn resolve_complete(&mut self, result: CompleteResult) {
        if self.complete_resolved {
            return;
        }
        self.complete_resolved = true;
        if let Some(tx) = self.complete_waiter.take() {
            let _ = tx.send(result);
        } else {
            self.complete_pending_result = Some(result);
        }
    }

    /// Ensures the complete-reply slot is never dropped unresolved — sends
    /// a failure reply if nothing else has resolved it yet (e.g. on
    /// owner-loss).
    pub fn fail_if_unresolved(&mut self) {
        if !self.complete_resolved {
            self.resolve_complete(("".to_string(), "".to_string(), false));
        }
    }

    pub fn is_complete_resolved(&self) -> bool {
        self.complete_resolved
    }
}

impl Default for ReplySlots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_reply_cannot_be_reused() {
        let mut slots = ReplySlots::new();
        assert!(slots.mark_start_replied());
        assert!(!slots.mark_start_replied());
    }

    #[tokio::test]
    async fn complete_auth_arriving_after_resolve_gets_stashed_result() {
        let mut slots = ReplySlots::new();
        slots.resolve_complete(("alice".into(), "tok".into(), true));
        let rx = slots.bind_complete_waiter();
        let result = rx.await.unwrap();
        assert_eq!(result, ("alice".to_string(), "tok".to_string(), true));
    }

    #[tokio::test]
    async fn complete_auth_arriving_before_resolve_waits() {
        let mut slots = ReplySlots::new();
        let rx = slots.bind_complete_waiter();
        slots.resolve_complete(("bob".into(), "tok2".into(), true));
        let result = rx.await.unwrap();
        assert_eq!(result, ("bob".to_string(), "tok2".to_string(), true));
    }

    #[test]
    fn resolve_is_observed_exactly_once() {
        let mut slots = ReplySlots::new();
        slots.resolve_complete(("first".into(), "t".into(), true));
        slots.resolve_complete(("second".into(), "t".into(), true));
        // Second resolve is a no-op; the stashed result is still "first".
        let _rx = slots.bind_complete_waiter();
        assert!(slots.is_complete_resolved());
    }

    #[tokio::test]
    async fn fail_if_unresolved_sends_failure_before_discarding() {
        let mut slots = ReplySlots::new();
        let rx = slots.bind_complete_waiter();
        slots.fail_if_unresolved();
        let result = rx.await.unwrap();
        assert_eq!(result, ("".to_string(), "".to_string(), false));
    }
}
