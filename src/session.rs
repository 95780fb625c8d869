//! Session data model.

use sha2::{Digest, Sha256};

use crate::config::ConfigOverlay;
use crate::pairing::ReplySlots;

/// Deterministic digest of the service identity public key, used by
/// [`crate::registry::SessionRegistry::stop_similar`] to tell sessions
/// started against the same service identity apart from ones started
/// against a different one.
pub fn service_commitment(verifying_key_bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(verifying_key_bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Lifecycle state of a session. Transitions are monotonic except
/// `Started → Continuing`, which only happens after a successful handshake
/// when continuous mode is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Invalid,
    Started,
    Completed,
    Continuing,
    Harvestable,
}

impl SessionState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Invalid, Started)
                | (Started, Completed)
                | (Started, Continuing)
                | (Completed, Harvestable)
                | (Continuing, Harvestable)
                // A session may also fail before ever producing a result.
                | (Started, Harvestable)
        )
    }
}

/// Outcome reported by the external handshake fsm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Terminal success; session should stop unless continuous.
    Success,
    /// Success, but the session should keep running (continuous mode).
    Continue,
    Failed,
}

/// A user's paired credentials, as read from `users.txt`.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub pico_public_key: Vec<u8>,
    pub symmetric_key: Vec<u8>,
}

/// One active authentication session.
pub struct Session {
    pub handle: i32,
    pub state: SessionState,
    pub username: String,
    pub token: String,
    pub success: bool,
    pub owner_tag: Option<String>,
    pub config: ConfigOverlay,
    pub reply_slots: ReplySlots,
    /// Deterministic digest of the service identity public key this
    /// session was started against.
    pub commitment: [u8; 32],
}

impl Session {
    pub fn new(handle: i32, username: String, owner_tag: Option<String>, config: ConfigOverlay, commitment: [u8; 32]) -> Self {
        Self {
            handle,
            state: SessionState::Invalid,
            username,
            token: String::new(),
            success: false,
            owner_tag,
            config,
            reply_slots: ReplySlots::new(),
            commitment,
        }
    }

    /// Applies a state transition, returning `false` (and leaving state
    /// unchanged) if the transition is not permitted.
    #[must_use]
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_to_continuing_is_legal_only_path_to_continuing() {
        assert!(SessionState::Started.can_transition_to(SessionState::Continuing));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Continuing));
        assert!(!SessionState::Invalid.can_transition_to(SessionState::Continuing));
    }

    #[test]
    fn only_harvestable_sessions_are_terminal_for_reclamation() {
        assert!(SessionState::Completed.can_transition_to(SessionState::Harvestable));
        assert!(SessionState::Continuing.can_transition_to(SessionState::Harvestable));
        assert!(!SessionState::Harvestable.can_transition_to(SessionState::Started));
    }

    #[test]
    fn service_commitment_is_deterministic_and_key_sensitive() {
        let a = service_commitment(b"key-one");
        let b = service_commitment(b"key-one");
        let c = service_commitment(b"key-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
