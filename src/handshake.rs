//! The external handshake state machine's callback contract.
//!
//! The cryptographic handshake itself is out of scope: this module
//! only defines the fixed contract the orchestrator uses to drive it and to
//! receive its callbacks. Tests exercise the orchestrator against a fake
//! that implements [`HandshakeFsm`].

use async_trait::async_trait;

use crate::session::AuthStatus;

/// Callbacks the fsm invokes into the orchestrator.
#[async_trait]
pub trait HandshakeCallbacks: Send + Sync {
    async fn write(&self, bytes: Vec<u8>);
    async fn set_timeout(&self, ms: u64);
    async fn on_error(&self);
    async fn on_listen(&self);
    async fn on_disconnect(&self);
    /// `status` distinguishes terminal success from "continue" (continuous
    /// mode). On any non-`Failed` status the fsm also hands back which user
    /// authenticated and the still-encrypted extra-data blob the orchestrator
    /// decrypts with that user's symmetric key to obtain the token.
    async fn on_authenticated(&self, status: AuthStatus, authenticated_user: String, received_extra_data: Vec<u8>);
    async fn on_session_ended(&self);
    async fn on_status_updated(&self, state: String);
}

/// The opaque external handshake state machine.
///
/// Implementors own the cryptographic protocol; this crate only forwards
/// transport-side events into it and reacts to its callbacks through
/// [`HandshakeCallbacks`].
#[async_trait]
pub trait HandshakeFsm: Send {
    async fn start(&mut self, allowed_users: Vec<crate::session::UserRecord>);
    async fn connected(&mut self);
    async fn read(&mut self, bytes: Vec<u8>);
    async fn disconnected(&mut self);
    async fn timeout(&mut self);
    async fn stop(&mut self);
}
