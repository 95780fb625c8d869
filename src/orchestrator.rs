//! Session orchestrator: composes a byte channel, a beacon campaign, and the
//! external handshake fsm; dispatches their callbacks into session-level
//! outcomes the service loop reacts to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::beacon::{BeaconTransport, DynBeaconEmitter};
use crate::channel::{ByteChannel, ChannelEvent};
use crate::error::OrchestratorError;
use crate::handshake::{HandshakeCallbacks, HandshakeFsm};
use crate::session::{AuthStatus, UserRecord};

const TOKEN_NONCE_LEN: usize = 12;
const TOKEN_HKDF_INFO: &[u8] = b"continuauth-token-v1";

/// Everything needed to start a beacon campaign alongside a session. The
/// payload is built lazily from the channel address, since that address is
/// only known once `listen()` returns — after this struct must already
/// exist.
pub struct BeaconStart {
    pub transport: Arc<dyn BeaconTransport>,
    pub targets: Vec<String>,
    pub build_payload: Box<dyn FnOnce(&str) -> Vec<u8> + Send>,
}

/// Outcomes reported one level up to the service loop, which is the only
/// code allowed to mutate `Session`/`SessionRegistry` state.
#[derive(Debug)]
pub enum OrchestratorOutcome {
    Authenticated {
        handle: i32,
        username: String,
        token: String,
        continuing: bool,
    },
    Failed {
        handle: i32,
        lock_user: Option<String>,
    },
    StopComplete {
        handle: i32,
    },
}

/// Builds the external handshake fsm once its callback sink exists; lets the
/// caller supply whatever concrete fsm wiring it needs without this crate
/// knowing about it.
pub type FsmFactory = Box<dyn FnOnce(Arc<dyn HandshakeCallbacks>) -> Box<dyn HandshakeFsm> + Send>;

/// Filters the user table: the full table if `any_user`,
/// otherwise only rows matching `requested_username`. An empty result for a
/// specific request is [`OrchestratorError::FilterEmpty`] — the session must
/// fail before the fsm ever starts, since an empty table would otherwise
/// read to the fsm as "accept anyone".
pub fn filter_users(
    users: &[UserRecord],
    requested_username: &str,
    any_user: bool,
) -> Result<Vec<UserRecord>, OrchestratorError> {
    if any_user {
        return Ok(users.to_vec());
    }
    let filtered: Vec<UserRecord> = users
        .iter()
        .filter(|u| u.username == requested_username)
        .cloned()
        .collect();
    if filtered.is_empty() {
        return Err(OrchestratorError::FilterEmpty);
    }
    Ok(filtered)
}

/// A live per-session orchestrator handle; the service loop holds one of
/// these per session and drops/`stop()`s it as the session's lifecycle
/// dictates.
pub struct SessionOrchestrator {
    handle: i32,
    command_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Stop,
}

impl SessionOrchestrator {
    /// Binds the channel, starts the beacon campaign (if any) and the fsm,
    /// then spawns the task that owns all three for the life of the session.
    /// Returns once the channel is listening — the handshake has not yet run.
    pub async fn start(
        handle: i32,
        mut channel: Box<dyn ByteChannel>,
        channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        fsm_factory: FsmFactory,
        allowed_users: Vec<UserRecord>,
        beacon: Option<BeaconStart>,
        outcome_tx: mpsc::UnboundedSender<OrchestratorOutcome>,
    ) -> Result<(Self, String), OrchestratorError> {
        let address = channel.listen().await?;

        let mut emitter = beacon.map(|b| {
            let payload = (b.build_payload)(&address);
            DynBeaconEmitter::new(Arc::new(b.transport), payload, b.targets)
        });
        if let Some(emitter) = emitter.as_mut() {
            emitter.start()?;
        }

        let users_by_name: HashMap<String, UserRecord> = allowed_users
            .iter()
            .map(|u| (u.username.clone(), u.clone()))
            .collect();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let callbacks: Arc<dyn HandshakeCallbacks> = Arc::new(ForwardingCallbacks { tx: callback_tx });
        let mut fsm = fsm_factory(callbacks);
        fsm.start(allowed_users).await;

        let task = tokio::spawn(run_session_loop(
            handle,
            channel,
            channel_rx,
            fsm,
            emitter,
            users_by_name,
            command_rx,
            callback_rx,
            outcome_tx,
        ));

        Ok((
            Self {
                handle,
                command_tx,
                task,
            },
            address,
        ))
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// Idempotent: a second call after stopping has already begun is a no-op
    /// because the receiving task drops `command_rx`'s sender end once it
    /// exits, at which point the send silently fails.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// fsm → orchestrator callback, relayed across the task boundary so the
/// session's entire mutable state is owned by exactly one task.
enum FsmCallback {
    Write(Vec<u8>),
    SetTimeout(u64),
    Error,
    Listen,
    Disconnect,
    Authenticated {
        status: AuthStatus,
        username: String,
        extra_data: Vec<u8>,
    },
    SessionEnded,
    StatusUpdated(String),
}

struct ForwardingCallbacks {
    tx: mpsc::UnboundedSender<FsmCallback>,
}

#[async_trait]
impl HandshakeCallbacks for ForwardingCallbacks {
    async fn write(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(FsmCallback::Write(bytes));
    }

    async fn set_timeout(&self, ms: u64) {
        let _ = self.tx.send(FsmCallback::SetTimeout(ms));
    }

    async fn on_error(&self) {
        let _ = self.tx.send(FsmCallback::Error);
    }

    async fn on_listen(&self) {
        let _ = self.tx.send(FsmCallback::Listen);
    }

    async fn on_disconnect(&self) {
        let _ = self.tx.send(FsmCallback::Disconnect);
    }

    async fn on_authenticated(&self, status: AuthStatus, authenticated_user: String, received_extra_data: Vec<u8>) {
        let _ = self.tx.send(FsmCallback::Authenticated {
            status,
            username: authenticated_user,
            extra_data: received_extra_data,
        });
    }

    async fn on_session_ended(&self) {
        let _ = self.tx.send(FsmCallback::SessionEnded);
    }

    async fn on_status_updated(&self, state: String) {
        let _ = self.tx.send(FsmCallback::StatusUpdated(state));
    }
}

/// Decrypts `received_extra_data` with the authenticated user's symmetric
/// key to obtain the plaintext token. Layout: a 12-byte
/// ChaCha20-Poly1305 nonce followed by the ciphertext; the per-record
/// symmetric key is stretched through HKDF-SHA256 before use so the raw
/// paired key is never fed to the AEAD directly.
fn decrypt_token(symmetric_key: &[u8], extra_data: &[u8]) -> Option<String> {
    if extra_data.len() < TOKEN_NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = extra_data.split_at(TOKEN_NONCE_LEN);
    let hk = Hkdf::<Sha256>::new(None, symmetric_key);
    let mut derived = [0u8; 32];
    hk.expand(TOKEN_HKDF_INFO, &mut derived).ok()?;
    let cipher = ChaCha20Poly1305::new_from_slice(&derived).ok()?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
    String::from_utf8(plaintext).ok()
}

#[allow(clippy::too_many_arguments)]
async fn run_session_loop(
    handle: i32,
    mut channel: Box<dyn ByteChannel>,
    mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    mut fsm: Box<dyn HandshakeFsm>,
    mut emitter: Option<DynBeaconEmitter>,
    users_by_name: HashMap<String, UserRecord>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut callback_rx: mpsc::UnboundedReceiver<FsmCallback>,
    outcome_tx: mpsc::UnboundedSender<OrchestratorOutcome>,
) {
    let mut stopping = false;
    let mut connected = false;
    // (username, was continuing) of the last successful authentication,
    // kept so an error arriving afterward knows whether to issue a lock.
    let mut last_success: Option<(String, bool)> = None;

    loop {
        tokio::select! {
            // Biased so a callback already queued by this same iteration's
            // `begin_stop` (e.g. fsm.stop() enqueuing SessionEnded just
            // before channel.disconnect() enqueues Disconnected) is always
            // drained before the channel-side event that could otherwise
            // satisfy the stop predicate below and break the loop first,
            // silently discarding the callback.
            biased;

            cb = callback_rx.recv() => {
                let Some(cb) = cb else { break };
                match cb {
                    FsmCallback::Write(bytes) => {
                        let _ = channel.send(bytes).await;
                    }
                    FsmCallback::SetTimeout(_ms) => {
                        // The fsm owns its own timeout clock; this core only
                        // relays the request, it does not arm a timer itself.
                    }
                    FsmCallback::Listen => {}
                    FsmCallback::Disconnect => {
                        channel.disconnect();
                    }
                    FsmCallback::Error => {
                        let lock_user = last_success
                            .take()
                            .filter(|(_, continuing)| *continuing)
                            .map(|(user, _)| user);
                        let _ = outcome_tx.send(OrchestratorOutcome::Failed { handle, lock_user });
                        begin_stop(&mut stopping, &mut channel, &mut emitter);
                    }
                    FsmCallback::Authenticated { status, username, extra_data } => {
                        match status {
                            AuthStatus::Failed => {
                                let _ = outcome_tx.send(OrchestratorOutcome::Failed { handle, lock_user: None });
                                begin_stop(&mut stopping, &mut channel, &mut emitter);
                            }
                            AuthStatus::Success | AuthStatus::Continue => {
                                let continuing = matches!(status, AuthStatus::Continue);
                                let token = users_by_name
                                    .get(&username)
                                    .and_then(|u| decrypt_token(&u.symmetric_key, &extra_data))
                                    .unwrap_or_default();
                                last_success = Some((username.clone(), continuing));
                                let _ = outcome_tx.send(OrchestratorOutcome::Authenticated {
                                    handle,
                                    username,
                                    token,
                                    continuing,
                                });
                                if !continuing {
                                    begin_stop(&mut stopping, &mut channel, &mut emitter);
                                }
                            }
                        }
                    }
                    FsmCallback::SessionEnded => {
                        let lock_user = last_success
                            .take()
                            .filter(|(_, continuing)| *continuing)
                            .map(|(user, _)| user);
                        if let Some(lock_user) = lock_user {
                            let _ = outcome_tx.send(OrchestratorOutcome::Failed { handle, lock_user: Some(lock_user) });
                        }
                        begin_stop(&mut stopping, &mut channel, &mut emitter);
                    }
                    FsmCallback::StatusUpdated(state) => {
                        info!(handle, %state, "handshake status updated");
                    }
                }
            }
            event = channel_rx.recv() => {
                match event {
                    Some(ChannelEvent::Connected) => {
                        connected = true;
                        fsm.connected().await;
                    }
                    Some(ChannelEvent::Incoming(bytes)) => {
                        fsm.read(bytes).await;
                    }
                    Some(ChannelEvent::SendComplete) => {}
                    Some(ChannelEvent::Disconnected) => {
                        connected = false;
                        fsm.disconnected().await;
                    }
                    Some(ChannelEvent::Error(_)) => {
                        // Retryable errors are already handled inside the
                        // adapter; anything fatal surfaces as Disconnected.
                    }
                    Some(ChannelEvent::Timeout) => {
                        fsm.timeout().await;
                    }
                    None => break,
                }
            }
            cmd = command_rx.recv(), if !stopping => {
                if cmd.is_some() {
                    fsm.stop().await;
                    begin_stop(&mut stopping, &mut channel, &mut emitter);
                }
            }
        }

        if stopping && !connected && emitter.as_ref().map_or(true, |e| e.is_finished()) {
            let _ = outcome_tx.send(OrchestratorOutcome::StopComplete { handle });
            break;
        }
    }
}

fn begin_stop(stopping: &mut bool, channel: &mut Box<dyn ByteChannel>, emitter: &mut Option<DynBeaconEmitter>) {
    if *stopping {
        return;
    }
    *stopping = true;
    channel.disconnect();
    channel.cancel_pending_reads();
    if let Some(emitter) = emitter.as_mut() {
        emitter.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, key: &[u8]) -> UserRecord {
        UserRecord {
            username: name.to_string(),
            pico_public_key: vec![],
            symmetric_key: key.to_vec(),
        }
    }

    #[test]
    fn any_user_passes_full_table_through() {
        let users = vec![user("alice", b"k1"), user("bob", b"k2")];
        let filtered = filter_users(&users, "", true).unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn specific_user_filters_to_matching_rows() {
        let users = vec![user("alice", b"k1"), user("bob", b"k2")];
        let filtered = filter_users(&users, "alice", false).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].username, "alice");
    }

    #[test]
    fn unknown_user_is_filter_empty() {
        let users = vec![user("alice", b"k1")];
        assert!(matches!(
            filter_users(&users, "nosuchuser", false),
            Err(OrchestratorError::FilterEmpty)
        ));
    }

    /// `any_user` with zero paired users still starts the session (the
    /// handshake itself later fails because no credential can match, but the
    /// filter never rejects an any-user request the way it rejects a
    /// specific, unmatched username).
    #[test]
    fn any_user_with_no_paired_users_is_not_filter_empty() {
        let filtered = filter_users(&[], "", true).unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn decrypt_token_round_trips_through_hkdf_and_aead() {
        use chacha20poly1305::aead::Aead;
        use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};

        let symmetric_key = b"a shared pairing secret";
        let hk = Hkdf::<Sha256>::new(None, symmetric_key.as_slice());
        let mut derived = [0u8; 32];
        hk.expand(TOKEN_HKDF_INFO, &mut derived).unwrap();
        let cipher = ChaCha20Poly1305::new_from_slice(&derived).unwrap();
        let nonce_bytes = [7u8; 12];
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, b"Passuser0".as_slice()).unwrap();

        let mut extra_data = nonce_bytes.to_vec();
        extra_data.extend_from_slice(&ciphertext);

        let token = decrypt_token(symmetric_key, &extra_data).unwrap();
        assert_eq!(token, "Passuser0");
    }

    #[test]
    fn decrypt_token_rejects_short_payloads() {
        assert!(decrypt_token(b"key", &[0u8; 4]).is_none());
    }
}
