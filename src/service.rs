//! The service loop: a single-threaded event reactor that owns the session
//! registry and every live session's state, fed exclusively through one
//! `LoopEvent` channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::beacon::BeaconTransport;
use crate::channel::rvp::RvpChannel;
use crate::channel::stream::StreamChannel;
use crate::channel::attr::{AttrChannel, RadioStack};
use crate::channel::ByteChannel;
use crate::config::{ChannelType, ConfigOverlay};
use crate::error::ConfigError;
use crate::handshake::HandshakeCallbacks;
use crate::handshake::HandshakeFsm;
use crate::lock;
use crate::orchestrator::{self, BeaconStart, FsmFactory, OrchestratorOutcome, SessionOrchestrator};
use crate::registry::SessionRegistry;
use crate::session::{service_commitment, SessionState, UserRecord};
use crate::userlist;

/// Builds a fresh external handshake fsm wired to the callbacks the
/// orchestrator gives it. One implementation per host platform; the core
/// never constructs an fsm itself.
pub trait HandshakeFsmBuilder: Send + Sync {
    fn build(&self, callbacks: Arc<dyn HandshakeCallbacks>) -> Box<dyn HandshakeFsm>;
}

/// Builds a fresh radio-stack collaborator for an `AttrChannel` session. Only
/// needed if `channel_type = attr` is ever selected.
pub trait RadioStackBuilder: Send + Sync {
    fn build(&self) -> Box<dyn RadioStack>;
}

/// Everything the loop needs that does not change session-to-session.
pub struct ServiceConfig {
    pub base_config_dir: String,
    pub lock_command: String,
    pub host_identity: String,
    pub watchdog_duration: std::time::Duration,
    pub service_name: String,
    pub beacon_transport: Arc<dyn BeaconTransport>,
    pub fsm_builder: Arc<dyn HandshakeFsmBuilder>,
    pub radio_stack_builder: Option<Arc<dyn RadioStackBuilder>>,
}

/// Requests and signals accepted by the loop. Everything the
/// loop reacts to — external calls, per-session orchestrator completions,
/// and owner-loss notifications — arrives as one of these over one channel,
/// so the loop body itself never awaits anything but this receive.
pub enum LoopEvent {
    StartAuth {
        user: String,
        parameters: String,
        owner_tag: Option<String>,
        reply: oneshot::Sender<(i32, String, bool)>,
    },
    CompleteAuth {
        handle: i32,
        reply: oneshot::Sender<(String, String, bool)>,
    },
    Exit {
        reply: oneshot::Sender<()>,
    },
    OwnerLost {
        owner_tag: String,
    },
    Orchestrator(OrchestratorOutcome),
}

/// The three methods and one signal at the IPC boundary. The
/// crate does not pick an IPC broker; [`ServiceHandle`] exercises the same
/// call shapes in-process for tests and for the demo binary.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    async fn start_auth(&self, user: String, parameters: String, owner_tag: Option<String>) -> (i32, String, bool);
    async fn complete_auth(&self, handle: i32) -> (String, String, bool);
    async fn exit(&self);
    async fn owner_lost(&self, old_owner_tag: String);
}

/// A cheap, cloneable front for [`LoopEvent`] — the in-process analogue of
/// whatever IPC broker a real deployment picks.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

#[async_trait]
impl DaemonApi for ServiceHandle {
    async fn start_auth(&self, user: String, parameters: String, owner_tag: Option<String>) -> (i32, String, bool) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LoopEvent::StartAuth { user, parameters, owner_tag, reply })
            .is_err()
        {
            return (-1, String::new(), false);
        }
        rx.await.unwrap_or((-1, String::new(), false))
    }

    async fn complete_auth(&self, handle: i32) -> (String, String, bool) {
        if handle < 0 {
            return (String::new(), String::new(), false);
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LoopEvent::CompleteAuth { handle, reply }).is_err() {
            return (String::new(), String::new(), false);
        }
        rx.await.unwrap_or((String::new(), String::new(), false))
    }

    async fn exit(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LoopEvent::Exit { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn owner_lost(&self, old_owner_tag: String) {
        let _ = self.tx.send(LoopEvent::OwnerLost { owner_tag: old_owner_tag });
    }
}

#[derive(Serialize)]
struct BeaconPayload {
    service_name: String,
    service_public_key: String,
    signature: String,
    channel_address: String,
}

/// Builds the signed beacon payload: service display name,
/// service public key, signature over the payload by the service identity
/// key, and the channel address. The signature covers the concatenation of
/// service name, public key, and address bytes.
fn build_beacon_payload(service_name: &str, verifying_key_bytes: &[u8], signing_key_bytes: &[u8; 32], channel_address: &str) -> Vec<u8> {
    let signing_key = SigningKey::from_bytes(signing_key_bytes);
    let mut to_sign = service_name.as_bytes().to_vec();
    to_sign.extend_from_slice(verifying_key_bytes);
    to_sign.extend_from_slice(channel_address.as_bytes());
    let signature = signing_key.sign(&to_sign);

    let payload = BeaconPayload {
        service_name: service_name.to_string(),
        service_public_key: base64::engine::general_purpose::STANDARD.encode(verifying_key_bytes),
        signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        channel_address: channel_address.to_string(),
    };
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// The single owner of the registry and every session's state.
pub struct ServiceLoop {
    registry: SessionRegistry,
    orchestrators: HashMap<i32, SessionOrchestrator>,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    event_rx: mpsc::UnboundedReceiver<LoopEvent>,
    users: Vec<UserRecord>,
    beacon_targets: Vec<String>,
    config: ServiceConfig,
    signing_key: SigningKey,
    verifying_key_bytes: Vec<u8>,
    commitment: [u8; 32],
}

impl ServiceLoop {
    /// Reads the on-disk layout under `config.base_config_dir`
    /// and builds the loop. Returns the loop (call [`run`](Self::run) to
    /// drive it) and a handle to talk to it.
    pub fn new(config: ServiceConfig) -> Result<(Self, ServiceHandle), ConfigError> {
        let users = userlist::load_users(format!("{}users.txt", config.base_config_dir))?;
        let beacon_targets = userlist::load_bluetooth_targets(format!("{}bluetooth.txt", config.base_config_dir))?;
        let private_key_der = userlist::load_der_key(format!("{}service-private-key", config.base_config_dir))?;
        let signing_key = SigningKey::from_pkcs8_der(&private_key_der).map_err(|_| ConfigError::Malformed)?;
        let verifying_key: VerifyingKey = signing_key.verifying_key();
        let verifying_key_bytes = verifying_key.to_bytes().to_vec();
        let commitment = service_commitment(&verifying_key_bytes);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = ServiceHandle { tx: event_tx.clone() };
        let loop_ = Self {
            registry: SessionRegistry::new(),
            orchestrators: HashMap::new(),
            event_tx,
            event_rx,
            users,
            beacon_targets,
            config,
            signing_key,
            verifying_key_bytes,
            commitment,
        };
        Ok((loop_, handle))
    }

    /// Drives the loop until `Exit` is received. The loop body never awaits
    /// anything but this one receive; everything else is either already
    /// resolved synchronously or was posted back as a `LoopEvent` by a
    /// spawned task.
    pub async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            match event {
                LoopEvent::StartAuth { user, parameters, owner_tag, reply } => {
                    let result = self.on_start(user, parameters, owner_tag).await;
                    let _ = reply.send(result);
                }
                LoopEvent::CompleteAuth { handle, reply } => {
                    self.on_complete(handle, reply);
                }
                LoopEvent::Exit { reply } => {
                    self.on_exit();
                    let _ = reply.send(());
                    break;
                }
                LoopEvent::OwnerLost { owner_tag } => {
                    self.on_owner_lost(&owner_tag);
                }
                LoopEvent::Orchestrator(outcome) => {
                    self.on_orchestrator_outcome(outcome).await;
                }
            }
        }
    }

    fn config_txt_path(&self) -> String {
        format!("{}config.txt", self.config.base_config_dir)
    }

    async fn on_start(&mut self, user: String, parameters: String, owner_tag: Option<String>) -> (i32, String, bool) {
        let handle = match self.registry.allocate() {
            Ok(h) => h,
            Err(_) => return (-1, String::new(), false),
        };

        let mut overlay = ConfigOverlay::new();
        if let Err(err) = overlay.load_file(self.config_txt_path()) {
            warn!(%err, "config.txt malformed, retaining defaults");
        }
        if let Err(err) = overlay.overlay_caller(&parameters) {
            warn!(%err, "StartAuth parameters malformed, ignoring caller overlay");
        }

        if let Some(session) = self.registry.get_mut(handle) {
            session.username = user.clone();
            session.owner_tag = owner_tag;
            session.config = overlay.clone();
            session.commitment = self.commitment;
            let _ = session.transition(SessionState::Started);
            debug_assert!(
                session.reply_slots.mark_start_replied(),
                "a freshly allocated session's start reply slot must not already be observed"
            );
        }

        let similar = {
            let new_session = self.registry.get(handle).expect("just allocated");
            self.registry.stop_similar(new_session)
        };
        for other in similar {
            self.stop_session(other);
        }

        let code = format!("session-{handle}");

        match orchestrator::filter_users(&self.users, &user, overlay.any_user) {
            Err(_) => {
                if let Some(session) = self.registry.get_mut(handle) {
                    session.reply_slots.resolve_complete(("".into(), "".into(), false));
                    let _ = session.transition(SessionState::Harvestable);
                }
                (handle, code, true)
            }
            Ok(allowed_users) => match self.start_orchestrator(handle, &overlay, allowed_users).await {
                Ok(()) => (handle, code, true),
                Err(err) => {
                    warn!(%err, "failed to start session orchestrator, releasing handle");
                    self.registry.remove(handle);
                    (-1, String::new(), false)
                }
            },
        }
    }

    async fn start_orchestrator(
        &mut self,
        handle: i32,
        overlay: &ConfigOverlay,
        allowed_users: Vec<UserRecord>,
    ) -> Result<(), crate::error::OrchestratorError> {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let channel: Box<dyn ByteChannel> = match overlay.channel_type {
            ChannelType::Rvp => Box::new(RvpChannel::new(
                overlay.rvp_url_prefix.clone(),
                self.config.watchdog_duration,
                channel_tx,
            )),
            ChannelType::Stream => Box::new(StreamChannel::new(self.config.host_identity.clone(), channel_tx)),
            ChannelType::Attr => {
                let builder = self
                    .config
                    .radio_stack_builder
                    .as_ref()
                    .ok_or_else(|| crate::error::OrchestratorError::Handshake("no radio stack configured".into()))?;
                Box::new(AttrChannel::new(
                    builder.build(),
                    self.verifying_key_bytes.clone(),
                    overlay.continuous,
                    channel_tx,
                    true,
                ))
            }
        };

        let fsm_builder = self.config.fsm_builder.clone();
        let fsm_factory: FsmFactory = Box::new(move |callbacks| fsm_builder.build(callbacks));

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let loop_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                if loop_tx.send(LoopEvent::Orchestrator(outcome)).is_err() {
                    break;
                }
            }
        });

        let beacon = if overlay.beacons && !self.beacon_targets.is_empty() {
            let service_name = self.config.service_name.clone();
            let verifying_key_bytes = self.verifying_key_bytes.clone();
            let signing_key_bytes = self.signing_key.to_bytes();
            Some(BeaconStart {
                transport: self.config.beacon_transport.clone(),
                targets: self.beacon_targets.clone(),
                build_payload: Box::new(move |address| {
                    build_beacon_payload(&service_name, &verifying_key_bytes, &signing_key_bytes, address)
                }),
            })
        } else {
            None
        };

        let (orchestrator, _address) = SessionOrchestrator::start(
            handle,
            channel,
            channel_rx,
            fsm_factory,
            allowed_users,
            beacon,
            outcome_tx,
        )
        .await?;

        self.orchestrators.insert(handle, orchestrator);
        Ok(())
    }

    /// Binds the `CompleteAuth` reply directly to the session's complete
    /// reply slot, which already knows whether to resolve immediately or
    /// wait. A small forwarding task relays the eventual result
    /// to the original caller without looping back through `LoopEvent`.
    fn on_complete(&mut self, handle: i32, reply: oneshot::Sender<(String, String, bool)>) {
        let Some(session) = self.registry.get_mut(handle) else {
            let _ = reply.send((String::new(), String::new(), false));
            return;
        };
        let rx = session.reply_slots.bind_complete_waiter();
        tokio::spawn(async move {
            let result = rx.await.unwrap_or((String::new(), String::new(), false));
            let _ = reply.send(result);
        });
    }

    async fn on_orchestrator_outcome(&mut self, outcome: OrchestratorOutcome) {
        match outcome {
            OrchestratorOutcome::Authenticated { handle, username, token, continuing } => {
                if let Some(session) = self.registry.get_mut(handle) {
                    session.token = token.clone();
                    session.success = true;
                    let next = if continuing { SessionState::Continuing } else { SessionState::Completed };
                    let _ = session.transition(next);
                    session.reply_slots.resolve_complete((username, token, true));
                }
                if !continuing {
                    self.stop_session(handle);
                }
            }
            OrchestratorOutcome::Failed { handle, lock_user } => {
                if let Some(session) = self.registry.get_mut(handle) {
                    session.success = false;
                    session.reply_slots.fail_if_unresolved();
                    let _ = session.transition(SessionState::Harvestable);
                }
                if let Some(user) = lock_user {
                    let lock_command = self.config.lock_command.clone();
                    tokio::spawn(async move {
                        lock::invoke_lock(&lock_command, &user).await;
                    });
                }
                self.orchestrators.remove(&handle);
            }
            OrchestratorOutcome::StopComplete { handle } => {
                if let Some(session) = self.registry.get_mut(handle) {
                    let _ = session.transition(SessionState::Harvestable);
                }
                self.orchestrators.remove(&handle);
            }
        }
    }

    fn stop_session(&mut self, handle: i32) {
        if let Some(orchestrator) = self.orchestrators.get(&handle) {
            orchestrator.stop();
        } else if let Some(session) = self.registry.get_mut(handle) {
            // No orchestrator ever started (e.g. FilterEmpty path); the
            // session is already resolved and can be harvested directly.
            let _ = session.transition(SessionState::Harvestable);
        }
    }

    fn on_owner_lost(&mut self, owner_tag: &str) {
        let affected = self.registry.owner_lost(owner_tag);
        for handle in affected {
            if let Some(session) = self.registry.get_mut(handle) {
                session.reply_slots.fail_if_unresolved();
            }
            self.stop_session(handle);
        }
        info!(%owner_tag, "owner lost, cancelling affected sessions");
    }

    fn on_exit(&mut self) {
        for (_, orchestrator) in self.orchestrators.drain() {
            orchestrator.stop();
        }
    }
}
