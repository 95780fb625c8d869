//! End-to-end orchestrator lifecycle over a real `StreamChannel` socket, with
//! a scripted fake standing in for the external handshake fsm — the
//! handshake itself is out of scope; driving it is what this crate owns.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use continuauth_core::channel::stream::StreamChannel;
use continuauth_core::channel::ByteChannel;
use continuauth_core::handshake::{HandshakeCallbacks, HandshakeFsm};
use continuauth_core::orchestrator::{FsmFactory, OrchestratorOutcome, SessionOrchestrator};
use continuauth_core::session::{AuthStatus, UserRecord};

const SCRIPT_FAIL: u8 = 0;
const SCRIPT_SUCCEED: u8 = 1;
const SCRIPT_CONTINUE: u8 = 2;

/// A scripted stand-in for the external handshake fsm: on the
/// first inbound read it reports whichever [`AuthStatus`] the test
/// configured, then on `stop()` signals session end.
struct ScriptedFsm {
    callbacks: Arc<dyn HandshakeCallbacks>,
    script: Arc<AtomicU8>,
}

#[async_trait]
impl HandshakeFsm for ScriptedFsm {
    async fn start(&mut self, _allowed_users: Vec<UserRecord>) {}

    async fn connected(&mut self) {}

    async fn read(&mut self, _bytes: Vec<u8>) {
        let status = match self.script.load(Ordering::SeqCst) {
            SCRIPT_SUCCEED => AuthStatus::Success,
            SCRIPT_CONTINUE => AuthStatus::Continue,
            _ => AuthStatus::Failed,
        };
        let username = if status == AuthStatus::Failed { String::new() } else { "alice".to_string() };
        self.callbacks.on_authenticated(status, username, Vec::new()).await;
    }

    async fn disconnected(&mut self) {}

    async fn timeout(&mut self) {}

    async fn stop(&mut self) {
        self.callbacks.on_session_ended().await;
    }
}

fn fsm_factory(script: Arc<AtomicU8>) -> FsmFactory {
    Box::new(move |callbacks| Box::new(ScriptedFsm { callbacks, script }) as Box<dyn HandshakeFsm>)
}

fn alice() -> UserRecord {
    UserRecord {
        username: "alice".to_string(),
        pico_public_key: vec![1, 2, 3],
        symmetric_key: b"a shared pairing secret".to_vec(),
    }
}

async fn dial(address: &str) -> Framed<TcpStream, LengthDelimitedCodec> {
    let port: u16 = address.rsplit(':').next().unwrap().parse().unwrap();
    let stream = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(("127.0.0.1", port)))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Happy path: a peer connects, sends one frame, the fsm reports
/// success, and the orchestrator reports `Authenticated` then, once the
/// channel fully quiesces, `StopComplete` exactly once.
#[tokio::test]
async fn successful_non_continuous_handshake_authenticates_then_stops() {
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let channel: Box<dyn ByteChannel> = Box::new(StreamChannel::new("test-host".to_string(), channel_tx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let script = Arc::new(AtomicU8::new(SCRIPT_SUCCEED));

    let (orchestrator, address) = SessionOrchestrator::start(
        7,
        channel,
        channel_rx,
        fsm_factory(script),
        vec![alice()],
        None,
        outcome_tx,
    )
    .await
    .expect("orchestrator should start");

    assert_eq!(orchestrator.handle(), 7);

    let mut peer = dial(&address).await;
    peer.send(Bytes::from_static(b"hello")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
        .await
        .expect("timed out waiting for Authenticated")
        .expect("channel closed early");
    match outcome {
        OrchestratorOutcome::Authenticated { handle, username, continuing, .. } => {
            assert_eq!(handle, 7);
            assert_eq!(username, "alice");
            assert!(!continuing);
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
        .await
        .expect("timed out waiting for StopComplete")
        .expect("channel closed early");
    assert!(matches!(outcome, OrchestratorOutcome::StopComplete { handle } if handle == 7));
}

/// Any-user mode with an empty paired-user table still starts a session (no
/// `FilterEmpty`); the handshake simply has nothing to match against and
/// reports failure, same shape as a specific user presenting a wrong
/// credential.
#[tokio::test]
async fn any_user_unpaired_reports_failure_without_lock() {
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let channel: Box<dyn ByteChannel> = Box::new(StreamChannel::new("test-host".to_string(), channel_tx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let script = Arc::new(AtomicU8::new(SCRIPT_FAIL));

    let (_orchestrator, address) = SessionOrchestrator::start(
        11,
        channel,
        channel_rx,
        fsm_factory(script),
        Vec::new(),
        None,
        outcome_tx,
    )
    .await
    .expect("orchestrator should start even with an empty allowed-user table");

    let mut peer = dial(&address).await;
    peer.send(Bytes::from_static(b"unrecognised-credential")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
        .await
        .expect("timed out waiting for Failed")
        .expect("channel closed early");
    assert!(matches!(
        outcome,
        OrchestratorOutcome::Failed { handle: 11, lock_user: None }
    ));
}

/// A handshake that reports `Failed` yields a `Failed` outcome with no lock
/// request (the session never reached a successful/continuing state). This
/// is the specific-user-wrong-credential shape: the orchestrator already
/// filtered to just `alice`'s record, and the scripted fsm reports failure
/// regardless of what the peer actually sent.
#[tokio::test]
async fn failed_handshake_reports_failure_without_lock() {
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let channel: Box<dyn ByteChannel> = Box::new(StreamChannel::new("test-host".to_string(), channel_tx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let script = Arc::new(AtomicU8::new(SCRIPT_FAIL));

    let (_orchestrator, address) = SessionOrchestrator::start(
        3,
        channel,
        channel_rx,
        fsm_factory(script),
        vec![alice()],
        None,
        outcome_tx,
    )
    .await
    .expect("orchestrator should start");

    let mut peer = dial(&address).await;
    peer.send(Bytes::from_static(b"wrong-credential")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
        .await
        .expect("timed out waiting for Failed")
        .expect("channel closed early");
    assert!(matches!(
        outcome,
        OrchestratorOutcome::Failed { handle: 3, lock_user: None }
    ));
}

/// Continuous mode: a successful `Continue` keeps the session open; calling
/// `stop()` afterward drives the fsm's `on_session_ended` and the outcome
/// carries the last-authenticated user as the lock target — the documented
/// "older session stops voluntarily" behavior applies symmetrically to an
/// explicit stop of a still-continuing session, not just to supersession.
#[tokio::test]
async fn continuing_session_reports_lock_user_when_stopped_after_ended() {
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let channel: Box<dyn ByteChannel> = Box::new(StreamChannel::new("test-host".to_string(), channel_tx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let script = Arc::new(AtomicU8::new(SCRIPT_CONTINUE));

    let (orchestrator, address) = SessionOrchestrator::start(
        9,
        channel,
        channel_rx,
        fsm_factory(script),
        vec![alice()],
        None,
        outcome_tx,
    )
    .await
    .expect("orchestrator should start");

    let mut peer = dial(&address).await;
    peer.send(Bytes::from_static(b"hello")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
        .await
        .expect("timed out waiting for Authenticated")
        .expect("channel closed early");
    assert!(matches!(
        outcome,
        OrchestratorOutcome::Authenticated { handle: 9, continuing: true, .. }
    ));

    orchestrator.stop();

    let mut saw_lock_failure = false;
    let mut saw_stop_complete = false;
    for _ in 0..2 {
        let outcome = tokio::time::timeout(Duration::from_secs(2), outcome_rx.recv())
            .await
            .expect("timed out waiting for stop outcomes")
            .expect("channel closed early");
        match outcome {
            OrchestratorOutcome::Failed { handle: 9, lock_user: Some(user) } => {
                assert_eq!(user, "alice");
                saw_lock_failure = true;
            }
            OrchestratorOutcome::StopComplete { handle: 9 } => saw_stop_complete = true,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(saw_lock_failure && saw_stop_complete);
}
