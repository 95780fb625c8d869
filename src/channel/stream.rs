//! Stream-socket [`ByteChannel`] with length-prefixed framing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{ByteChannel, ChannelErrorKind, ChannelEvent, EventSink};
use crate::error::ChannelError;

/// First channel number a [`StreamChannel`] will try to bind; channels are
/// tried in `[FIRST_CHANNEL, FIRST_CHANNEL + CHANNEL_COUNT)`.
const FIRST_CHANNEL: u16 = 1;
const CHANNEL_COUNT: u16 = 31;
const BASE_PORT: u16 = 47_900;
const MAX_READ_CHUNK: usize = 1024 * 16;

type SharedFramed = Arc<AsyncMutex<Framed<TcpStream, LengthDelimitedCodec>>>;

/// Length-prefixed TCP channel. Binds the first free port in the reserved
/// channel range and accepts exactly one peer at a time.
pub struct StreamChannel {
    host_identity: String,
    event_tx: EventSink,
    accept_task: Option<JoinHandle<()>>,
    peer_connected: Arc<AtomicBool>,
    cancel_tx: Option<oneshot::Sender<()>>,
    current_peer: Arc<AsyncMutex<Option<SharedFramed>>>,
    write_busy: Arc<AtomicBool>,
}

impl StreamChannel {
    pub fn new(host_identity: String, event_tx: EventSink) -> Self {
        Self {
            host_identity,
            event_tx,
            accept_task: None,
            peer_connected: Arc::new(AtomicBool::new(false)),
            cancel_tx: None,
            current_peer: Arc::new(AsyncMutex::new(None)),
            write_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn bind_first_free() -> Result<(TcpListener, u16), ChannelError> {
        for channel in FIRST_CHANNEL..(FIRST_CHANNEL + CHANNEL_COUNT) {
            let port = BASE_PORT + channel;
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok((listener, channel));
            }
        }
        Err(ChannelError::BindFailed)
    }
}

#[async_trait]
impl ByteChannel for StreamChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        let (listener, channel) = Self::bind_first_free().await?;
        let local_port = listener
            .local_addr()
            .map_err(|_| ChannelError::BindFailed)?
            .port();
        let address = format!("{}:{}:{}", self.host_identity, channel, local_port);

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.cancel_tx = Some(cancel_tx);

        let event_tx = self.event_tx.clone();
        let peer_connected = self.peer_connected.clone();
        let current_peer = self.current_peer.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    accepted = listener.accept() => {
                        let (socket, _peer_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(_) => continue,
                        };
                        if peer_connected.swap(true, Ordering::SeqCst) {
                            // Only one concurrent peer: reject further connections.
                            drop(socket);
                            continue;
                        }
                        let _ = event_tx.send(ChannelEvent::Connected);
                        let framed: SharedFramed =
                            Arc::new(AsyncMutex::new(Framed::new(socket, LengthDelimitedCodec::new())));
                        *current_peer.lock().await = Some(framed.clone());

                        read_until_disconnect(framed, event_tx.clone(), peer_connected.clone(), current_peer.clone())
                            .await;
                    }
                }
            }
        }));

        Ok(address)
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let framed = self
            .current_peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| ChannelError::Fatal("no connected peer".into()))?;
        if self
            .write_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChannelError::Busy);
        }
        let mut guard = framed.lock().await;
        let result = guard.send(Bytes::from(bytes)).await;
        drop(guard);
        self.write_busy.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                let _ = self.event_tx.send(ChannelEvent::SendComplete);
                Ok(())
            }
            Err(err) => Err(ChannelError::Transient(err.to_string())),
        }
    }

    fn disconnect(&mut self) {
        if self.peer_connected.swap(false, Ordering::SeqCst) {
            let current_peer = self.current_peer.clone();
            tokio::spawn(async move {
                *current_peer.lock().await = None;
            });
            let _ = self.event_tx.send(ChannelEvent::Disconnected);
        }
    }

    fn cancel_pending_reads(&mut self) {
        // Reads are driven by the accept task's framed stream; cancelling
        // here means we stop trusting in-flight frames but keep listening,
        // matching the contract that a fresh read resumes afterwards.
        let _ = self
            .event_tx
            .send(ChannelEvent::Error(ChannelErrorKind::TryAgain));
    }
}

async fn read_until_disconnect(
    framed: SharedFramed,
    event_tx: EventSink,
    peer_connected: Arc<AtomicBool>,
    current_peer: Arc<AsyncMutex<Option<SharedFramed>>>,
) {
    loop {
        let next = {
            let mut guard = framed.lock().await;
            guard.next().await
        };
        match next {
            Some(Ok(frame)) => {
                let limited = if frame.len() > MAX_READ_CHUNK {
                    frame.slice(..MAX_READ_CHUNK)
                } else {
                    frame
                };
                let _ = event_tx.send(ChannelEvent::Incoming(limited.to_vec()));
            }
            Some(Err(_)) => {
                let _ = event_tx.send(ChannelEvent::Error(ChannelErrorKind::Malformed));
            }
            None => {
                peer_connected.store(false, Ordering::SeqCst);
                *current_peer.lock().await = None;
                let _ = event_tx.send(ChannelEvent::Disconnected);
                return;
            }
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
