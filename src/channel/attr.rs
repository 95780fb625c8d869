//! Attribute-based radio [`ByteChannel`].
//!
//! The actual radio/advertising stack is an external collaborator — the
//! host bus/radio management daemon; this module models the local state
//! machine and the chunked write-assemble /
//! read-notify framing, driven by events the stack reports through
//! [`RadioStack`] and [`AttrChannel::on_stack_event`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{ChannelErrorKind, ChannelEvent, EventSink};
use crate::error::ChannelError;

/// Maximum payload carried in one outbound notification chunk.
pub const MAX_SEND: usize = 180;

/// Recycle cadence — a workaround for host-radio state leaks in unstable
/// radio daemons, not a functional requirement. Implementers on a
/// healthier radio stack MAY disable it; the states below remain mandatory.
pub const RECYCLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrState {
    Dormant,
    Initialising,
    Initialised,
    Advertising,
    AdvertisingContinuous,
    Connected,
    Unadvertising,
    Unadvertised,
    Finalising,
    Finalised,
}

impl AttrState {
    /// States from which a recycle request proceeds immediately.
    fn recycle_allowed(self) -> bool {
        matches!(
            self,
            AttrState::Initialised | AttrState::Advertising | AttrState::Unadvertised
        )
    }

    /// States during which a recycle request must be deferred.
    fn recycle_deferred(self) -> bool {
        matches!(
            self,
            AttrState::Initialising
                | AttrState::Unadvertising
                | AttrState::Finalising
                | AttrState::Connected
                | AttrState::AdvertisingContinuous
        )
    }
}

/// External radio/advertising stack the channel drives (host bus daemon).
#[async_trait]
pub trait RadioStack: Send {
    async fn initialise(&mut self, service_uuid: [u8; 16]) -> Result<(), ChannelError>;
    async fn start_advertising(&mut self, continuous: bool) -> Result<(), ChannelError>;
    async fn stop_advertising(&mut self) -> Result<(), ChannelError>;
    async fn finalise(&mut self) -> Result<(), ChannelError>;
    async fn notify(&mut self, chunk: &[u8]) -> Result<(), ChannelError>;
}

/// Events the radio stack reports back asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    Initialised,
    AdvertisingStarted,
    PeerConnected,
    PeerDisconnected,
    Unadvertised,
    Finalised,
}

struct Reassembly {
    started: bool,
    remaining: u32,
    buffer: Vec<u8>,
}

impl Reassembly {
    fn new() -> Self {
        Self {
            started: false,
            remaining: 0,
            buffer: Vec::new(),
        }
    }

    fn reset(&mut self) {
        *self = Reassembly::new();
    }
}

/// Computes the service UUID: a hash of the service identity public key with
/// the last byte's low bit set in continuous mode, clear otherwise.
pub fn service_uuid(service_public_key: &[u8], continuous: bool) -> [u8; 16] {
    let digest = Sha256::digest(service_public_key);
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&digest[..16]);
    if continuous {
        uuid[15] |= 0x01;
    } else {
        uuid[15] &= !0x01;
    }
    uuid
}

/// Attribute-based (BLE-style) channel: one write-only inbound attribute,
/// one notify outbound attribute, driven by an external [`RadioStack`].
pub struct AttrChannel {
    stack: Box<dyn RadioStack>,
    event_tx: EventSink,
    state: Arc<Mutex<AttrState>>,
    reassembly: Arc<Mutex<Reassembly>>,
    continuous: bool,
    service_public_key: Vec<u8>,
    recycle_pending: Arc<Mutex<bool>>,
    recycle_enabled: bool,
    /// Guards `disconnect()`/`PeerDisconnected` so `ChannelEvent::Disconnected`
    /// is emitted at most once per connection, regardless of which of the
    /// two paths observes the loss first.
    connected: Arc<AtomicBool>,
}

impl AttrChannel {
    pub fn new(
        stack: Box<dyn RadioStack>,
        service_public_key: Vec<u8>,
        continuous: bool,
        event_tx: EventSink,
        recycle_enabled: bool,
    ) -> Self {
        Self {
            stack,
            event_tx,
            state: Arc::new(Mutex::new(AttrState::Dormant)),
            reassembly: Arc::new(Mutex::new(Reassembly::new())),
            continuous,
            service_public_key,
            recycle_pending: Arc::new(Mutex::new(false)),
            recycle_enabled,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> AttrState {
        *self.state.lock()
    }

    /// Feeds a reported payload from the inbound write attribute.
    ///
    /// Inbound writes carry a 1-byte chunk index. The first write of a new
    /// frame (when no reassembly is in progress) carries a 4-byte
    /// big-endian remaining-length header in bytes `1..5`, with payload in
    /// `5..`; subsequent writes carry only the index byte followed by
    /// payload. When `remaining` reaches zero the complete frame is
    /// delivered as [`ChannelEvent::Incoming`].
    pub fn on_attribute_write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut reassembly = self.reassembly.lock();
        let payload = if !reassembly.started && data.len() >= 6 {
            let remaining = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
            reassembly.started = true;
            reassembly.remaining = remaining;
            &data[5..]
        } else {
            &data[1..]
        };
        reassembly.buffer.extend_from_slice(payload);
        reassembly.remaining = reassembly.remaining.saturating_sub(payload.len() as u32);

        if reassembly.remaining == 0 {
            let frame = std::mem::take(&mut reassembly.buffer);
            reassembly.reset();
            drop(reassembly);
            let _ = self.event_tx.send(ChannelEvent::Incoming(frame));
        }
    }

    /// Delivers a stack-level event, advancing the local state machine.
    /// Used both by the production radio binding and by test harnesses that
    /// replay stack events without a real radio daemon.
    pub async fn on_stack_event(&mut self, event: StackEvent) -> Result<(), ChannelError> {
        match event {
            StackEvent::Initialised => {
                *self.state.lock() = AttrState::Initialised;
                self.drain_pending_recycle().await?;
            }
            StackEvent::AdvertisingStarted => {
                *self.state.lock() = if self.continuous {
                    AttrState::AdvertisingContinuous
                } else {
                    AttrState::Advertising
                };
            }
            StackEvent::PeerConnected => {
                *self.state.lock() = AttrState::Connected;
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.event_tx.send(ChannelEvent::Connected);
            }
            StackEvent::PeerDisconnected => {
                if self
                    .connected
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let _ = self.event_tx.send(ChannelEvent::Disconnected);
                }
                self.begin_unadvertise().await?;
            }
            StackEvent::Unadvertised => {
                *self.state.lock() = AttrState::Unadvertised;
                if *self.recycle_pending.lock() {
                    // A recycle is in progress (or was requested while we
                    // were already mid-unadvertise for disconnect): continue
                    // the chain into Finalising rather than waiting here.
                    *self.state.lock() = AttrState::Finalising;
                    self.stack.finalise().await?;
                }
            }
            StackEvent::Finalised => {
                *self.state.lock() = AttrState::Finalised;
                if std::mem::take(&mut *self.recycle_pending.lock()) {
                    *self.state.lock() = AttrState::Initialising;
                    self.stack
                        .initialise(service_uuid(&self.service_public_key, self.continuous))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn begin_unadvertise(&mut self) -> Result<(), ChannelError> {
        *self.state.lock() = AttrState::Unadvertising;
        self.stack.stop_advertising().await
    }

    /// Requests a recycle of the whole advertising stack.
    /// Deferred automatically if the channel is in a state where recycling
    /// would interrupt an in-flight transition.
    pub async fn request_recycle(&mut self) -> Result<(), ChannelError> {
        if !self.recycle_enabled {
            return Ok(());
        }
        let state = self.state();
        if state.recycle_deferred() {
            *self.recycle_pending.lock() = true;
            return Ok(());
        }
        // Mark the chain in progress regardless of whether we can start
        // immediately, so the Unadvertised/Finalised handlers know to carry
        // it through to Finalising → Finalised → Initialising.
        *self.recycle_pending.lock() = true;
        if state.recycle_allowed() {
            self.begin_unadvertise().await?;
        }
        Ok(())
    }

    /// Starts a deferred recycle once the channel reaches a state it can
    /// begin from (called after `Initialised`, where a recycle requested
    /// mid-initialisation may finally be able to proceed).
    async fn drain_pending_recycle(&mut self) -> Result<(), ChannelError> {
        if *self.recycle_pending.lock() {
            let state = self.state();
            if state.recycle_allowed() {
                self.begin_unadvertise().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl super::ByteChannel for AttrChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        *self.state.lock() = AttrState::Initialising;
        let uuid = service_uuid(&self.service_public_key, self.continuous);
        self.stack.initialise(uuid).await?;
        self.stack.start_advertising(self.continuous).await?;
        Ok(uuid.iter().map(|b| format!("{b:02x}")).collect())
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.state() != AttrState::Connected {
            return Err(ChannelError::Fatal("not connected".into()));
        }
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        framed.extend_from_slice(&bytes);

        for (index, chunk) in framed.chunks(MAX_SEND).enumerate() {
            let mut piece = Vec::with_capacity(chunk.len() + 1);
            piece.push(index as u8);
            piece.extend_from_slice(chunk);
            self.stack.notify(&piece).await?;
        }
        let _ = self.event_tx.send(ChannelEvent::SendComplete);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.event_tx.send(ChannelEvent::Disconnected);
            let _ = self.event_tx.send(ChannelEvent::Error(ChannelErrorKind::Fatal));
        }
    }

    fn cancel_pending_reads(&mut self) {
        self.reassembly.lock().reset();
    }
}
