//! The uniform byte-channel capability.
//!
//! A [`ByteChannel`] is one abstract capability — `listen`, `send`,
//! `disconnect`, `cancel_pending_reads` — with three concrete variants
//! ([`crate::channel::rvp::RvpChannel`], [`crate::channel::stream::StreamChannel`],
//! [`crate::channel::attr::AttrChannel`]). Events are pushed to an
//! `mpsc::UnboundedSender<ChannelEvent>` supplied at construction rather than
//! delivered through a polymorphic callback table — the orchestrator is the
//! single reader, matching the single-owner event loop the service runs.

pub mod attr;
pub mod rvp;
pub mod stream;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ChannelError;

/// Events a [`ByteChannel`] raises, in arrival order, for one connection.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    /// Payload already extracted from the transport's own framing.
    Incoming(Vec<u8>),
    SendComplete,
    Disconnected,
    Error(ChannelErrorKind),
    Timeout,
}

/// Coarse error classification, mirrored from [`ChannelError`] for event
/// consumers that only need to branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    Io,
    Malformed,
    TryAgain,
    Fatal,
}

/// One abstract byte-transport capability.
///
/// Implementors guarantee at most one outstanding read and at most one
/// outstanding write at a time, refusing overlapping operations with
/// [`ChannelError::Busy`].
#[async_trait]
pub trait ByteChannel: Send {
    /// Binds a fresh endpoint and returns its address string (for inclusion
    /// in the beacon payload). Also starts the background read loop that
    /// will push [`ChannelEvent`]s to the channel's event sink.
    async fn listen(&mut self) -> Result<String, ChannelError>;

    /// Enqueues a length-prefixed frame for transmission.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// Closes the current peer connection. Idempotent.
    fn disconnect(&mut self);

    /// Cancels an in-flight read without closing the endpoint.
    fn cancel_pending_reads(&mut self);
}

/// Wall-clock (not monotonic) watchdog layered over in-flight long-poll reads.
///
/// Monotonic timers freeze across host suspend; a remote rendezvous forgets
/// channels in wall-clock time, so the local view of an in-flight poll and
/// the remote's view of the channel can silently desynchronise without this
/// check.
#[derive(Debug)]
pub struct WallClockWatchdog {
    duration: Duration,
    started_wall: SystemTime,
    started_mono: Instant,
}

impl WallClockWatchdog {
    pub fn start(duration: Duration) -> Self {
        Self {
            duration,
            started_wall: SystemTime::now(),
            started_mono: Instant::now(),
        }
    }

    /// True once wall-clock elapsed time exceeds the configured duration,
    /// independent of how much monotonic time the process observed (i.e.
    /// even across a suspend/resume that froze the monotonic clock).
    pub fn expired(&self) -> bool {
        let wall_elapsed = SystemTime::now()
            .duration_since(self.started_wall)
            .unwrap_or(Duration::ZERO);
        wall_elapsed >= self.duration
    }

    /// Monotonic elapsed time, used only to pace the polling interval.
    pub fn mono_elapsed(&self) -> Duration {
        self.started_mono.elapsed()
    }
}

pub(crate) type EventSink = mpsc::UnboundedSender<ChannelEvent>;
