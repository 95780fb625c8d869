//! Rendezvous-point HTTP long-polling [`ByteChannel`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::task::JoinHandle;

use super::{ByteChannel, ChannelErrorKind, ChannelEvent, EventSink, WallClockWatchdog};
use crate::error::ChannelError;

const RETRY_BACKOFF: Duration = Duration::from_millis(1000);

struct RvpInner {
    client: reqwest::Client,
    url: String,
    event_tx: EventSink,
    read_generation: AtomicU64,
    watchdog_duration: Duration,
    connected: AtomicBool,
}

/// HTTP long-poll channel against a rendezvous-point URL.
///
/// At most one POST and one GET may be outstanding at a time; the current
/// read is identified by a generation counter so [`cancel_pending_reads`]
/// can distinguish "this GET was cancelled, let it die" from "this GET is
/// still the scheduled read, retry it".
///
/// [`cancel_pending_reads`]: ByteChannel::cancel_pending_reads
pub struct RvpChannel {
    inner: Arc<RvpInner>,
    url_prefix: String,
    write_busy: Arc<AtomicBool>,
    read_task: Option<JoinHandle<()>>,
}

impl RvpChannel {
    pub fn new(url_prefix: String, watchdog_duration: Duration, event_tx: EventSink) -> Self {
        Self {
            inner: Arc::new(RvpInner {
                client: reqwest::Client::new(),
                url: String::new(),
                event_tx,
                read_generation: AtomicU64::new(0),
                watchdog_duration,
                connected: AtomicBool::new(false),
            }),
            url_prefix,
            write_busy: Arc::new(AtomicBool::new(false)),
            read_task: None,
        }
    }

    fn random_address(prefix: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("{prefix}{hex}")
    }

    fn spawn_read_loop(&mut self, generation: u64) {
        let inner = self.inner.clone();
        self.read_task = Some(tokio::spawn(run_read_loop(inner, generation)));
    }
}

/// Cadence at which [`wait_for_wall_clock_expiry`] re-checks the watchdog.
/// Bounded below so short test-configured watchdog durations still get
/// checked promptly, and above so real deployments don't busy-poll.
fn watchdog_poll_interval(watchdog_duration: Duration) -> Duration {
    (watchdog_duration / 8).clamp(Duration::from_millis(10), Duration::from_millis(250))
}

/// Resolves once `watchdog` reports wall-clock expiry. Polling (rather than
/// a single `tokio::time::sleep(duration)`) matters here: the poll itself is
/// timed on tokio's monotonic clock, but the expiry *decision* each
/// iteration makes is `SystemTime`-based, so a host suspend that freezes the
/// monotonic clock is still caught on the next wake rather than silently
/// extending the watchdog by the suspended duration.
async fn wait_for_wall_clock_expiry(watchdog: &WallClockWatchdog, poll_interval: Duration) {
    loop {
        if watchdog.expired() {
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

enum ReadOutcome {
    Responded(Result<reqwest::Response, reqwest::Error>),
    WatchdogExpired,
}

async fn run_read_loop(inner: Arc<RvpInner>, my_generation: u64) {
    loop {
        if inner.read_generation.load(Ordering::SeqCst) != my_generation {
            return;
        }
        let watchdog = WallClockWatchdog::start(inner.watchdog_duration);
        let poll_interval = watchdog_poll_interval(inner.watchdog_duration);
        let get_fut = inner.client.get(&inner.url).send();
        tokio::pin!(get_fut);

        let outcome = tokio::select! {
            res = &mut get_fut => ReadOutcome::Responded(res),
            _ = wait_for_wall_clock_expiry(&watchdog, poll_interval) => ReadOutcome::WatchdogExpired,
        };

        if inner.read_generation.load(Ordering::SeqCst) != my_generation {
            // Cancelled while the request was in flight: this GET was the
            // scheduled read, a replacement generation is already running.
            return;
        }

        match outcome {
            ReadOutcome::WatchdogExpired => {
                let err = ChannelError::WatchdogExpired;
                tracing::warn!(%err, "rvp long-poll watchdog expired, cancelling and restarting read");
                let _ = inner.event_tx.send(ChannelEvent::Timeout);
                // Dropping `get_fut` here cancels the in-flight GET; the
                // channel is still in listen state (same generation), so a
                // fresh GET is scheduled immediately on the next iteration.
                continue;
            }
            ReadOutcome::Responded(Err(_req_err)) => {
                let _ = inner.event_tx.send(ChannelEvent::Error(ChannelErrorKind::Io));
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }
            ReadOutcome::Responded(Ok(resp)) => match resp.bytes().await {
                Ok(body) => {
                    if body.len() > 4 && body.first() != Some(&b'{') {
                        let _ = inner
                            .event_tx
                            .send(ChannelEvent::Incoming(body[4..].to_vec()));
                    }
                    continue;
                }
                Err(_) => {
                    let _ = inner
                        .event_tx
                        .send(ChannelEvent::Error(ChannelErrorKind::Malformed));
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            },
        }
    }
}

#[async_trait]
impl ByteChannel for RvpChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        let addr = Self::random_address(&self.url_prefix);
        self.inner = Arc::new(RvpInner {
            client: reqwest::Client::new(),
            url: addr.clone(),
            event_tx: self.inner.event_tx.clone(),
            read_generation: AtomicU64::new(0),
            watchdog_duration: self.inner.watchdog_duration,
            connected: AtomicBool::new(true),
        });
        let _ = self.inner.event_tx.send(ChannelEvent::Connected);
        self.spawn_read_loop(0);
        Ok(addr)
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self
            .write_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChannelError::Busy);
        }
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        framed.extend_from_slice(&bytes);

        let result = self
            .inner
            .client
            .post(&self.inner.url)
            .header("content-type", "application/octet-stream")
            .body(framed)
            .send()
            .await;
        self.write_busy.store(false, Ordering::SeqCst);

        match result {
            Ok(_) => {
                let _ = self.inner.event_tx.send(ChannelEvent::SendComplete);
                Ok(())
            }
            Err(err) => Err(ChannelError::Transient(err.to_string())),
        }
    }

    fn disconnect(&mut self) {
        if self
            .inner
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.read_generation.fetch_add(1, Ordering::SeqCst);
            if let Some(task) = self.read_task.take() {
                task.abort();
            }
            let _ = self.inner.event_tx.send(ChannelEvent::Disconnected);
        }
    }

    fn cancel_pending_reads(&mut self) {
        let next_generation = self.inner.read_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.connected.load(Ordering::SeqCst) {
            self.spawn_read_loop(next_generation);
        } else if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for RvpChannel {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_address_is_32_hex_chars_after_prefix() {
        let addr = RvpChannel::random_address("http://rvp/channel/");
        let suffix = addr.strip_prefix("http://rvp/channel/").unwrap();
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn send_frames_with_four_byte_be_length_prefix() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut chan = RvpChannel::new(
            "http://127.0.0.1:1/channel/".to_string(),
            Duration::from_secs(30),
            tx,
        );
        // No server is listening; the send must still attempt a single POST
        // and report a transient transport error rather than panicking.
        chan.inner = Arc::new(RvpInner {
            client: reqwest::Client::new(),
            url: "http://127.0.0.1:1/channel/deadbeef".to_string(),
            event_tx: chan.inner.event_tx.clone(),
            read_generation: AtomicU64::new(0),
            watchdog_duration: Duration::from_secs(30),
            connected: AtomicBool::new(false),
        });
        let result = chan.send(vec![1, 2, 3]).await;
        assert!(result.is_err());
    }
}
