//! Beacon fan-out engine: push one payload to N targets independently,
//! each with its own retry schedule and drain semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BeaconError;

/// Cadence at which a failed locate is retried for one target.
const LOCATE_RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// Cadence at which a successfully-delivered target is re-pushed.
const RE_PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// One push attempt: locate-service → connect-stream → write-payload-close.
/// Each step is distinguished because only the locate step is retried on a
/// fixed cadence; a write in progress is always allowed to finish.
#[async_trait]
pub trait BeaconTransport: Send + Sync {
    async fn locate(&self, target: &str) -> Result<(), BeaconError>;
    async fn connect_and_write(&self, target: &str, payload: &[u8]) -> Result<(), BeaconError>;
}

#[async_trait]
impl BeaconTransport for Arc<dyn BeaconTransport> {
    async fn locate(&self, target: &str) -> Result<(), BeaconError> {
        (**self).locate(target).await
    }

    async fn connect_and_write(&self, target: &str, payload: &[u8]) -> Result<(), BeaconError> {
        (**self).connect_and_write(target, payload).await
    }
}

/// A campaign driving one shared, dynamically-dispatched transport — the
/// shape [`crate::orchestrator::SessionOrchestrator`] stores so that sessions
/// using different beacon transports can still share one collection type.
pub type DynBeaconEmitter = BeaconEmitter<Arc<dyn BeaconTransport>>;

/// A fan-out campaign: one payload, independent per-target senders.
pub struct BeaconEmitter<T: BeaconTransport + 'static> {
    transport: Arc<T>,
    payload: Arc<Vec<u8>>,
    targets: Vec<String>,
    stop_tx: Option<watch::Sender<bool>>,
    running_count: Arc<AtomicUsize>,
    finished_notify: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: BeaconTransport + 'static> BeaconEmitter<T> {
    pub fn new(transport: Arc<T>, payload: Vec<u8>, targets: Vec<String>) -> Self {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        Self {
            transport,
            payload: Arc::new(framed),
            targets,
            stop_tx: None,
            running_count: Arc::new(AtomicUsize::new(0)),
            finished_notify: Arc::new(Notify::new()),
            tasks: Vec::new(),
        }
    }

    /// Starts one independent chain per target. Returns [`BeaconError::NoTargets`]
    /// if the target list is empty and [`BeaconError::AlreadyRunning`] if
    /// `start` was already called.
    pub fn start(&mut self) -> Result<(), BeaconError> {
        if self.stop_tx.is_some() {
            return Err(BeaconError::AlreadyRunning);
        }
        if self.targets.is_empty() {
            return Err(BeaconError::NoTargets);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        self.running_count.store(self.targets.len(), Ordering::SeqCst);

        for target in &self.targets {
            let transport = self.transport.clone();
            let payload = self.payload.clone();
            let target = target.clone();
            let mut stop_rx = stop_rx.clone();
            let running_count = self.running_count.clone();
            let finished_notify = self.finished_notify.clone();

            self.tasks.push(tokio::spawn(async move {
                run_target_chain(transport, payload, target, &mut stop_rx).await;
                if running_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                    finished_notify.notify_waiters();
                }
            }));
        }
        Ok(())
    }

    /// Requests each per-target chain to stop. Chains mid-send complete;
    /// chains mid-locate drop immediately.
    pub fn stop(&mut self) {
        if let Some(tx) = &self.stop_tx {
            let _ = tx.send(true);
        }
    }

    /// True once every per-target chain has reported finished.
    pub fn is_finished(&self) -> bool {
        self.stop_tx.is_some() && self.running_count.load(Ordering::SeqCst) == 0
    }

    /// Resolves exactly once, when every per-target chain has finished.
    /// Calling this before [`start`](Self::start) waits forever by design —
    /// callers are expected to `start` first.
    pub async fn on_finished(&self) {
        if self.is_finished() {
            return;
        }
        self.finished_notify.notified().await;
    }
}

async fn run_target_chain<T: BeaconTransport>(
    transport: Arc<T>,
    payload: Arc<Vec<u8>>,
    target: String,
    stop_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            debug!(%target, "beacon chain dropping: stop requested before locate");
            return;
        }

        match transport.locate(&target).await {
            Ok(()) => {}
            Err(err) => {
                warn!(%target, %err, "beacon locate failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(LOCATE_RETRY_INTERVAL) => continue,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                }
            }
        }

        // A write in progress always completes, even if stop() fires.
        if let Err(err) = transport.connect_and_write(&target, &payload).await {
            warn!(%target, %err, "beacon write failed, retrying after locate");
        }

        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(RE_PUSH_INTERVAL) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

impl<T: BeaconTransport> Drop for BeaconEmitter<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct CountingTransport {
        writes: Mutex<Vec<(String, Vec<u8>)>>,
        fail_locate_until: AtomicUsize,
        locate_attempts: AtomicUsize,
    }

    #[async_trait]
    impl BeaconTransport for CountingTransport {
        async fn locate(&self, _target: &str) -> Result<(), BeaconError> {
            let attempt = self.locate_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_locate_until.load(Ordering::SeqCst) {
                return Err(BeaconError::NoTargets);
            }
            Ok(())
        }

        async fn connect_and_write(&self, target: &str, payload: &[u8]) -> Result<(), BeaconError> {
            self.writes
                .lock()
                .await
                .push((target.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_four_byte_be_length_prefix_framed_payload() {
        let transport = Arc::new(CountingTransport {
            writes: Mutex::new(Vec::new()),
            fail_locate_until: AtomicUsize::new(0),
            locate_attempts: AtomicUsize::new(0),
        });
        let mut emitter = BeaconEmitter::new(
            transport.clone(),
            b"payload".to_vec(),
            vec!["target-a".to_string()],
        );
        emitter.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        emitter.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), emitter.on_finished()).await;

        let writes = transport.writes.lock().await;
        assert!(!writes.is_empty());
        let mut expected = 7u32.to_be_bytes().to_vec();
        expected.extend_from_slice(b"payload");
        assert_eq!(writes[0].1, expected);
    }

    #[tokio::test]
    async fn start_with_no_targets_fails() {
        let transport = Arc::new(CountingTransport {
            writes: Mutex::new(Vec::new()),
            fail_locate_until: AtomicUsize::new(0),
            locate_attempts: AtomicUsize::new(0),
        });
        let mut emitter = BeaconEmitter::new(transport, b"p".to_vec(), vec![]);
        assert!(matches!(emitter.start(), Err(BeaconError::NoTargets)));
    }

    #[tokio::test]
    async fn on_finished_fires_once_after_stop() {
        let transport = Arc::new(CountingTransport {
            writes: Mutex::new(Vec::new()),
            fail_locate_until: AtomicUsize::new(0),
            locate_attempts: AtomicUsize::new(0),
        });
        let mut emitter =
            BeaconEmitter::new(transport, b"p".to_vec(), vec!["a".into(), "b".into()]);
        emitter.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        emitter.stop();
        tokio::time::timeout(Duration::from_secs(2), emitter.on_finished())
            .await
            .expect("campaign should finish after stop");
        assert!(emitter.is_finished());
    }
}
