//! Timer-driven notifier.

use super::{NotifierSignal, SignalHub, StoreNotifier};
use crate::backend::EventBackend;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Polls the backend's head checkpoint and signals whenever it moves.
///
/// Sees writes from any process sharing the backend.
pub struct PollingNotifier {
    hub: Arc<SignalHub>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingNotifier {
    /// Read the current head, then start polling.
    ///
    /// Fails if the first head read fails.
    pub async fn start(backend: Arc<dyn EventBackend>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(StoreError::InvalidConfiguration(
                "polling interval must be greater than zero".into(),
            ));
        }

        let head = backend.read_head_checkpoint().await?;
        let hub = Arc::new(SignalHub::new(head));
        let (stop, stopped) = watch::channel(false);

        let task = tokio::spawn(poll(backend, interval, Arc::clone(&hub), stopped));

        Ok(Self {
            hub,
            stop,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn poll(
    backend: Arc<dyn EventBackend>,
    interval: Duration,
    hub: Arc<SignalHub>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the head was just read.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            _ = ticker.tick() => {}
        }

        match backend.read_head_checkpoint().await {
            Ok(head) => {
                if hub.publish_head(head) {
                    debug!(target: "stream_store::notifier", head = ?head, "Head moved");
                }
            }
            Err(e) => {
                warn!(target: "stream_store::notifier", error = %e, "Head poll failed");
            }
        }
    }
}

#[async_trait]
impl StoreNotifier for PollingNotifier {
    fn signal(&self) -> NotifierSignal {
        self.hub.signal()
    }

    fn reset(&self) {
        self.hub.publish_head(None);
    }

    async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.hub.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::types::{Checkpoint, ExpectedVersion, NewEvent, StreamId};

    #[tokio::test]
    async fn test_signals_when_head_moves() {
        let backend = Arc::new(InMemoryBackend::new());
        let notifier = PollingNotifier::start(backend.clone(), Duration::from_millis(5))
            .await
            .unwrap();
        let mut signal = notifier.signal();

        backend
            .commit(
                &StreamId::parse("s").unwrap(),
                ExpectedVersion::Any,
                &[NewEvent::new("a", vec![])],
                None,
            )
            .await
            .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), signal.changed())
            .await
            .unwrap();
        assert!(fired);
        assert_eq!(signal.latest(), Some(Checkpoint(0)));

        notifier.shutdown().await;
        assert!(!signal.changed().await);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = PollingNotifier::start(Arc::new(InMemoryBackend::new()), Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::InvalidConfiguration(_))));
    }
}
