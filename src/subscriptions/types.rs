//! Subscription types.

use crate::types::{Checkpoint, StoredEvent, StreamVersion};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Events read per backend round trip.
    /// Default: 100
    pub page_size: usize,

    /// Events buffered for the consumer before delivery waits.
    /// Default: 1000
    pub buffer_size: usize,

    /// Consecutive transient read failures tolerated before faulting.
    /// Default: 5
    pub max_transient_failures: u32,

    /// Pause before retrying after a transient failure.
    /// Default: 100ms
    pub retry_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            buffer_size: 1000,
            max_transient_failures: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Initializing,
    CatchingUp,
    Live,
    Faulted,
    Disposed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Faulted | SubscriptionState::Disposed)
    }
}

/// Events delivered to the consumer.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// The next event, in order.
    Event(StoredEvent),

    /// Historical catch-up finished; events from here on are live.
    CaughtUp,

    /// The subscription stopped. Always the last event.
    Dropped { reason: DropReason },
}

/// Why a subscription stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Disposed through its handle.
    Disposed,
    /// The store was disposed.
    StoreDisposed,
    /// The store's notifier could not be constructed.
    NotifierFailed(String),
    /// A read failed and the subscription gave up.
    Faulted(String),
}

/// Progress shared between the subscription task and its handle.
#[derive(Debug)]
pub(crate) struct Progress {
    pub state: SubscriptionState,
    pub last_checkpoint: Option<Checkpoint>,
    pub last_version: Option<StreamVersion>,
}

pub(crate) type SharedProgress = Arc<Mutex<Progress>>;

/// Handle to a running subscription.
///
/// Dropping the handle disposes the subscription.
pub struct SubscriptionHandle {
    pub(crate) name: String,
    pub(crate) receiver: mpsc::Receiver<SubscriptionEvent>,
    pub(crate) progress: SharedProgress,
    pub(crate) stop: watch::Sender<bool>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.progress.lock().state
    }

    /// Checkpoint of the last event processed (all-stream subscriptions).
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.progress.lock().last_checkpoint
    }

    /// Stream version of the last event processed (stream subscriptions).
    pub fn last_version(&self) -> Option<StreamVersion> {
        self.progress.lock().last_version
    }

    /// Receive the next event. None once the subscription has stopped and
    /// every buffered event was received.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Result<SubscriptionEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout. None on timeout or when the channel is closed.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<SubscriptionEvent> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stop the subscription and wait for its task to finish. Idempotent.
    pub async fn dispose(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let mut progress = self.progress.lock();
        if !progress.state.is_terminal() {
            progress.state = SubscriptionState::Disposed;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
