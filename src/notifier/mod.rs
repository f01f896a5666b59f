//! Notifiers: signals that new events may exist.
//!
//! A notifier never carries events, only a wake-up. Subscriptions hold a
//! [`NotifierSignal`] and re-read from their last delivered position when it
//! fires. Signals are coalesced: any number of publishes between two waits
//! produce a single wake-up.
//!
//! Implementations:
//! - [`PollingNotifier`]: polls the head checkpoint on a timer
//! - [`InProcessNotifier`]: fires from the store's own append path

mod lazy;
mod polling;

pub(crate) use lazy::LazyNotifier;
pub use polling::PollingNotifier;

use crate::backend::EventBackend;
use crate::error::Result;
use crate::types::{AppendResult, Checkpoint};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A source of "new data may exist" signals.
#[async_trait]
pub trait StoreNotifier: Send + Sync {
    /// A fresh signal receiver. Publishes made before this call do not fire it.
    fn signal(&self) -> NotifierSignal;

    /// Called by the store after each successful append.
    fn appended(&self, _result: &AppendResult) {}

    /// Called by the store after all events were dropped. Positions restart,
    /// so any remembered head must be forgotten.
    fn reset(&self) {}

    /// Stop signalling. Outstanding signals report closure. Idempotent.
    async fn shutdown(&self);
}

/// Receiving end of a notifier.
pub struct NotifierSignal {
    receiver: watch::Receiver<Option<Checkpoint>>,
}

impl NotifierSignal {
    /// Wait for the next signal. Returns false once the notifier has shut down.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Last head published by the notifier.
    pub fn latest(&self) -> Option<Checkpoint> {
        *self.receiver.borrow()
    }
}

/// Publishing side shared by notifier implementations.
pub struct SignalHub {
    sender: Mutex<Option<watch::Sender<Option<Checkpoint>>>>,
    /// Kept so signals can still be handed out (already closed) after shutdown.
    template: watch::Receiver<Option<Checkpoint>>,
}

impl SignalHub {
    pub fn new(head: Option<Checkpoint>) -> Self {
        let (sender, template) = watch::channel(head);
        Self {
            sender: Mutex::new(Some(sender)),
            template,
        }
    }

    pub fn signal(&self) -> NotifierSignal {
        let mut receiver = match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => self.template.clone(),
        };
        receiver.borrow_and_update();
        NotifierSignal { receiver }
    }

    /// Publish `head` if it differs from the last published value.
    pub fn publish_head(&self, head: Option<Checkpoint>) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send_if_modified(|current| {
                if *current != head {
                    *current = head;
                    true
                } else {
                    false
                }
            }),
            None => false,
        }
    }

    /// Publish `checkpoint` if it is beyond the last published value.
    pub fn publish_at_least(&self, checkpoint: Checkpoint) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send_if_modified(|current| {
                if *current < Some(checkpoint) {
                    *current = Some(checkpoint);
                    true
                } else {
                    false
                }
            }),
            None => false,
        }
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Notifier driven by the store's own appends.
///
/// Only sees writes made through the same store instance.
pub struct InProcessNotifier {
    hub: SignalHub,
}

impl InProcessNotifier {
    pub fn new(head: Option<Checkpoint>) -> Self {
        Self {
            hub: SignalHub::new(head),
        }
    }
}

#[async_trait]
impl StoreNotifier for InProcessNotifier {
    fn signal(&self) -> NotifierSignal {
        self.hub.signal()
    }

    fn appended(&self, result: &AppendResult) {
        self.hub.publish_at_least(result.current_checkpoint);
    }

    fn reset(&self) {
        self.hub.publish_head(None);
    }

    async fn shutdown(&self) {
        self.hub.close();
    }
}

/// Future produced by a [`NotifierFactory`].
pub type NotifierFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn StoreNotifier>>> + Send>>;

type FactoryFn = dyn Fn(Arc<dyn EventBackend>) -> NotifierFuture + Send + Sync;

/// Builds the store's notifier on first use.
#[derive(Clone)]
pub struct NotifierFactory {
    label: &'static str,
    build: Arc<FactoryFn>,
}

impl NotifierFactory {
    pub fn new<F, Fut>(build: F) -> Self
    where
        F: Fn(Arc<dyn EventBackend>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn StoreNotifier>>> + Send + 'static,
    {
        Self {
            label: "custom",
            build: Arc::new(move |backend: Arc<dyn EventBackend>| -> NotifierFuture {
                Box::pin(build(backend))
            }),
        }
    }

    /// Poll the backend's head checkpoint every `interval`.
    pub fn polling(interval: Duration) -> Self {
        Self {
            label: "polling",
            ..Self::new(move |backend| async move {
                let notifier = PollingNotifier::start(backend, interval).await?;
                Ok(Arc::new(notifier) as Arc<dyn StoreNotifier>)
            })
        }
    }

    /// Signal from this store's own appends.
    pub fn in_process() -> Self {
        Self {
            label: "in-process",
            ..Self::new(|backend: Arc<dyn EventBackend>| async move {
                let head = backend.read_head_checkpoint().await?;
                Ok(Arc::new(InProcessNotifier::new(head)) as Arc<dyn StoreNotifier>)
            })
        }
    }

    pub(crate) fn build(&self, backend: Arc<dyn EventBackend>) -> NotifierFuture {
        (self.build)(backend)
    }
}

impl fmt::Debug for NotifierFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotifierFactory({})", self.label)
    }
}
