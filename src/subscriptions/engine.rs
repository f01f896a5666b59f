//! The per-subscription task.
//!
//! ```text
//! Initializing ──► CatchingUp ──► Live ──► Faulted | Disposed
//!                      │   ▲        │
//!                      └───┘        └─ one read pass per (coalesced) signal
//!                   page until end
//! ```
//!
//! Every read pass starts just after the last delivered position, so the
//! switch from catch-up to live cannot miss an event: the notifier signal is
//! taken before the first pass, and anything committed after a pass ended
//! either fires that signal or is picked up by the next pass.

use super::types::{
    DropReason, Progress, SharedProgress, SubscriptionConfig, SubscriptionEvent,
    SubscriptionHandle, SubscriptionState,
};
use crate::error::{Result, StoreError};
use crate::store::StoreInner;
use crate::types::{Checkpoint, PageReadStatus, StoredEvent, StreamId, StreamVersion};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// What a subscription follows.
pub(crate) enum Target {
    /// Every stream, by checkpoint.
    All,
    /// One stream, by stream version.
    Stream(StreamId),
}

/// Where delivery starts.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Start {
    Beginning,
    /// Just after this checkpoint (All) or version (Stream).
    After(u64),
    /// Just after whatever is at the head when the subscription initializes.
    Head,
}

/// Why the task stopped.
enum Exit {
    Stopped,
    ConsumerGone,
    StoreDisposed,
    NotifierFailed(String),
    Faulted(String),
}

struct Runner {
    name: String,
    store: Arc<StoreInner>,
    target: Target,
    config: SubscriptionConfig,
    sender: mpsc::Sender<SubscriptionEvent>,
    progress: SharedProgress,
    /// Last processed checkpoint (All) or version (Stream).
    position: Option<u64>,
    /// Head start not yet resolved.
    pending_head: bool,
    caught_up: bool,
}

/// Start a subscription task on the current tokio runtime.
pub(crate) fn spawn(
    store: Arc<StoreInner>,
    name: &str,
    target: Target,
    start: Start,
    config: SubscriptionConfig,
) -> Result<SubscriptionHandle> {
    if config.page_size == 0 || config.buffer_size == 0 {
        return Err(StoreError::InvalidArgument(
            "subscription page_size and buffer_size must be greater than zero".into(),
        ));
    }
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::InvalidConfiguration("subscriptions must be created inside a tokio runtime".into())
    })?;

    let (sender, receiver) = mpsc::channel(config.buffer_size);
    let (stop, stopped) = watch::channel(false);
    let progress = Arc::new(Mutex::new(Progress {
        state: SubscriptionState::Initializing,
        last_checkpoint: None,
        last_version: None,
    }));

    let mut runner = Runner {
        name: name.to_string(),
        store,
        target,
        config,
        sender,
        progress: Arc::clone(&progress),
        position: None,
        pending_head: matches!(start, Start::Head),
        caught_up: false,
    };
    if let Start::After(position) = start {
        runner.advance_to(position);
    }

    debug!(
        target: "stream_store::subscription",
        name = %runner.name,
        start = ?start,
        "Subscription created"
    );
    let task = runtime.spawn(runner.run(stopped));

    Ok(SubscriptionHandle {
        name: name.to_string(),
        receiver,
        progress,
        stop,
        task: Some(task),
    })
}

impl Runner {
    async fn run(mut self, mut stopped: watch::Receiver<bool>) {
        let exit = self.execute(&mut stopped).await;

        let (state, reason) = match exit {
            Exit::Stopped => (SubscriptionState::Disposed, Some(DropReason::Disposed)),
            Exit::ConsumerGone => (SubscriptionState::Disposed, None),
            Exit::StoreDisposed => (SubscriptionState::Disposed, Some(DropReason::StoreDisposed)),
            Exit::NotifierFailed(e) => {
                (SubscriptionState::Faulted, Some(DropReason::NotifierFailed(e)))
            }
            Exit::Faulted(e) => (SubscriptionState::Faulted, Some(DropReason::Faulted(e))),
        };
        self.set_state(state);

        let Some(reason) = reason else {
            return;
        };
        let event = SubscriptionEvent::Dropped { reason };
        if state == SubscriptionState::Faulted {
            // Faults must reach the consumer; stop waiting only if disposed meanwhile.
            tokio::select! {
                _ = self.sender.send(event) => {}
                _ = stopped.changed() => {}
            }
        } else {
            let _ = self.sender.try_send(event);
        }
    }

    async fn execute(&mut self, stopped: &mut watch::Receiver<bool>) -> Exit {
        let notifier = tokio::select! {
            notifier = self.store.notifier() => notifier,
            _ = stopped.changed() => return Exit::Stopped,
        };
        let mut signal = match notifier {
            Ok(notifier) => notifier.signal(),
            Err(StoreError::Disposed(_)) => return Exit::StoreDisposed,
            Err(e) => return Exit::NotifierFailed(e.to_string()),
        };
        self.set_state(SubscriptionState::CatchingUp);

        let mut failures = 0u32;
        loop {
            let step = tokio::select! {
                step = self.step() => step,
                _ = stopped.changed() => return Exit::Stopped,
            };

            match step {
                Ok(true) => failures = 0,
                Ok(false) => return Exit::ConsumerGone,
                Err(StoreError::Disposed(_)) => return Exit::StoreDisposed,
                Err(e) if e.is_transient() && failures < self.config.max_transient_failures => {
                    failures += 1;
                    warn!(
                        target: "stream_store::subscription",
                        name = %self.name,
                        attempt = failures,
                        error = %e,
                        "Read failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => continue,
                        _ = stopped.changed() => return Exit::Stopped,
                    }
                }
                Err(e) => {
                    let fault = StoreError::SubscriptionFaulted {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    };
                    return Exit::Faulted(fault.to_string());
                }
            }

            tokio::select! {
                alive = signal.changed() => {
                    if !alive {
                        return Exit::StoreDisposed;
                    }
                }
                _ = stopped.changed() => return Exit::Stopped,
            }
        }
    }

    /// One read pass, plus the caught-up notice after the first.
    ///
    /// Returns false if the consumer went away.
    async fn step(&mut self) -> Result<bool> {
        if self.pending_head {
            self.resolve_head().await?;
            self.pending_head = false;
        }

        if !self.pass().await? {
            return Ok(false);
        }

        if !self.caught_up {
            self.caught_up = true;
            self.set_state(SubscriptionState::Live);
            if self.sender.send(SubscriptionEvent::CaughtUp).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn resolve_head(&mut self) -> Result<()> {
        let head = match &self.target {
            Target::All => self.store.read_head_checkpoint().await?.map(|c| c.0),
            Target::Stream(stream) => self.store.stream_head_version(stream).await?.map(|v| v.0),
        };
        if let Some(head) = head {
            self.advance_to(head);
        }
        Ok(())
    }

    /// Read and deliver pages from the last position until the head.
    async fn pass(&mut self) -> Result<bool> {
        let page_size = self.config.page_size;

        loop {
            let from = match self.position {
                None => 0,
                Some(p) => match p.checked_add(1) {
                    Some(from) => from,
                    // Already at the last possible position.
                    None => return Ok(true),
                },
            };

            let (events, next, is_end) = match &self.target {
                Target::All => {
                    let page = self.store.read_all_forwards(Checkpoint(from), page_size).await?;
                    (page.events, page.next_checkpoint.map(|c| c.0), page.is_end)
                }
                Target::Stream(stream) => {
                    let page = self
                        .store
                        .read_stream_forwards(stream, StreamVersion(from), page_size)
                        .await?;
                    if page.status == PageReadStatus::StreamNotFound {
                        return Ok(true);
                    }
                    (page.events, page.next_version.map(|v| v.0), page.is_end)
                }
            };

            for event in events {
                let position = self.position_of(&event);
                let checkpoint = event.checkpoint;
                if self.sender.send(SubscriptionEvent::Event(event)).await.is_err() {
                    return Ok(false);
                }
                self.advance_to(position);
                self.progress.lock().last_checkpoint = Some(checkpoint);
            }

            // Events hidden by retention policy are still consumed.
            if let Some(last) = next.and_then(|n| n.checked_sub(1)) {
                if self.position.map_or(true, |p| last > p) {
                    self.advance_to(last);
                }
            }

            if is_end {
                return Ok(true);
            }
        }
    }

    fn position_of(&self, event: &StoredEvent) -> u64 {
        match self.target {
            Target::All => event.checkpoint.0,
            Target::Stream(_) => event.stream_version.0,
        }
    }

    fn advance_to(&mut self, position: u64) {
        self.position = Some(position);
        let mut progress = self.progress.lock();
        match self.target {
            Target::All => progress.last_checkpoint = Some(Checkpoint(position)),
            Target::Stream(_) => progress.last_version = Some(StreamVersion(position)),
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        self.progress.lock().state = state;
        debug!(
            target: "stream_store::subscription",
            name = %self.name,
            state = ?state,
            position = ?self.position,
            "Subscription state changed"
        );
    }
}
