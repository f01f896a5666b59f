//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_store::{
    Checkpoint, CommitOutcome, EventBackend, ExpectedVersion, InMemoryBackend, InProcessNotifier,
    NewEvent, NotifierFactory, NotifierSignal, ReadDirection, Result, StoreConfig, StoreError,
    StoreNotifier, StoredEvent, StreamId, StreamMetadata, StreamSlice, StreamVersion,
    SubscriptionEvent, SubscriptionHandle, Timestamp,
};
use uuid::Uuid;

/// Kind of failure injected into reads.
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    /// `BackendUnavailable`, retried by subscriptions.
    Transient,
    /// `Backend`, faults subscriptions immediately.
    Permanent,
}

impl Failure {
    fn error(self) -> StoreError {
        match self {
            Failure::Transient => StoreError::BackendUnavailable("database is locked".into()),
            Failure::Permanent => StoreError::Backend("disk I/O error".into()),
        }
    }
}

struct Injected {
    kind: Failure,
    /// None = fail until cleared.
    remaining: Option<usize>,
}

/// In-memory backend that counts calls and can fail event reads on demand.
#[derive(Default)]
pub struct CountingBackend {
    inner: InMemoryBackend,
    calls: AtomicUsize,
    commits: AtomicUsize,
    metadata_reads: AtomicUsize,
    event_reads: AtomicUsize,
    fail_admin: AtomicBool,
    injected: Mutex<Option<Injected>>,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every backend call of any kind.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn metadata_reads(&self) -> usize {
        self.metadata_reads.load(Ordering::SeqCst)
    }

    /// `read_stream` and `read_all` calls.
    pub fn event_reads(&self) -> usize {
        self.event_reads.load(Ordering::SeqCst)
    }

    /// Make `initialize` and `drop_all` fail as unavailable.
    pub fn fail_admin(&self, fail: bool) {
        self.fail_admin.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `times` event reads.
    pub fn fail_reads(&self, kind: Failure, times: usize) {
        *self.injected.lock() = Some(Injected {
            kind,
            remaining: Some(times),
        });
    }

    /// Fail every event read until cleared.
    pub fn fail_reads_forever(&self, kind: Failure) {
        *self.injected.lock() = Some(Injected {
            kind,
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        *self.injected.lock() = None;
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        self.event_reads.fetch_add(1, Ordering::SeqCst);

        let mut injected = self.injected.lock();
        let Some(current) = injected.as_mut() else {
            return Ok(());
        };
        if current.remaining == Some(0) {
            *injected = None;
            return Ok(());
        }
        if let Some(n) = current.remaining.as_mut() {
            *n -= 1;
        }
        Err(current.kind.error())
    }

    fn check_admin(&self) -> Result<()> {
        if self.fail_admin.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventBackend for CountingBackend {
    async fn initialize(&self) -> Result<()> {
        self.touch();
        self.check_admin()?;
        self.inner.initialize().await
    }

    async fn drop_all(&self) -> Result<()> {
        self.touch();
        self.check_admin()?;
        self.inner.drop_all().await
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
        created: Option<Timestamp>,
    ) -> Result<CommitOutcome> {
        self.touch();
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(stream, expected, events, created).await
    }

    async fn find_event_version(
        &self,
        stream: &StreamId,
        event_id: Uuid,
    ) -> Result<Option<StreamVersion>> {
        self.touch();
        self.inner.find_event_version(stream, event_id).await
    }

    async fn read_stream(
        &self,
        stream: &StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Option<StreamSlice>> {
        self.touch();
        self.check_read()?;
        self.inner.read_stream(stream, from, max_count, direction).await
    }

    async fn read_all(
        &self,
        from: Checkpoint,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Vec<StoredEvent>> {
        self.touch();
        self.check_read()?;
        self.inner.read_all(from, max_count, direction).await
    }

    async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.touch();
        self.inner.read_head_checkpoint().await
    }

    async fn count_events(
        &self,
        stream: &StreamId,
        created_before: Option<Timestamp>,
    ) -> Result<u64> {
        self.touch();
        self.inner.count_events(stream, created_before).await
    }

    async fn read_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>> {
        self.touch();
        self.metadata_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_metadata(stream).await
    }

    async fn write_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<()> {
        self.touch();
        self.inner.write_metadata(stream, metadata).await
    }
}

/// In-process notifier that counts shutdowns.
pub struct CountingNotifier {
    inner: InProcessNotifier,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreNotifier for CountingNotifier {
    fn signal(&self) -> NotifierSignal {
        self.inner.signal()
    }

    fn appended(&self, result: &stream_store::AppendResult) {
        self.inner.appended(result);
    }

    fn reset(&self) {
        self.inner.reset();
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown().await;
    }
}

/// Counters observed by [`counting_factory`].
#[derive(Clone, Default)]
pub struct NotifierCounters {
    pub builds: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl NotifierCounters {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// In-process notifier factory that records builds and shutdowns.
pub fn counting_factory(counters: &NotifierCounters) -> NotifierFactory {
    let counters = counters.clone();
    NotifierFactory::new(move |backend| {
        let counters = counters.clone();
        async move {
            counters.builds.fetch_add(1, Ordering::SeqCst);
            let head = backend.read_head_checkpoint().await?;
            Ok(Arc::new(CountingNotifier {
                inner: InProcessNotifier::new(head),
                shutdowns: counters.shutdowns,
            }) as Arc<dyn StoreNotifier>)
        }
    })
}

/// Factory whose construction always fails, after a short delay.
pub fn failing_factory(builds: Arc<AtomicUsize>) -> NotifierFactory {
    NotifierFactory::new(move |_backend| {
        let builds = Arc::clone(&builds);
        async move {
            builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<Arc<dyn StoreNotifier>, _>(StoreError::BackendUnavailable(
                "notification channel refused".into(),
            ))
        }
    })
}

/// Route store logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(name: &str) -> StoreConfig {
    init_tracing();
    StoreConfig {
        name: name.to_string(),
        notifier_factory: Some(NotifierFactory::in_process()),
        ..Default::default()
    }
}

pub fn event(event_type: &str, n: usize) -> NewEvent {
    NewEvent::json(event_type, &serde_json::json!({ "n": n })).unwrap()
}

/// Receive `count` events, skipping control notices. Panics on timeout or drop.
pub async fn next_events(handle: &mut SubscriptionHandle, count: usize) -> Vec<StoredEvent> {
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        match handle.recv_timeout(Duration::from_secs(5)).await {
            Some(SubscriptionEvent::Event(event)) => events.push(event),
            Some(SubscriptionEvent::CaughtUp) => {}
            Some(SubscriptionEvent::Dropped { reason }) => {
                panic!("subscription dropped after {} events: {:?}", events.len(), reason)
            }
            None => panic!("timed out after {} events", events.len()),
        }
    }
    events
}

/// Wait for the subscription's drop notice, discarding anything before it.
pub async fn dropped_reason(handle: &mut SubscriptionHandle) -> stream_store::DropReason {
    loop {
        match handle.recv_timeout(Duration::from_secs(5)).await {
            Some(SubscriptionEvent::Dropped { reason }) => return reason,
            Some(_) => continue,
            None => panic!("no drop notice"),
        }
    }
}

/// Nothing further arrives within `wait`.
pub async fn assert_quiet(handle: &mut SubscriptionHandle, wait: Duration) {
    if let Some(event) = handle.recv_timeout(wait).await {
        panic!("unexpected event: {:?}", event);
    }
}
