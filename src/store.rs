//! Main Store struct tying all components together.

use crate::backend::{is_schema_name, EventBackend, InMemoryBackend, SqliteBackend, SqliteSettings};
use crate::cache::MetadataCache;
use crate::checkpoint::CheckpointReader;
use crate::clock::{Clock, SystemClock};
use crate::concurrency::ConcurrencyController;
use crate::error::{Result, StoreError};
use crate::notifier::{LazyNotifier, NotifierFactory, StoreNotifier};
use crate::subscriptions::{self, Start, SubscriptionConfig, SubscriptionHandle, Target};
use crate::types::{
    AllPage, AppendResult, Checkpoint, ExpectedVersion, NewEvent, PageReadStatus, ReadDirection,
    StoredEvent, StreamId, StreamMetadata, StreamPage, StreamVersion, Timestamp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Diagnostic name, used in logs and errors.
    pub name: String,

    /// Backend target. For SQLite, the database file.
    pub connection: String,

    /// Schema holding the store's tables. Non-default schemas are created
    /// by `initialize`.
    pub schema: String,

    /// How long cached stream metadata stays valid.
    pub metadata_cache_max_age: Duration,

    /// Maximum cached metadata entries. Zero disables the cache.
    pub metadata_cache_max_size: usize,

    /// Clock override. When set, event timestamps come from this clock
    /// instead of the backend.
    pub clock: Option<Arc<dyn Clock>>,

    /// Builds the notifier on first subscription.
    pub notifier_factory: Option<NotifierFactory>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "stream-store".to_string(),
            connection: String::new(),
            schema: crate::backend::DEFAULT_SCHEMA.to_string(),
            metadata_cache_max_age: Duration::from_secs(60),
            metadata_cache_max_size: 10_000,
            clock: None,
            notifier_factory: Some(NotifierFactory::polling(Duration::from_secs(1))),
        }
    }
}

impl StoreConfig {
    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "store name must not be empty".into(),
            ));
        }
        if self.notifier_factory.is_none() {
            return Err(StoreError::InvalidConfiguration(
                "a notifier factory is required".into(),
            ));
        }
        if !is_schema_name(&self.schema) {
            return Err(StoreError::InvalidConfiguration(format!(
                "schema '{}' is not a usable schema name",
                self.schema
            )));
        }
        Ok(())
    }
}

/// The event store.
///
/// Cheap to clone; clones share one backend, cache and notifier.
///
/// Provides:
/// - Appends with optimistic concurrency
/// - Stream and all-stream reads, forwards and backwards
/// - Catch-up subscriptions
/// - Per-stream metadata policy
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    name: String,

    backend: Arc<dyn EventBackend>,

    concurrency: ConcurrencyController,

    checkpoints: CheckpointReader,

    cache: MetadataCache,

    /// Built on first subscription, at most once.
    notifier: LazyNotifier,

    clock: Arc<dyn Clock>,

    /// Timestamps come from `clock` rather than the backend.
    client_clock: bool,

    disposed: AtomicBool,
}

impl Store {
    /// Create a store over any backend.
    pub fn with_backend(backend: Arc<dyn EventBackend>, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let client_clock = config.clock.is_some();
        let clock = config
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let inner = StoreInner {
            concurrency: ConcurrencyController::new(Arc::clone(&backend)),
            checkpoints: CheckpointReader::new(Arc::clone(&backend)),
            cache: MetadataCache::new(
                config.metadata_cache_max_age,
                config.metadata_cache_max_size,
                Arc::clone(&clock),
            ),
            notifier: LazyNotifier::new(
                config.name.clone(),
                config.notifier_factory,
                Arc::clone(&backend),
            ),
            name: config.name,
            backend,
            clock,
            client_clock,
            disposed: AtomicBool::new(false),
        };

        info!(
            target: "stream_store::store",
            store = %inner.name,
            client_clock,
            "Store opened"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create a store over a fresh in-memory backend.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        Self::with_backend(Arc::new(InMemoryBackend::new()), config)
    }

    /// Create a store over the SQLite database at `config.connection`.
    ///
    /// Does not touch the database; call [`Store::initialize`] to create tables.
    pub fn open_sqlite(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let settings = SqliteSettings {
            schema: config.schema.clone(),
            client_timestamps: config.clock.is_some(),
            ..SqliteSettings::new(&config.connection)
        };
        let backend = SqliteBackend::new(settings)?;
        Self::with_backend(Arc::new(backend), config)
    }

    // --- Lifecycle ---

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Create the store's tables (and schema). Idempotent.
    ///
    /// With `ignore_errors`, backend failures are logged and swallowed.
    pub async fn initialize(&self, ignore_errors: bool) -> Result<()> {
        self.inner.ensure_open()?;

        match self.inner.backend.initialize().await {
            Ok(()) => {
                info!(target: "stream_store::store", store = %self.inner.name, "Store initialized");
                Ok(())
            }
            Err(e) if ignore_errors => {
                warn!(
                    target: "stream_store::store",
                    store = %self.inner.name,
                    error = %e,
                    "Ignoring initialize failure"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove every table the store created, and with them all events.
    ///
    /// With `ignore_errors`, backend failures are logged and swallowed.
    pub async fn drop_all(&self, ignore_errors: bool) -> Result<()> {
        self.inner.ensure_open()?;

        let result = self.inner.backend.drop_all().await;
        self.inner.cache.clear();
        self.inner.checkpoints.reset();
        if let Some(notifier) = self.inner.notifier.constructed() {
            notifier.reset();
        }

        match result {
            Ok(()) => {
                info!(target: "stream_store::store", store = %self.inner.name, "Store dropped");
                Ok(())
            }
            Err(e) if ignore_errors => {
                warn!(
                    target: "stream_store::store",
                    store = %self.inner.name,
                    error = %e,
                    "Ignoring drop failure"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the notifier, if one was built, and refuse all further work.
    ///
    /// Live subscriptions end with [`DropReason::StoreDisposed`]. Calling
    /// this more than once does nothing.
    ///
    /// [`DropReason::StoreDisposed`]: crate::subscriptions::DropReason::StoreDisposed
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self.inner.notifier.release().await;
        info!(
            target: "stream_store::store",
            store = %self.inner.name,
            notifier_released = released,
            "Store disposed"
        );
    }

    // --- Append ---

    /// Append `events` to `stream` if the stream is at `expected`.
    ///
    /// Replaying a batch that is already committed at the target position
    /// returns the stream's current position without writing again.
    pub async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<AppendResult> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;

        let created = self.inner.client_clock.then(|| self.inner.clock.now());
        let result = self
            .inner
            .concurrency
            .append(&stream, expected, events, created)
            .await?;

        if let Some(notifier) = self.inner.notifier.constructed() {
            notifier.appended(&result);
        }
        Ok(result)
    }

    // --- Reads ---

    /// Read up to `max_count` events of `stream` from `from` onwards.
    pub async fn read_stream_forwards(
        &self,
        stream: &str,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<StreamPage> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        self.inner
            .read_stream_page(&stream, Some(from), max_count, ReadDirection::Forwards)
            .await
    }

    /// Read up to `max_count` events of `stream` from `from` (None = the
    /// latest event) towards the start.
    pub async fn read_stream_backwards(
        &self,
        stream: &str,
        from: Option<StreamVersion>,
        max_count: usize,
    ) -> Result<StreamPage> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        self.inner
            .read_stream_page(&stream, from, max_count, ReadDirection::Backwards)
            .await
    }

    /// Read up to `max_count` events across all streams from `from` onwards.
    pub async fn read_all_forwards(&self, from: Checkpoint, max_count: usize) -> Result<AllPage> {
        self.inner.read_all_forwards(from, max_count).await
    }

    /// Read up to `max_count` events across all streams from `from` (None =
    /// the head) towards the start.
    pub async fn read_all_backwards(
        &self,
        from: Option<Checkpoint>,
        max_count: usize,
    ) -> Result<AllPage> {
        self.inner
            .read_all_page(from, max_count, ReadDirection::Backwards)
            .await
    }

    /// Highest committed checkpoint; None for an empty store.
    pub async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.inner.read_head_checkpoint().await
    }

    /// Number of events in `stream`, optionally only those created before a time.
    pub async fn stream_event_count(
        &self,
        stream: &str,
        created_before: Option<Timestamp>,
    ) -> Result<u64> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        match created_before {
            Some(before) => self.inner.checkpoints.count_events_before(&stream, before).await,
            None => self.inner.checkpoints.count_events(&stream).await,
        }
    }

    // --- Metadata ---

    /// Retention policy of `stream`, through the metadata cache.
    pub async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadata> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        self.inner.metadata(&stream).await
    }

    /// Replace the retention policy of `stream`.
    pub async fn set_stream_metadata(&self, stream: &str, metadata: StreamMetadata) -> Result<()> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        if metadata.max_count == Some(0) {
            return Err(StoreError::InvalidArgument(
                "max_count must be greater than zero".into(),
            ));
        }

        self.inner.backend.write_metadata(&stream, &metadata).await?;
        self.inner.cache.invalidate(&stream);
        Ok(())
    }

    // --- Subscriptions ---

    /// Subscribe to every stream, starting after `last_checkpoint` (None =
    /// from the first event).
    pub fn subscribe_to_all(
        &self,
        name: &str,
        last_checkpoint: Option<Checkpoint>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        self.inner.ensure_open()?;
        let start = last_checkpoint.map_or(Start::Beginning, |c| Start::After(c.0));
        subscriptions::spawn(Arc::clone(&self.inner), name, Target::All, start, config)
    }

    /// Subscribe to every stream, delivering only events committed after
    /// the subscription initializes.
    pub fn subscribe_to_all_from_head(
        &self,
        name: &str,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        self.inner.ensure_open()?;
        subscriptions::spawn(Arc::clone(&self.inner), name, Target::All, Start::Head, config)
    }

    /// Subscribe to one stream, starting after `last_version` (None = from
    /// the stream's first event).
    pub fn subscribe_to_stream(
        &self,
        stream: &str,
        name: &str,
        last_version: Option<StreamVersion>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        self.inner.ensure_open()?;
        let stream = StreamId::parse(stream)?;
        let start = last_version.map_or(Start::Beginning, |v| Start::After(v.0));
        subscriptions::spawn(
            Arc::clone(&self.inner),
            name,
            Target::Stream(stream),
            start,
            config,
        )
    }
}

impl StoreInner {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(StoreError::Disposed(self.name.clone()));
        }
        Ok(())
    }

    /// The shared notifier, building it on first use.
    pub(crate) async fn notifier(&self) -> Result<Arc<dyn StoreNotifier>> {
        self.ensure_open()?;
        let notifier = self.notifier.get().await?;

        // Disposed while the notifier was being built.
        if self.is_disposed() {
            self.notifier.release().await;
            return Err(StoreError::Disposed(self.name.clone()));
        }
        Ok(notifier)
    }

    pub(crate) async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.ensure_open()?;
        self.checkpoints.read_head_checkpoint().await
    }

    /// Version of the latest event in `stream`, ignoring retention policy.
    pub(crate) async fn stream_head_version(
        &self,
        stream: &StreamId,
    ) -> Result<Option<StreamVersion>> {
        self.ensure_open()?;
        let slice = self
            .backend
            .read_stream(stream, StreamVersion(u64::MAX), 1, ReadDirection::Backwards)
            .await?;
        Ok(slice.map(|s| s.last_version))
    }

    pub(crate) async fn read_all_forwards(
        &self,
        from: Checkpoint,
        max_count: usize,
    ) -> Result<AllPage> {
        self.read_all_page(Some(from), max_count, ReadDirection::Forwards)
            .await
    }

    pub(crate) async fn read_stream_forwards(
        &self,
        stream: &StreamId,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<StreamPage> {
        self.read_stream_page(stream, Some(from), max_count, ReadDirection::Forwards)
            .await
    }

    async fn metadata(&self, stream: &StreamId) -> Result<StreamMetadata> {
        self.cache
            .get_or_fetch(stream, || self.backend.read_metadata(stream))
            .await
    }

    /// One page of a stream. One extra event is read to detect the end.
    async fn read_stream_page(
        &self,
        stream: &StreamId,
        from: Option<StreamVersion>,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<StreamPage> {
        self.ensure_open()?;
        check_page_size(max_count)?;

        let start = from.unwrap_or(StreamVersion(u64::MAX));
        let Some(slice) = self
            .backend
            .read_stream(stream, start, max_count.saturating_add(1), direction)
            .await?
        else {
            return Ok(StreamPage::not_found(stream, direction, from));
        };

        let mut events = slice.events;
        let is_end = events.len() <= max_count;
        events.truncate(max_count);

        let next_version = match direction {
            ReadDirection::Forwards => events.last().map_or(Some(start), |e| e.stream_version.next()),
            ReadDirection::Backwards => events.last().and_then(|e| e.stream_version.prev()),
        };

        let metadata = self.metadata(stream).await?;
        if !metadata.is_unrestricted() {
            let now = self.clock.now();
            events.retain(|e| metadata.is_current(e, now, Some(slice.last_version)));
        }

        Ok(StreamPage {
            stream_id: stream.as_str().to_string(),
            status: PageReadStatus::Success,
            direction,
            from_version: from,
            next_version,
            last_stream_version: Some(slice.last_version),
            last_stream_checkpoint: Some(slice.last_checkpoint),
            is_end,
            events,
        })
    }

    /// One page across all streams. One extra event is read to detect the end.
    async fn read_all_page(
        &self,
        from: Option<Checkpoint>,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<AllPage> {
        self.ensure_open()?;
        check_page_size(max_count)?;

        let start = from.unwrap_or(match direction {
            ReadDirection::Forwards => Checkpoint(0),
            ReadDirection::Backwards => Checkpoint(u64::MAX),
        });
        let mut events = self
            .backend
            .read_all(start, max_count.saturating_add(1), direction)
            .await?;
        let is_end = events.len() <= max_count;
        events.truncate(max_count);

        let next_checkpoint = match direction {
            ReadDirection::Forwards => events.last().map_or(Some(start), |e| e.checkpoint.next()),
            ReadDirection::Backwards => events.last().and_then(|e| e.checkpoint.prev()),
        };

        self.retain_unexpired(&mut events).await?;

        Ok(AllPage {
            direction,
            from_checkpoint: from,
            next_checkpoint,
            is_end,
            events,
        })
    }

    /// Drop events past their stream's max age. Max count is a per-stream
    /// notion and only applies to stream reads.
    async fn retain_unexpired(&self, events: &mut Vec<StoredEvent>) -> Result<()> {
        let mut policies: HashMap<String, StreamMetadata> = HashMap::new();
        for event in events.iter() {
            if policies.contains_key(&event.stream_id) {
                continue;
            }
            let stream = StreamId::parse(&event.stream_id)?;
            let metadata = self.metadata(&stream).await?;
            policies.insert(event.stream_id.clone(), metadata);
        }

        if policies.values().all(|m| m.max_age.is_none()) {
            return Ok(());
        }

        let now = self.clock.now();
        events.retain(|e| {
            policies
                .get(&e.stream_id)
                .map_or(true, |m| m.is_current(e, now, None))
        });
        Ok(())
    }
}

fn check_page_size(max_count: usize) -> Result<()> {
    if max_count == 0 {
        return Err(StoreError::InvalidArgument(
            "max_count must be greater than zero".into(),
        ));
    }
    Ok(())
}
