//! Persistence backends.
//!
//! A backend owns the ground truth: it assigns stream versions and
//! checkpoints atomically per commit and serves ordered reads. It never
//! decides whether a mismatch is a conflict or an idempotent replay; it only
//! reports what it saw through [`CommitOutcome`].
//!
//! Implementations:
//! - [`InMemoryBackend`]: lock-guarded in-process tables
//! - [`SqliteBackend`]: SQLite, one connection per operation

mod memory;
mod sqlite;

pub use memory::InMemoryBackend;
pub(crate) use sqlite::is_schema_name;
pub use sqlite::{SqliteBackend, SqliteSettings, DEFAULT_SCHEMA};

use crate::error::Result;
use crate::types::{
    AppendResult, Checkpoint, ExpectedVersion, NewEvent, ReadDirection, StoredEvent, StreamId,
    StreamMetadata, StreamVersion, Timestamp,
};
use async_trait::async_trait;
use uuid::Uuid;

/// What a commit attempt observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The whole batch was written.
    Committed(AppendResult),
    /// The expected version did not match; nothing was written.
    WrongVersion { actual: Option<StreamVersion> },
    /// At least one event id already exists in the stream; nothing was written.
    DuplicateEvent { actual: Option<StreamVersion> },
}

/// Raw stream slice as stored, before any retention policy is applied.
#[derive(Clone, Debug)]
pub struct StreamSlice {
    pub last_version: StreamVersion,
    pub last_checkpoint: Checkpoint,
    pub events: Vec<StoredEvent>,
}

/// Interface for event persistence.
#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Create tables (and the schema, when non-default). Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Remove everything this backend created.
    async fn drop_all(&self) -> Result<()>;

    /// Check `expected` against the stream and, if it holds, write the batch.
    ///
    /// `created` is the client-side timestamp; None means backend default.
    async fn commit(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
        created: Option<Timestamp>,
    ) -> Result<CommitOutcome>;

    /// Version at which `event_id` was committed to `stream`, if any.
    async fn find_event_version(
        &self,
        stream: &StreamId,
        event_id: Uuid,
    ) -> Result<Option<StreamVersion>>;

    /// Read up to `max_count` events starting at `from` (inclusive).
    ///
    /// Returns None when the stream does not exist.
    async fn read_stream(
        &self,
        stream: &StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Option<StreamSlice>>;

    /// Read up to `max_count` events across all streams starting at `from`
    /// (inclusive), in checkpoint order.
    async fn read_all(
        &self,
        from: Checkpoint,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Vec<StoredEvent>>;

    /// Highest committed checkpoint; None for an empty store.
    async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>>;

    /// Number of events in `stream`, optionally only those created before a time.
    async fn count_events(&self, stream: &StreamId, created_before: Option<Timestamp>)
        -> Result<u64>;

    async fn read_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>>;

    async fn write_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<()>;
}

/// Evaluate `expected` against a stream's current version.
pub(crate) fn version_matches(expected: ExpectedVersion, current: Option<StreamVersion>) -> bool {
    match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => current.is_none(),
        ExpectedVersion::Exact(v) => current == Some(v),
    }
}
