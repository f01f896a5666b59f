//! Core types for the stream store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Zero-based position of an event within its stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StreamVersion(pub u64);

impl fmt::Debug for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamVersion {
    /// The following version, or None at the end of the version space.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(StreamVersion)
    }

    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(StreamVersion)
    }
}

/// Global, store-wide position assigned to every committed event.
///
/// An empty store has no checkpoint; APIs model that as `None`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Checkpoint(pub u64);

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoint({})", self.0)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Checkpoint {
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Checkpoint)
    }

    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Checkpoint)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as i64))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Optimistic concurrency token supplied with an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No check, always append.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must currently be at exactly this version.
    Exact(StreamVersion),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Exact(v) => write!(f, "{}", v.0),
        }
    }
}

impl From<StreamVersion> for ExpectedVersion {
    fn from(version: StreamVersion) -> Self {
        ExpectedVersion::Exact(version)
    }
}

/// Validated stream identity.
///
/// The original id is kept for display and reads; the internal id is a
/// fixed-width digest used as the backend key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    original: String,
    internal: String,
}

impl StreamId {
    pub fn parse(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("stream id must not be empty".into()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(StoreError::InvalidArgument(format!(
                "stream id '{}' must not contain whitespace",
                id
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());

        Ok(Self {
            original: id.to_string(),
            internal: hex::encode(hasher.finalize()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn internal(&self) -> &str {
        &self.internal
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.original)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Input for appending an event.
#[derive(Clone, Debug)]
pub struct NewEvent {
    /// Caller-chosen identity, used to detect idempotent replays.
    pub event_id: Uuid,

    /// Event type tag.
    pub event_type: String,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Opaque metadata bytes.
    pub metadata: Option<Vec<u8>>,
}

impl NewEvent {
    /// Create an event with a fresh random id.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload: payload.into(),
            metadata: None,
        }
    }

    /// Create a JSON-encoded event.
    pub fn json<T: Serialize>(event_type: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_vec(value)?))
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A committed, immutable event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_version: StreamVersion,
    pub checkpoint: Checkpoint,
    pub event_type: String,
    pub created: Timestamp,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

impl StoredEvent {
    /// Decode the payload as JSON.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Stream position after a successful append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResult {
    pub current_version: StreamVersion,
    pub current_checkpoint: Checkpoint,
}

/// Read direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadDirection {
    Forwards,
    Backwards,
}

/// Outcome of a stream read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageReadStatus {
    Success,
    StreamNotFound,
}

/// A page of events read from one stream.
#[derive(Clone, Debug)]
pub struct StreamPage {
    pub stream_id: String,
    pub status: PageReadStatus,
    pub direction: ReadDirection,
    pub from_version: Option<StreamVersion>,
    /// Where the next page starts (None when the read reached either end of the version space).
    pub next_version: Option<StreamVersion>,
    pub last_stream_version: Option<StreamVersion>,
    pub last_stream_checkpoint: Option<Checkpoint>,
    pub is_end: bool,
    pub events: Vec<StoredEvent>,
}

impl StreamPage {
    pub(crate) fn not_found(
        stream: &StreamId,
        direction: ReadDirection,
        from_version: Option<StreamVersion>,
    ) -> Self {
        Self {
            stream_id: stream.as_str().to_string(),
            status: PageReadStatus::StreamNotFound,
            direction,
            from_version,
            next_version: None,
            last_stream_version: None,
            last_stream_checkpoint: None,
            is_end: true,
            events: Vec::new(),
        }
    }
}

/// A page of events read across all streams in checkpoint order.
#[derive(Clone, Debug)]
pub struct AllPage {
    pub direction: ReadDirection,
    pub from_checkpoint: Option<Checkpoint>,
    /// Where the next page starts (None when the read reached either end of the checkpoint space).
    pub next_checkpoint: Option<Checkpoint>,
    pub is_end: bool,
    pub events: Vec<StoredEvent>,
}

/// Per-stream retention policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Events older than this are no longer current.
    #[serde(default, with = "duration_secs")]
    pub max_age: Option<Duration>,

    /// Only the latest `max_count` events of the stream are current.
    #[serde(default)]
    pub max_count: Option<u64>,

    /// Caller-defined metadata, stored verbatim.
    #[serde(default)]
    pub custom_json: Option<serde_json::Value>,
}

impl StreamMetadata {
    pub fn is_unrestricted(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }

    /// Whether an event is still current under this policy.
    ///
    /// `last_version` is the stream's head, needed for `max_count`; pass None
    /// to evaluate age only.
    pub fn is_current(
        &self,
        event: &StoredEvent,
        now: Timestamp,
        last_version: Option<StreamVersion>,
    ) -> bool {
        if let Some(max_age) = self.max_age {
            if event.created < now.saturating_sub(max_age) {
                return false;
            }
        }
        if let (Some(max_count), Some(last)) = (self.max_count, last_version) {
            if last.0.saturating_sub(event.stream_version.0) >= max_count {
                return false;
            }
        }
        true
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(version: u64, created: i64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            stream_id: "s".into(),
            stream_version: StreamVersion(version),
            checkpoint: Checkpoint(version),
            event_type: "t".into(),
            created: Timestamp(created),
            payload: vec![],
            metadata: None,
        }
    }

    #[test]
    fn test_stream_id_hashing_is_stable() {
        let a = StreamId::parse("account-42").unwrap();
        let b = StreamId::parse("account-42").unwrap();
        assert_eq!(a.internal(), b.internal());
        assert_eq!(a.internal().len(), 64);
        assert_eq!(a.as_str(), "account-42");
    }

    #[test]
    fn test_positions_stop_at_the_ends() {
        assert_eq!(StreamVersion(4).next(), Some(StreamVersion(5)));
        assert_eq!(StreamVersion(u64::MAX).next(), None);
        assert_eq!(Checkpoint(0).prev(), None);
        assert_eq!(Checkpoint(u64::MAX).next(), None);
    }

    #[test]
    fn test_stream_id_rejects_bad_input() {
        assert!(matches!(StreamId::parse(""), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(StreamId::parse("a b"), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_metadata_max_age() {
        let meta = StreamMetadata {
            max_age: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let now = Timestamp(60_000_000);
        assert!(meta.is_current(&event_at(0, 55_000_000), now, None));
        assert!(!meta.is_current(&event_at(0, 40_000_000), now, None));
    }

    #[test]
    fn test_metadata_max_count() {
        let meta = StreamMetadata {
            max_count: Some(2),
            ..Default::default()
        };
        let now = Timestamp::now();
        let last = Some(StreamVersion(4));
        assert!(meta.is_current(&event_at(4, 0), now, last));
        assert!(meta.is_current(&event_at(3, 0), now, last));
        assert!(!meta.is_current(&event_at(2, 0), now, last));
    }

    #[test]
    fn test_metadata_json_shape() {
        let meta = StreamMetadata {
            max_age: Some(Duration::from_secs(90)),
            max_count: None,
            custom_json: Some(serde_json::json!({"owner": "billing"})),
        };
        let encoded = serde_json::to_string(&meta).unwrap();
        assert!(encoded.contains("\"max_age\":90"));
        let decoded: StreamMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }
}
