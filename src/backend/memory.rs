//! In-process backend.

use super::{version_matches, CommitOutcome, EventBackend, StreamSlice};
use crate::error::Result;
use crate::types::{
    AppendResult, Checkpoint, ExpectedVersion, NewEvent, ReadDirection, StoredEvent, StreamId,
    StreamMetadata, StreamVersion, Timestamp,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Per-stream index into the global log.
#[derive(Default)]
struct StreamEntry {
    /// Checkpoint of each event, indexed by stream version.
    checkpoints: Vec<u64>,
    event_ids: HashMap<Uuid, StreamVersion>,
}

#[derive(Default)]
struct Tables {
    /// All events; index == checkpoint.
    log: Vec<StoredEvent>,
    streams: HashMap<String, StreamEntry>,
    metadata: HashMap<String, StreamMetadata>,
}

impl Tables {
    fn current_version(&self, stream: &StreamId) -> Option<StreamVersion> {
        self.streams
            .get(stream.internal())
            .and_then(|s| s.checkpoints.len().checked_sub(1))
            .map(|v| StreamVersion(v as u64))
    }
}

/// Backend keeping every table in memory.
///
/// The single write lock makes check-then-commit atomic.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBackend for InMemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        *self.tables.write() = Tables::default();
        Ok(())
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
        created: Option<Timestamp>,
    ) -> Result<CommitOutcome> {
        let mut tables = self.tables.write();
        let actual = tables.current_version(stream);

        if !version_matches(expected, actual) {
            return Ok(CommitOutcome::WrongVersion { actual });
        }

        if let Some(entry) = tables.streams.get(stream.internal()) {
            if events.iter().any(|e| entry.event_ids.contains_key(&e.event_id)) {
                return Ok(CommitOutcome::DuplicateEvent { actual });
            }
        }

        let created = created.unwrap_or_else(Timestamp::now);
        // Versions are dense, so the next one is the stream's length.
        let first_version = tables
            .streams
            .get(stream.internal())
            .map_or(0, |s| s.checkpoints.len());
        let mut last = None;

        for (offset, event) in events.iter().enumerate() {
            let next_version = StreamVersion((first_version + offset) as u64);
            let checkpoint = Checkpoint(tables.log.len() as u64);
            tables.log.push(StoredEvent {
                event_id: event.event_id,
                stream_id: stream.as_str().to_string(),
                stream_version: next_version,
                checkpoint,
                event_type: event.event_type.clone(),
                created,
                payload: event.payload.clone(),
                metadata: event.metadata.clone(),
            });

            let entry = tables
                .streams
                .entry(stream.internal().to_string())
                .or_default();
            entry.checkpoints.push(checkpoint.0);
            entry.event_ids.insert(event.event_id, next_version);

            last = Some(AppendResult {
                current_version: next_version,
                current_checkpoint: checkpoint,
            });
        }

        match last {
            Some(result) => Ok(CommitOutcome::Committed(result)),
            // Nothing to write; report the stream as it stands.
            None => Ok(CommitOutcome::WrongVersion { actual }),
        }
    }

    async fn find_event_version(
        &self,
        stream: &StreamId,
        event_id: Uuid,
    ) -> Result<Option<StreamVersion>> {
        Ok(self
            .tables
            .read()
            .streams
            .get(stream.internal())
            .and_then(|s| s.event_ids.get(&event_id).copied()))
    }

    async fn read_stream(
        &self,
        stream: &StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Option<StreamSlice>> {
        let tables = self.tables.read();
        let Some(entry) = tables.streams.get(stream.internal()) else {
            return Ok(None);
        };
        let Some(&last_checkpoint) = entry.checkpoints.last() else {
            return Ok(None);
        };
        let len = entry.checkpoints.len();

        let versions: Vec<usize> = match direction {
            ReadDirection::Forwards => (from.0 as usize..len).take(max_count).collect(),
            ReadDirection::Backwards => {
                let start = (from.0 as usize).min(len - 1);
                (0..=start).rev().take(max_count).collect()
            }
        };

        let events = versions
            .into_iter()
            .map(|v| tables.log[entry.checkpoints[v] as usize].clone())
            .collect();

        Ok(Some(StreamSlice {
            last_version: StreamVersion(len as u64 - 1),
            last_checkpoint: Checkpoint(last_checkpoint),
            events,
        }))
    }

    async fn read_all(
        &self,
        from: Checkpoint,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<Vec<StoredEvent>> {
        let tables = self.tables.read();
        let len = tables.log.len();
        if len == 0 {
            return Ok(Vec::new());
        }

        let events = match direction {
            ReadDirection::Forwards => tables
                .log
                .iter()
                .skip(from.0 as usize)
                .take(max_count)
                .cloned()
                .collect(),
            ReadDirection::Backwards => {
                let start = (from.0 as usize).min(len - 1);
                tables.log[..=start]
                    .iter()
                    .rev()
                    .take(max_count)
                    .cloned()
                    .collect()
            }
        };

        Ok(events)
    }

    async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let len = self.tables.read().log.len();
        Ok(len.checked_sub(1).map(|c| Checkpoint(c as u64)))
    }

    async fn count_events(
        &self,
        stream: &StreamId,
        created_before: Option<Timestamp>,
    ) -> Result<u64> {
        let tables = self.tables.read();
        let Some(entry) = tables.streams.get(stream.internal()) else {
            return Ok(0);
        };

        let count = match created_before {
            None => entry.checkpoints.len(),
            Some(before) => entry
                .checkpoints
                .iter()
                .filter(|&&c| tables.log[c as usize].created < before)
                .count(),
        };

        Ok(count as u64)
    }

    async fn read_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>> {
        Ok(self.tables.read().metadata.get(stream.internal()).cloned())
    }

    async fn write_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<()> {
        self.tables
            .write()
            .metadata
            .insert(stream.internal().to_string(), metadata.clone());
        Ok(())
    }
}
