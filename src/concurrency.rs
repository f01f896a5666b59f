//! Optimistic concurrency on appends.
//!
//! The backend does the atomic check-and-commit. This layer validates the
//! batch, and when the backend reports a mismatch decides between an
//! idempotent replay and a [`StoreError::ConcurrencyConflict`]. A batch is a
//! replay only if its event ids are exactly the ids already committed at the
//! target position, in the same order. There is no retry: one mismatch
//! produces one outcome.

use crate::backend::{CommitOutcome, EventBackend};
use crate::error::{Result, StoreError};
use crate::types::{
    AppendResult, ExpectedVersion, NewEvent, ReadDirection, StreamId, StreamVersion, Timestamp,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct ConcurrencyController {
    backend: Arc<dyn EventBackend>,
}

impl ConcurrencyController {
    pub fn new(backend: Arc<dyn EventBackend>) -> Self {
        Self { backend }
    }

    /// Append `events` to `stream` if `expected` holds.
    pub async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
        created: Option<Timestamp>,
    ) -> Result<AppendResult> {
        validate_batch(events)?;

        let actual = match self.backend.commit(stream, expected, events, created).await? {
            CommitOutcome::Committed(result) => return Ok(result),
            CommitOutcome::WrongVersion { actual } | CommitOutcome::DuplicateEvent { actual } => {
                actual
            }
        };

        match self.replayed_result(stream, expected, events).await? {
            Some(result) => {
                debug!(
                    target: "stream_store::append",
                    stream = %stream,
                    expected = %expected,
                    events = events.len(),
                    "Idempotent append replay"
                );
                Ok(result)
            }
            None => {
                debug!(
                    target: "stream_store::append",
                    stream = %stream,
                    expected = %expected,
                    actual = ?actual,
                    "Concurrency conflict"
                );
                Err(StoreError::ConcurrencyConflict {
                    stream: stream.as_str().to_string(),
                    expected,
                    actual,
                })
            }
        }
    }

    /// If the batch was already committed at its target position, the
    /// stream's current position; otherwise None.
    async fn replayed_result(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<Option<AppendResult>> {
        let start = match expected {
            // Nothing can follow the last version, so there is nothing to replay.
            ExpectedVersion::Exact(v) => match v.next() {
                Some(start) => start,
                None => return Ok(None),
            },
            ExpectedVersion::NoStream => StreamVersion(0),
            ExpectedVersion::Any => {
                match self
                    .backend
                    .find_event_version(stream, events[0].event_id)
                    .await?
                {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
        };

        let Some(slice) = self
            .backend
            .read_stream(stream, start, events.len(), ReadDirection::Forwards)
            .await?
        else {
            return Ok(None);
        };

        let matches = slice.events.len() == events.len()
            && slice
                .events
                .iter()
                .zip(events)
                .all(|(stored, new)| stored.event_id == new.event_id);

        Ok(matches.then_some(AppendResult {
            current_version: slice.last_version,
            current_checkpoint: slice.last_checkpoint,
        }))
    }
}

/// Reject batches the backend should never see.
pub(crate) fn validate_batch(events: &[NewEvent]) -> Result<()> {
    if events.is_empty() {
        return Err(StoreError::InvalidArgument("no events to append".into()));
    }

    let mut seen = HashSet::with_capacity(events.len());
    for event in events {
        if event.event_type.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "event {} has an empty type",
                event.event_id
            )));
        }
        if !seen.insert(event.event_id) {
            return Err(StoreError::InvalidArgument(format!(
                "event id {} appears more than once in the batch",
                event.event_id
            )));
        }
    }
    Ok(())
}
