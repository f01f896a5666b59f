//! Head checkpoint and event counts.

use crate::backend::EventBackend;
use crate::error::Result;
use crate::types::{Checkpoint, StreamId, Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// No checkpoint observed yet.
const NONE_OBSERVED: i64 = -1;

/// Read-only view of the store's head.
///
/// Remembers the highest head it has returned so a lagging read can never
/// make the head appear to move backwards.
pub struct CheckpointReader {
    backend: Arc<dyn EventBackend>,
    high_water: AtomicI64,
}

impl CheckpointReader {
    pub fn new(backend: Arc<dyn EventBackend>) -> Self {
        Self {
            backend,
            high_water: AtomicI64::new(NONE_OBSERVED),
        }
    }

    /// Highest committed checkpoint, or None for a store that has never
    /// committed an event.
    pub async fn read_head_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let head = self.backend.read_head_checkpoint().await?;
        let read = head.map(|c| c.0 as i64).unwrap_or(NONE_OBSERVED);
        let previous = self.high_water.fetch_max(read, Ordering::SeqCst);
        let observed = previous.max(read);

        Ok((observed >= 0).then(|| Checkpoint(observed as u64)))
    }

    pub async fn count_events(&self, stream: &StreamId) -> Result<u64> {
        self.backend.count_events(stream, None).await
    }

    pub async fn count_events_before(
        &self,
        stream: &StreamId,
        created_before: Timestamp,
    ) -> Result<u64> {
        self.backend.count_events(stream, Some(created_before)).await
    }

    /// Forget the high-water mark; used when the store's contents are dropped.
    pub fn reset(&self) {
        self.high_water.store(NONE_OBSERVED, Ordering::SeqCst);
    }
}
