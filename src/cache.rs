//! Bounded, time-expiring cache of stream metadata.
//!
//! Cache-aside: a miss or an expired entry falls through to the supplied
//! fetch, and the fresh value is stored with a new expiry. Entries are never
//! promoted on read, so the LRU order is insertion order and eviction drops
//! the oldest entry first.

use crate::clock::Clock;
use crate::error::Result;
use crate::types::{StreamId, StreamMetadata, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// Cached metadata plus its expiry.
#[derive(Clone)]
struct CachedMetadata {
    metadata: StreamMetadata,
    expires: Timestamp,
}

pub struct MetadataCache {
    max_age: Duration,

    clock: Arc<dyn Clock>,

    /// None when caching is disabled (zero size or zero age).
    entries: Option<Mutex<LruCache<String, CachedMetadata>>>,
}

impl MetadataCache {
    pub fn new(max_age: Duration, max_size: usize, clock: Arc<dyn Clock>) -> Self {
        let entries = match NonZeroUsize::new(max_size) {
            Some(size) if !max_age.is_zero() => Some(Mutex::new(LruCache::new(size))),
            _ => None,
        };

        Self {
            max_age,
            clock,
            entries,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Return cached metadata for `stream`, fetching it on miss or expiry.
    ///
    /// The lock is never held across the fetch.
    pub async fn get_or_fetch<F, Fut>(&self, stream: &StreamId, fetch: F) -> Result<StreamMetadata>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<StreamMetadata>>>,
    {
        let Some(entries) = &self.entries else {
            return Ok(fetch().await?.unwrap_or_default());
        };

        {
            let mut entries = entries.lock();
            let now = self.clock.now();
            match entries.peek(stream.internal()) {
                Some(cached) if cached.expires > now => return Ok(cached.metadata.clone()),
                Some(_) => {
                    entries.pop(stream.internal());
                }
                None => {}
            }
        }

        let metadata = fetch().await?.unwrap_or_default();
        let expires = self.clock.now().saturating_add(self.max_age);

        entries.lock().put(
            stream.internal().to_string(),
            CachedMetadata {
                metadata: metadata.clone(),
                expires,
            },
        );

        Ok(metadata)
    }

    /// Forget one stream's entry.
    pub fn invalidate(&self, stream: &StreamId) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(stream.internal());
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    /// Number of entries currently held (expired entries included until touched).
    pub fn len(&self) -> usize {
        self.entries.as_ref().map(|e| e.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, stream: &StreamId) -> bool {
        self.entries
            .as_ref()
            .map(|e| e.lock().contains(stream.internal()))
            .unwrap_or(false)
    }
}
