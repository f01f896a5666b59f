//! # Stream Store
//!
//! An append-only, multi-stream event store with optimistic concurrency,
//! a global checkpoint order across all streams, and catch-up subscriptions
//! that replay history and then follow new events live.
//!
//! ## Core Concepts
//!
//! - **Streams**: Ordered event sequences with gapless, zero-based versions
//! - **Checkpoints**: Global positions assigned at commit, strictly increasing
//! - **Expected versions**: Optimistic concurrency tokens checked on append
//! - **Subscriptions**: Catch-up readers woken by a pluggable notifier
//! - **Metadata**: Per-stream max-age / max-count policy, cached with expiry
//!
//! ## Example
//!
//! ```ignore
//! use stream_store::{ExpectedVersion, NewEvent, Store, StoreConfig, SubscriptionConfig};
//!
//! let store = Store::open_sqlite(StoreConfig {
//!     connection: "./events.db".into(),
//!     ..Default::default()
//! })?;
//! store.initialize(false).await?;
//!
//! // Append to a new stream
//! let result = store
//!     .append("order-42", ExpectedVersion::NoStream, &[
//!         NewEvent::json("order-placed", &json!({ "total": 99 }))?,
//!     ])
//!     .await?;
//!
//! // Follow every stream from the beginning
//! let mut subscription = store.subscribe_to_all("projector", None, SubscriptionConfig::default())?;
//! while let Some(event) = subscription.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod checkpoint;
pub mod clock;
pub mod concurrency;
pub mod error;
pub mod notifier;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use backend::{
    CommitOutcome, EventBackend, InMemoryBackend, SqliteBackend, SqliteSettings, StreamSlice,
};
pub use cache::MetadataCache;
pub use checkpoint::CheckpointReader;
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::ConcurrencyController;
pub use error::{Result, StoreError};
pub use notifier::{
    InProcessNotifier, NotifierFactory, NotifierFuture, NotifierSignal, PollingNotifier,
    SignalHub, StoreNotifier,
};
pub use store::{Store, StoreConfig};
pub use subscriptions::{
    DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle, SubscriptionState,
};
pub use types::*;
