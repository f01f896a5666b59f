//! Catch-up subscriptions.
//!
//! A subscription replays history from a starting position, reports
//! [`SubscriptionEvent::CaughtUp`], then keeps delivering new events as the
//! store's notifier signals them. Each subscription runs as its own tokio
//! task and hands events to its [`SubscriptionHandle`] through a bounded
//! channel; a slow consumer slows its subscription down rather than losing
//! events.
//!
//! # Example
//!
//! ```ignore
//! let mut handle = store.subscribe_to_all("projector", None, SubscriptionConfig::default())?;
//!
//! while let Some(event) = handle.recv().await {
//!     match event {
//!         SubscriptionEvent::Event(event) => project(&event),
//!         SubscriptionEvent::CaughtUp => println!("Now live!"),
//!         SubscriptionEvent::Dropped { reason } => {
//!             println!("Stopped: {:?}", reason);
//!             break;
//!         }
//!     }
//! }
//! ```

mod engine;
mod types;

pub(crate) use engine::{spawn, Start, Target};
pub use types::{
    DropReason, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle, SubscriptionState,
};
