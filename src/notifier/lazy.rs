//! Construct-once holder for the store's notifier.

use super::{NotifierFactory, StoreNotifier};
use crate::backend::EventBackend;
use crate::error::{Result, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

type Construction = std::result::Result<Arc<dyn StoreNotifier>, String>;

/// The notifier is built on first use, at most once.
///
/// Concurrent first callers all wait on the same construction. A failed
/// construction is remembered and returned to every later caller.
pub(crate) struct LazyNotifier {
    store_name: String,
    factory: Option<NotifierFactory>,
    backend: Arc<dyn EventBackend>,
    cell: OnceCell<Construction>,
    released: AtomicBool,
}

impl LazyNotifier {
    pub fn new(
        store_name: String,
        factory: Option<NotifierFactory>,
        backend: Arc<dyn EventBackend>,
    ) -> Self {
        Self {
            store_name,
            factory,
            backend,
            cell: OnceCell::new(),
            released: AtomicBool::new(false),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn StoreNotifier>> {
        let construction = self
            .cell
            .get_or_init(|| async {
                let Some(factory) = &self.factory else {
                    return Err("no notifier factory configured".to_string());
                };

                match factory.build(Arc::clone(&self.backend)).await {
                    Ok(notifier) => {
                        info!(
                            target: "stream_store::notifier",
                            store = %self.store_name,
                            factory = ?factory,
                            "Notifier constructed"
                        );
                        Ok(notifier)
                    }
                    Err(e) => {
                        warn!(
                            target: "stream_store::notifier",
                            store = %self.store_name,
                            error = %e,
                            "Notifier construction failed"
                        );
                        Err(e.to_string())
                    }
                }
            })
            .await;

        construction
            .clone()
            .map_err(StoreError::NotifierInitialization)
    }

    /// The notifier, if it has been successfully constructed. Never constructs.
    pub fn constructed(&self) -> Option<Arc<dyn StoreNotifier>> {
        self.cell.get().and_then(|c| c.as_ref().ok().cloned())
    }

    /// Shut the notifier down if it was constructed. Only the first call acts.
    pub async fn release(&self) -> bool {
        let Some(notifier) = self.constructed() else {
            return false;
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        notifier.shutdown().await;
        true
    }
}
