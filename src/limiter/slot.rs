//! Concurrency-slot release guard.

use std::sync::Arc;

use tracing::warn;

use crate::store::CounterStore;

/// A held concurrency slot.
///
/// The slot is released by [`release`](SlotGuard::release) on the normal
/// path; if the guard is dropped without an explicit release (cancellation,
/// panic, early return), the decrement is spawned onto the runtime so the
/// slot is never leaked.
pub struct SlotGuard {
    store: Arc<dyn CounterStore>,
    key: String,
    released: bool,
}

impl SlotGuard {
    pub(crate) fn new(store: Arc<dyn CounterStore>, key: String) -> Self {
        Self {
            store,
            key,
            released: false,
        }
    }

    /// Release the slot. Store failures are logged, not propagated: a
    /// leaked counter self-heals via its TTL.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.decrement(&self.key, 1).await {
            warn!(key = %self.key, "failed to release concurrency slot: {e}");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.decrement(&key, 1).await {
                    warn!(key = %key, "failed to release concurrency slot on drop: {e}");
                }
            });
        } else {
            warn!(key = %key, "slot guard dropped outside a runtime; slot will expire via TTL");
        }
    }
}
