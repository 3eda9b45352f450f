//! In-memory counter store.
//!
//! Uses [`DashMap`] with per-entry expiry. Suitable for tests and
//! single-process deployments; production multi-instance deployments
//! should implement [`CounterStore`] over a shared counter service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::CounterStore;
use crate::error::StoreError;

struct CounterCell {
    count: u64,
    expires_at: Instant,
}

/// In-memory [`CounterStore`] backed by [`DashMap`].
///
/// Expired cells are lazily reset or removed on access; windows self-clean
/// without an explicit sweep. Each operation holds only the shard lock for
/// the touched key, so increments on the same key are atomic.
pub struct MemoryCounterStore {
    cells: DashMap<String, CounterCell>,
}

impl MemoryCounterStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// Number of live (non-expired) counters. Test/diagnostic helper.
    pub fn live_len(&self) -> usize {
        let now = Instant::now();
        self.cells.iter().filter(|e| e.expires_at > now).count()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| CounterCell {
                count: 0,
                expires_at: now + ttl,
            });
        if cell.expires_at <= now {
            cell.count = 0;
        }
        cell.count = cell.count.saturating_add(delta);
        cell.expires_at = now + ttl;
        Ok(cell.count)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        if let Some(cell) = self.cells.get(key) {
            if Instant::now() < cell.expires_at {
                return Ok(cell.count);
            }
            drop(cell);
            self.cells.remove(key);
        }
        Ok(0)
    }

    async fn decrement(&self, key: &str, delta: u64) -> Result<(), StoreError> {
        if let Some(mut cell) = self.cells.get_mut(key) {
            if Instant::now() < cell.expires_at {
                cell.count = cell.count.saturating_sub(delta);
            }
        }
        Ok(())
    }
}
