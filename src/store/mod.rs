//! Atomic, expiring counter storage.
//!
//! The [`CounterStore`] is the sole synchronization primitive the rest of
//! the layer depends on: no component performs read-then-write on shared
//! counters outside of it. The in-memory implementation suits a
//! single-process deployment; multi-process deployments implement the same
//! trait over a distributed counter service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

mod memory;

pub use memory::MemoryCounterStore;

/// What to do when the counter store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit the request and log a warning.
    FailOpen,
    /// Reject the request.
    #[default]
    FailClosed,
}

/// Atomic counter storage with per-key expiry.
///
/// All operations must be safe under arbitrary concurrent callers touching
/// the same key. Implementations must fail with an error rather than hang;
/// callers resolve failures through [`FailurePolicy`].
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the counter at `key` and return the new
    /// value. The increment and the TTL refresh happen as one logical
    /// operation so no window lives forever.
    async fn increment_and_get(&self, key: &str, delta: u64, ttl: Duration)
    -> Result<u64, StoreError>;

    /// Read the current value, zero if absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Subtract `delta` from the counter at `key`, saturating at zero.
    /// Used to release concurrency slots and to roll back optimistic
    /// increments.
    async fn decrement(&self, key: &str, delta: u64) -> Result<(), StoreError>;
}
