//! Sliding-window limiter over the counter store.
//!
//! The window is a rolling interval, not a fixed bucket, so a burst cannot
//! straddle a boundary and double its allowance. Internally the window is
//! split into sub-buckets keyed by their start second
//! (`rate:{principal}:{kind}:{bucket_start}`); sub-buckets expire via store
//! TTL, which is the "discard entries older than the window" step.
//!
//! Checks are optimistic: the event is recorded first, then rolled back
//! with a decrement if a ceiling was crossed. Concurrent callers hitting
//! the same bucket are resolved by whoever increments first. The prior
//! buckets are summed in a separate read pass, so two checks straddling a
//! sub-bucket boundary can each miss the other's event and jointly
//! overshoot a ceiling by a single event; within one bucket the
//! increment-then-compare is exact.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::slot::SlotGuard;
use crate::config::RateLimits;
use crate::error::StoreError;
use crate::store::{CounterStore, FailurePolicy};

/// Sub-buckets per window. More buckets track the rolling edge more
/// precisely at the cost of more store reads per check.
const SUB_BUCKETS: u64 = 10;

/// Concurrency slots self-heal after this long if a release is lost.
const SLOT_TTL: Duration = Duration::from_secs(600);

/// Why a rate check denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDenyReason {
    /// Request-count ceiling for the window was hit.
    RequestCeiling,
    /// Token-count ceiling for the window was hit.
    TokenCeiling,
    /// The counter store was unreachable and policy is fail-closed.
    StoreUnavailable,
}

/// Result of a rate limit check.
#[derive(Debug, Clone)]
pub struct RateCheck {
    pub allowed: bool,
    /// Requests left in the window after this one.
    pub remaining: u64,
    /// How long until capacity frees up, set on denial.
    pub retry_after: Option<Duration>,
    pub reason: Option<RateDenyReason>,
    /// True when the store failed and the fail-open policy admitted the
    /// request anyway. Surfaced as a warning, never as an error.
    pub degraded: bool,
}

impl RateCheck {
    fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
            reason: None,
            degraded: false,
        }
    }

    fn denied(reason: RateDenyReason, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
            reason: Some(reason),
            degraded: false,
        }
    }
}

/// Sliding-window request/token limiter built on [`CounterStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    bucket_width: u64,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        window: Duration,
        failure_policy: FailurePolicy,
        store_timeout: Duration,
    ) -> Self {
        let window_secs = window.as_secs().max(1);
        Self {
            store,
            window: Duration::from_secs(window_secs),
            bucket_width: (window_secs / SUB_BUCKETS).max(1),
            failure_policy,
            store_timeout,
        }
    }

    fn bucket_key(principal_id: &str, kind: &str, bucket_start: u64) -> String {
        format!("rate:{principal_id}:{kind}:{bucket_start}")
    }

    fn slot_key(principal_id: &str) -> String {
        format!("conc:{principal_id}")
    }

    /// Keep a bucket around until it has fully left the window.
    fn bucket_ttl(&self) -> Duration {
        self.window + Duration::from_secs(self.bucket_width)
    }

    async fn store_op<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Live bucket start timestamps, oldest first, for the current moment.
    /// A bucket stays live until it has fully exited the window: events
    /// recorded in it may be up to `bucket_width` newer than its start, so
    /// dropping it on start alone would let a burst at the end of a bucket
    /// be forgotten one bucket-width early and a second burst overrun the
    /// ceiling. The trailing edge over-counts by up to one bucket-width
    /// instead.
    fn live_bucket_starts(&self, now: u64) -> Vec<u64> {
        let floor = now.saturating_sub(self.window.as_secs());
        let current = now - now % self.bucket_width;
        let mut starts: Vec<u64> = Vec::new();
        let mut start = current;
        while start + self.bucket_width > floor {
            starts.push(start);
            if start < self.bucket_width {
                break;
            }
            start -= self.bucket_width;
        }
        starts.reverse();
        starts
    }

    /// Sum the counts of the given buckets, also returning the oldest
    /// bucket start that holds any events.
    async fn sum_buckets(
        &self,
        principal_id: &str,
        kind: &str,
        starts: &[u64],
    ) -> Result<(u64, Option<u64>), StoreError> {
        let mut total = 0u64;
        let mut oldest_live: Option<u64> = None;
        for &start in starts {
            let count = self
                .store_op(self.store.get(&Self::bucket_key(principal_id, kind, start)))
                .await?;
            if count > 0 {
                total += count;
                oldest_live.get_or_insert(start);
            }
        }
        Ok((total, oldest_live))
    }

    fn retry_after_from(&self, oldest_start: Option<u64>, now: u64) -> Duration {
        let window = self.window.as_secs();
        let secs = oldest_start
            .map(|start| (start + window).saturating_sub(now))
            .unwrap_or(1)
            .max(1);
        Duration::from_secs(secs)
    }

    fn on_store_failure(&self, err: &StoreError) -> RateCheck {
        warn!(policy = ?self.failure_policy, "rate check hit store failure: {err}");
        match self.failure_policy {
            FailurePolicy::FailOpen => RateCheck {
                allowed: true,
                remaining: 0,
                retry_after: None,
                reason: Some(RateDenyReason::StoreUnavailable),
                degraded: true,
            },
            FailurePolicy::FailClosed => RateCheck {
                allowed: false,
                remaining: 0,
                retry_after: Some(Duration::from_secs(1)),
                reason: Some(RateDenyReason::StoreUnavailable),
                degraded: false,
            },
        }
    }

    /// Check the request against the window ceilings, recording it when
    /// admitted. Both the request-count and token-count ceilings must pass.
    pub async fn check(
        &self,
        principal_id: &str,
        limits: RateLimits,
        estimated_tokens: u64,
    ) -> RateCheck {
        match self.try_check(principal_id, limits, estimated_tokens).await {
            Ok(check) => check,
            Err(err) => self.on_store_failure(&err),
        }
    }

    async fn try_check(
        &self,
        principal_id: &str,
        limits: RateLimits,
        estimated_tokens: u64,
    ) -> Result<RateCheck, StoreError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let starts = self.live_bucket_starts(now);
        let current = *starts.last().unwrap_or(&now);
        let prior = &starts[..starts.len().saturating_sub(1)];
        let ttl = self.bucket_ttl();

        // Request-count ceiling: optimistic increment, rollback on breach.
        let (req_prior, req_oldest) = self.sum_buckets(principal_id, "req", prior).await?;
        let req_key = Self::bucket_key(principal_id, "req", current);
        let req_current = self
            .store_op(self.store.increment_and_get(&req_key, 1, ttl))
            .await?;
        let req_total = req_prior + req_current;
        if req_total > limits.max_requests {
            self.store_op(self.store.decrement(&req_key, 1)).await?;
            let oldest = req_oldest.or(Some(current));
            debug!(principal_id, req_total, "rate check denied: request ceiling");
            return Ok(RateCheck::denied(
                RateDenyReason::RequestCeiling,
                Some(self.retry_after_from(oldest, now)),
            ));
        }

        // Token-count ceiling.
        let (tok_prior, tok_oldest) = self.sum_buckets(principal_id, "tok", prior).await?;
        let tok_key = Self::bucket_key(principal_id, "tok", current);
        let tok_current = self
            .store_op(
                self.store
                    .increment_and_get(&tok_key, estimated_tokens, ttl),
            )
            .await?;
        let tok_total = tok_prior + tok_current;
        if tok_total > limits.max_window_tokens {
            self.store_op(self.store.decrement(&tok_key, estimated_tokens))
                .await?;
            self.store_op(self.store.decrement(&req_key, 1)).await?;
            let oldest = tok_oldest.or(Some(current));
            debug!(principal_id, tok_total, "rate check denied: token ceiling");
            return Ok(RateCheck::denied(
                RateDenyReason::TokenCeiling,
                Some(self.retry_after_from(oldest, now)),
            ));
        }

        Ok(RateCheck::allowed(limits.max_requests - req_total))
    }

    /// Acquire a concurrency slot, enforcing `max_concurrent`.
    ///
    /// Returns a guard that must be released when the request completes;
    /// `None` when the ceiling is already occupied.
    pub async fn acquire_slot(
        &self,
        principal_id: &str,
        max_concurrent: u32,
    ) -> Result<Option<SlotGuard>, StoreError> {
        let key = Self::slot_key(principal_id);
        let held = self
            .store_op(self.store.increment_and_get(&key, 1, SLOT_TTL))
            .await?;
        if held > max_concurrent as u64 {
            self.store_op(self.store.decrement(&key, 1)).await?;
            debug!(principal_id, held, max_concurrent, "concurrency slot denied");
            return Ok(None);
        }
        Ok(Some(SlotGuard::new(Arc::clone(&self.store), key)))
    }

    /// Decrement the concurrency counter directly, for callers that manage
    /// request completion outside of a guard.
    pub async fn release_concurrent(&self, principal_id: &str) -> Result<(), StoreError> {
        self.store_op(self.store.decrement(&Self::slot_key(principal_id), 1))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn limiter(window_secs: u64, policy: FailurePolicy) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(window_secs),
            policy,
            Duration::from_millis(100),
        )
    }

    fn limits(max_requests: u64, max_window_tokens: u64) -> RateLimits {
        RateLimits {
            max_requests,
            max_window_tokens,
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_request_ceiling() {
        let limiter = limiter(60, FailurePolicy::FailClosed);
        let limits = limits(3, 1_000_000);

        for _ in 0..3 {
            let check = limiter.check("p", limits, 100).await;
            assert!(check.allowed);
        }
        let check = limiter.check("p", limits, 100).await;
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(RateDenyReason::RequestCeiling));
        assert!(check.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_token_ceiling_is_also_mandatory() {
        let limiter = limiter(60, FailurePolicy::FailClosed);
        let limits = limits(100, 1_000);

        assert!(limiter.check("p", limits, 600).await.allowed);
        let check = limiter.check("p", limits, 600).await;
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(RateDenyReason::TokenCeiling));
    }

    #[tokio::test]
    async fn test_denied_request_does_not_consume_capacity() {
        let limiter = limiter(60, FailurePolicy::FailClosed);
        let limits = limits(2, 1_000);

        assert!(limiter.check("p", limits, 100).await.allowed);
        assert!(limiter.check("p", limits, 100).await.allowed);
        // Denied on request count; rollback means token capacity is intact.
        assert!(!limiter.check("p", limits, 100).await.allowed);

        // A different ceiling mix still sees only the two admitted events.
        let wide = RateLimits {
            max_requests: 10,
            max_window_tokens: 1_000,
        };
        let check = limiter.check("p", wide, 100).await;
        assert!(check.allowed);
        assert_eq!(check.remaining, 10 - 3);
    }

    #[tokio::test]
    async fn test_principals_are_isolated() {
        let limiter = limiter(60, FailurePolicy::FailClosed);
        let limits = limits(1, 1_000);

        assert!(limiter.check("a", limits, 10).await.allowed);
        assert!(!limiter.check("a", limits, 10).await.allowed);
        assert!(limiter.check("b", limits, 10).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_closed_on_store_error() {
        struct DownStore;
        #[async_trait::async_trait]
        impl CounterStore for DownStore {
            async fn increment_and_get(
                &self,
                _key: &str,
                _delta: u64,
                _ttl: Duration,
            ) -> Result<u64, StoreError> {
                Err(StoreError::Unreachable("connection refused".into()))
            }
            async fn get(&self, _key: &str) -> Result<u64, StoreError> {
                Err(StoreError::Unreachable("connection refused".into()))
            }
            async fn decrement(&self, _key: &str, _delta: u64) -> Result<(), StoreError> {
                Err(StoreError::Unreachable("connection refused".into()))
            }
        }

        let limiter = SlidingWindowLimiter::new(
            Arc::new(DownStore),
            Duration::from_secs(60),
            FailurePolicy::FailClosed,
            Duration::from_millis(50),
        );
        let check = limiter.check("p", limits(10, 1_000), 100).await;
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(RateDenyReason::StoreUnavailable));

        let open = SlidingWindowLimiter::new(
            Arc::new(DownStore),
            Duration::from_secs(60),
            FailurePolicy::FailOpen,
            Duration::from_millis(50),
        );
        let check = open.check("p", limits(10, 1_000), 100).await;
        assert!(check.allowed);
        assert!(check.degraded);
    }

    #[tokio::test]
    async fn test_concurrency_slots() {
        let limiter = limiter(60, FailurePolicy::FailClosed);

        let a = limiter.acquire_slot("p", 2).await.unwrap();
        let b = limiter.acquire_slot("p", 2).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(limiter.acquire_slot("p", 2).await.unwrap().is_none());

        a.unwrap().release().await;
        assert!(limiter.acquire_slot("p", 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_window_capacity_frees_over_time() {
        // 1-second window: admitted events age out quickly. Capacity frees
        // once the bucket has fully exited, window + bucket_width after
        // its start.
        let limiter = limiter(1, FailurePolicy::FailClosed);
        let limits = limits(1, 1_000);

        assert!(limiter.check("p", limits, 10).await.allowed);
        assert!(!limiter.check("p", limits, 10).await.allowed);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(limiter.check("p", limits, 10).await.allowed);
    }

    #[test]
    fn test_buckets_live_until_fully_exited() {
        // 10-second window, 1-second sub-buckets. At t=100 the floor is
        // 90; bucket 90 may hold events from up to second 91, still inside
        // the window, so it must be live.
        let limiter = limiter(10, FailurePolicy::FailClosed);
        let starts = limiter.live_bucket_starts(100);

        assert_eq!(starts.first(), Some(&90));
        assert_eq!(starts.last(), Some(&100));
        assert_eq!(starts.len(), 11);
    }

    #[tokio::test]
    async fn test_burst_counted_after_bucket_start_leaves_window() {
        // A burst recorded late in a sub-bucket must still count against
        // the window after the bucket's start second has aged out;
        // otherwise a second full burst lands less than a window after the
        // first and overruns the ceiling.
        let limiter = limiter(2, FailurePolicy::FailClosed);
        let limits = limits(1, 1_000);

        // Land the burst in the first part of a second so the later
        // checks fall at stable offsets.
        while Utc::now().timestamp_subsec_millis() > 700 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(limiter.check("p", limits, 10).await.allowed);

        // The burst bucket's start has left the 2s window here, but the
        // bucket has not fully exited; the burst still counts.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(!limiter.check("p", limits, 10).await.allowed);

        // One bucket-width later it has fully exited.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(limiter.check("p", limits, 10).await.allowed);
    }
}
