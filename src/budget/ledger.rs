//! Hierarchical spend ledger over the counter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::period::{day_key_part, month_key_part, next_daily_reset, next_monthly_reset};
use crate::config::BudgetPolicy;
use crate::error::StoreError;
use crate::store::{CounterStore, FailurePolicy};

/// Keep period counters this long past their reset so late deducts from
/// in-flight requests still land somewhere instead of resurrecting the key.
const PERIOD_GRACE: Duration = Duration::from_secs(3600);

/// Which ceiling denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDenyReason {
    PerRequestCeiling,
    SessionCeiling,
    DailyCeiling,
    MonthlyCeiling,
    /// The counter store was unreachable and policy is fail-closed.
    StoreUnavailable,
}

/// Result of a budget check.
#[derive(Debug, Clone)]
pub struct BudgetResult {
    pub allowed: bool,
    /// Tokens left under the failing ceiling (on denial) or the tightest
    /// period ceiling after this request (on admission).
    pub remaining: u64,
    /// The ceiling the result refers to.
    pub limit: u64,
    /// When the failing period resets; `None` for non-period ceilings.
    pub reset_at: Option<DateTime<Utc>>,
    pub reason: Option<BudgetDenyReason>,
    /// True when the store failed and fail-open policy admitted anyway.
    pub degraded: bool,
}

/// Point-in-time usage per period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    /// Present only when the request carries a session id and the tier has
    /// a session ceiling.
    pub session_used: Option<u64>,
    pub session_limit: Option<u64>,
}

impl UsageSnapshot {
    pub fn daily_utilization(&self) -> f64 {
        utilization(self.daily_used, self.daily_limit)
    }

    pub fn monthly_utilization(&self) -> f64 {
        utilization(self.monthly_used, self.monthly_limit)
    }
}

fn utilization(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64
}

/// Totals after a deduct, with the pre-deduct values derivable, so the
/// caller can detect alert-threshold crossings without extra reads.
#[derive(Debug, Clone, Copy)]
pub struct DeductOutcome {
    pub tokens: u64,
    pub daily_total: u64,
    pub monthly_total: u64,
}

impl DeductOutcome {
    pub fn daily_before(&self) -> u64 {
        self.daily_total.saturating_sub(self.tokens)
    }

    pub fn monthly_before(&self) -> u64 {
        self.monthly_total.saturating_sub(self.tokens)
    }
}

/// Alert thresholds crossed by moving from `before` to `after` tokens used
/// out of `limit`. Crossing is exclusive below, inclusive above.
pub fn crossed_thresholds(before: u64, after: u64, limit: u64, thresholds: &[f64]) -> Vec<f64> {
    if limit == 0 {
        return Vec::new();
    }
    let before = before as f64 / limit as f64;
    let after = after as f64 / limit as f64;
    thresholds
        .iter()
        .copied()
        .filter(|t| before < *t && after >= *t)
        .collect()
}

/// Token spend ledger enforcing per-request, session, daily, and monthly
/// ceilings per principal.
pub struct BudgetLedger {
    store: Arc<dyn CounterStore>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    session_ttl: Duration,
}

impl BudgetLedger {
    pub fn new(
        store: Arc<dyn CounterStore>,
        failure_policy: FailurePolicy,
        store_timeout: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            failure_policy,
            store_timeout,
            session_ttl,
        }
    }

    fn day_key(principal_id: &str, now: DateTime<Utc>) -> String {
        format!("budget:{principal_id}:day:{}", day_key_part(now))
    }

    fn month_key(principal_id: &str, now: DateTime<Utc>) -> String {
        format!("budget:{principal_id}:month:{}", month_key_part(now))
    }

    fn session_key(principal_id: &str, session_id: &str) -> String {
        format!("budget:{principal_id}:session:{session_id}")
    }

    fn day_ttl(now: DateTime<Utc>) -> Duration {
        let until = (next_daily_reset(now) - now).to_std().unwrap_or_default();
        until + PERIOD_GRACE
    }

    fn month_ttl(now: DateTime<Utc>) -> Duration {
        let until = (next_monthly_reset(now) - now).to_std().unwrap_or_default();
        until + PERIOD_GRACE
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

    fn on_store_failure(&self, err: &StoreError, limit: u64) -> BudgetResult {
        warn!(policy = ?self.failure_policy, "budget check hit store failure: {err}");
        match self.failure_policy {
            FailurePolicy::FailOpen => BudgetResult {
                allowed: true,
                remaining: 0,
                limit,
                reset_at: None,
                reason: Some(BudgetDenyReason::StoreUnavailable),
                degraded: true,
            },
            FailurePolicy::FailClosed => BudgetResult {
                allowed: false,
                remaining: 0,
                limit,
                reset_at: None,
                reason: Some(BudgetDenyReason::StoreUnavailable),
                degraded: false,
            },
        }
    }

    /// Check every ceiling from narrowest to widest, short-circuiting on
    /// the first failure so the caller gets the most actionable reason.
    ///
    /// Read-only: a denied request mutates no counter.
    pub async fn check_budget(
        &self,
        principal_id: &str,
        session_id: Option<&str>,
        estimated_tokens: u64,
        policy: &BudgetPolicy,
    ) -> BudgetResult {
        // Per-request ceiling needs no store read.
        if estimated_tokens > policy.per_request_limit {
            return BudgetResult {
                allowed: false,
                remaining: policy.per_request_limit,
                limit: policy.per_request_limit,
                reset_at: None,
                reason: Some(BudgetDenyReason::PerRequestCeiling),
                degraded: false,
            };
        }

        match self
            .try_check(principal_id, session_id, estimated_tokens, policy)
            .await
        {
            Ok(result) => result,
            Err(err) => self.on_store_failure(&err, policy.daily_limit),
        }
    }

    async fn try_check(
        &self,
        principal_id: &str,
        session_id: Option<&str>,
        estimated_tokens: u64,
        policy: &BudgetPolicy,
    ) -> Result<BudgetResult, StoreError> {
        let now = Utc::now();

        if policy.per_session_limit > 0 {
            if let Some(sid) = session_id {
                let used = self
                    .store_op(self.store.get(&Self::session_key(principal_id, sid)))
                    .await?;
                if used + estimated_tokens > policy.per_session_limit {
                    debug!(principal_id, sid, used, "budget denied: session ceiling");
                    return Ok(deny(
                        BudgetDenyReason::SessionCeiling,
                        policy.per_session_limit.saturating_sub(used),
                        policy.per_session_limit,
                        None,
                    ));
                }
            }
        }

        let daily_used = self
            .store_op(self.store.get(&Self::day_key(principal_id, now)))
            .await?;
        if daily_used + estimated_tokens > policy.daily_limit {
            debug!(principal_id, daily_used, "budget denied: daily ceiling");
            return Ok(deny(
                BudgetDenyReason::DailyCeiling,
                policy.daily_limit.saturating_sub(daily_used),
                policy.daily_limit,
                Some(next_daily_reset(now)),
            ));
        }

        let monthly_used = self
            .store_op(self.store.get(&Self::month_key(principal_id, now)))
            .await?;
        if monthly_used + estimated_tokens > policy.monthly_limit {
            debug!(principal_id, monthly_used, "budget denied: monthly ceiling");
            return Ok(deny(
                BudgetDenyReason::MonthlyCeiling,
                policy.monthly_limit.saturating_sub(monthly_used),
                policy.monthly_limit,
                Some(next_monthly_reset(now)),
            ));
        }

        let daily_remaining = policy.daily_limit - daily_used - estimated_tokens;
        let monthly_remaining = policy.monthly_limit - monthly_used - estimated_tokens;
        Ok(BudgetResult {
            allowed: true,
            remaining: daily_remaining.min(monthly_remaining),
            limit: policy.daily_limit,
            reset_at: Some(next_daily_reset(now)),
            reason: None,
            degraded: false,
        })
    }

    /// Debit actual consumed tokens after the backend call completed.
    ///
    /// The difference between estimate and actual only affects subsequent
    /// checks; the admission decision that already happened is final.
    pub async fn deduct(
        &self,
        principal_id: &str,
        session_id: Option<&str>,
        actual_tokens: u64,
    ) -> Result<DeductOutcome, StoreError> {
        let now = Utc::now();

        let daily_total = self
            .store_op(self.store.increment_and_get(
                &Self::day_key(principal_id, now),
                actual_tokens,
                Self::day_ttl(now),
            ))
            .await?;
        let monthly_total = self
            .store_op(self.store.increment_and_get(
                &Self::month_key(principal_id, now),
                actual_tokens,
                Self::month_ttl(now),
            ))
            .await?;
        if let Some(sid) = session_id {
            self.store_op(self.store.increment_and_get(
                &Self::session_key(principal_id, sid),
                actual_tokens,
                self.session_ttl,
            ))
            .await?;
        }

        debug!(principal_id, actual_tokens, daily_total, "budget deducted");
        Ok(DeductOutcome {
            tokens: actual_tokens,
            daily_total,
            monthly_total,
        })
    }

    /// Snapshot current usage per period. Idempotent between deducts.
    pub async fn get_usage(
        &self,
        principal_id: &str,
        session_id: Option<&str>,
        policy: &BudgetPolicy,
    ) -> Result<UsageSnapshot, StoreError> {
        let now = Utc::now();

        let daily_used = self
            .store_op(self.store.get(&Self::day_key(principal_id, now)))
            .await?;
        let monthly_used = self
            .store_op(self.store.get(&Self::month_key(principal_id, now)))
            .await?;

        let (session_used, session_limit) = match (session_id, policy.per_session_limit) {
            (Some(sid), limit) if limit > 0 => {
                let used = self
                    .store_op(self.store.get(&Self::session_key(principal_id, sid)))
                    .await?;
                (Some(used), Some(limit))
            }
            _ => (None, None),
        };

        Ok(UsageSnapshot {
            daily_used,
            daily_limit: policy.daily_limit,
            monthly_used,
            monthly_limit: policy.monthly_limit,
            session_used,
            session_limit,
        })
    }
}

fn deny(
    reason: BudgetDenyReason,
    remaining: u64,
    limit: u64,
    reset_at: Option<DateTime<Utc>>,
) -> BudgetResult {
    BudgetResult {
        allowed: false,
        remaining,
        limit,
        reset_at,
        reason: Some(reason),
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn ledger() -> BudgetLedger {
        BudgetLedger::new(
            Arc::new(MemoryCounterStore::new()),
            FailurePolicy::FailClosed,
            Duration::from_millis(100),
            Duration::from_secs(3600),
        )
    }

    fn policy() -> BudgetPolicy {
        BudgetPolicy {
            per_request_limit: 5_000,
            per_session_limit: 8_000,
            daily_limit: 10_000,
            monthly_limit: 50_000,
            max_concurrent: 5,
        }
    }

    #[tokio::test]
    async fn test_per_request_ceiling_checked_first() {
        let ledger = ledger();
        let result = ledger.check_budget("p", None, 5_001, &policy()).await;
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(BudgetDenyReason::PerRequestCeiling));
        assert_eq!(result.limit, 5_000);
        assert!(result.reset_at.is_none());
    }

    #[tokio::test]
    async fn test_boundary_exactly_at_per_request_limit() {
        let ledger = ledger();
        // Exactly at the ceiling is admitted; one token over is rejected.
        assert!(ledger.check_budget("p", None, 5_000, &policy()).await.allowed);
        assert!(!ledger.check_budget("p", None, 5_001, &policy()).await.allowed);
    }

    #[tokio::test]
    async fn test_daily_ceiling_after_deducts() {
        let ledger = ledger();
        let policy = policy();

        ledger.deduct("p", None, 4_900).await.unwrap();
        ledger.deduct("p", None, 4_900).await.unwrap();

        let result = ledger.check_budget("p", None, 500, &policy).await;
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(BudgetDenyReason::DailyCeiling));
        assert_eq!(result.remaining, 200);
        assert!(result.reset_at.is_some());
    }

    #[tokio::test]
    async fn test_check_is_read_only() {
        let ledger = ledger();
        let policy = policy();

        let denied = ledger.check_budget("p", None, 5_001, &policy).await;
        assert!(!denied.allowed);

        let usage = ledger.get_usage("p", None, &policy).await.unwrap();
        assert_eq!(usage.daily_used, 0);
        assert_eq!(usage.monthly_used, 0);
    }

    #[tokio::test]
    async fn test_session_ceiling() {
        let ledger = ledger();
        let policy = policy();

        ledger.deduct("p", Some("s1"), 7_900).await.unwrap();

        let result = ledger.check_budget("p", Some("s1"), 200, &policy).await;
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(BudgetDenyReason::SessionCeiling));

        // Other sessions and session-less requests are unaffected by the
        // session ceiling (daily usage still applies).
        assert!(ledger.check_budget("p", Some("s2"), 200, &policy).await.allowed);
        assert!(ledger.check_budget("p", None, 200, &policy).await.allowed);
    }

    #[tokio::test]
    async fn test_get_usage_idempotent() {
        let ledger = ledger();
        let policy = policy();
        ledger.deduct("p", None, 1_234).await.unwrap();

        let a = ledger.get_usage("p", None, &policy).await.unwrap();
        let b = ledger.get_usage("p", None, &policy).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.daily_used, 1_234);
        assert_eq!(a.monthly_used, 1_234);
    }

    #[tokio::test]
    async fn test_deduct_outcome_reports_before_and_after() {
        let ledger = ledger();
        ledger.deduct("p", None, 1_000).await.unwrap();
        let outcome = ledger.deduct("p", None, 500).await.unwrap();

        assert_eq!(outcome.daily_total, 1_500);
        assert_eq!(outcome.daily_before(), 1_000);
        assert_eq!(outcome.monthly_before(), 1_000);
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_store_unavailable() {
        struct DownStore;
        #[async_trait::async_trait]
        impl CounterStore for DownStore {
            async fn increment_and_get(
                &self,
                _key: &str,
                _delta: u64,
                _ttl: Duration,
            ) -> Result<u64, StoreError> {
                Err(StoreError::Unreachable("down".into()))
            }
            async fn get(&self, _key: &str) -> Result<u64, StoreError> {
                Err(StoreError::Unreachable("down".into()))
            }
            async fn decrement(&self, _key: &str, _delta: u64) -> Result<(), StoreError> {
                Err(StoreError::Unreachable("down".into()))
            }
        }

        let ledger = BudgetLedger::new(
            Arc::new(DownStore),
            FailurePolicy::FailClosed,
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        let result = ledger.check_budget("p", None, 100, &policy()).await;
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(BudgetDenyReason::StoreUnavailable));
    }

    #[test]
    fn test_crossed_thresholds() {
        let thresholds = [0.5, 0.8, 1.0];
        assert_eq!(crossed_thresholds(0, 4_000, 10_000, &thresholds), Vec::<f64>::new());
        assert_eq!(crossed_thresholds(4_000, 5_000, 10_000, &thresholds), vec![0.5]);
        // A single large deduct crosses every threshold still ahead of it.
        assert_eq!(
            crossed_thresholds(4_000, 10_000, 10_000, &thresholds),
            vec![0.5, 0.8, 1.0]
        );
        // Already past a threshold: no re-fire.
        assert_eq!(crossed_thresholds(5_000, 6_000, 10_000, &thresholds), Vec::<f64>::new());
    }
}
