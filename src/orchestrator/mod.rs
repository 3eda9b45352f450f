//! Admission orchestration.
//!
//! Sequences cache, limiter, ledger, and backend into one per-request
//! decision:
//!
//! ```text
//! START -> CACHE_CHECK -> hit  -> SERVED_CACHED
//!                      -> miss -> RATE_CHECK -> deny -> REJECTED
//!                                            -> pass -> BUDGET_CHECK
//! BUDGET_CHECK -> deny -> DEGRADE_CHECK -> option    -> SERVED_DEGRADED / QUEUED
//!                                       -> no option -> REJECTED
//!              -> pass -> BACKEND_CALL -> ok   -> CACHE_STORE -> SERVED_FULL
//!                                      -> fail -> FAILED
//! ```
//!
//! The cache lookup is deliberately not transactional with the rate and
//! budget checks: two near-duplicate requests may both miss and both reach
//! the backend. That is a bounded inefficiency, not a correctness issue.

mod decision;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use decision::{AdmissionDecision, AdmissionRequest, DegradedReason, Outcome, RejectReason};

use crate::backend::{BackendCaller, BackendResponse, Backoff, ModelProfile};
use crate::budget::{
    BudgetDenyReason, BudgetLedger, BudgetResult, DeductOutcome, UsageSnapshot, crossed_thresholds,
};
use crate::cache::{EmbeddingProvider, SemanticCache};
use crate::config::{AdmissionConfig, BudgetPolicy};
use crate::error::{AdmissionError, BackendError};
use crate::limiter::{SlidingWindowLimiter, SlotGuard, estimate_tokens};
use crate::principal::Principal;
use crate::queue::{QueuedRequest, RequestQueue};
use crate::sinks::{
    AlertSink, AuditRecord, AuditSink, BudgetAlert, TracingAlertSink, TracingAuditSink,
};
use crate::store::{CounterStore, FailurePolicy};

/// The façade in front of the backend model: every inbound request goes
/// through [`admit`](AdmissionController::admit).
pub struct AdmissionController {
    config: AdmissionConfig,
    limiter: SlidingWindowLimiter,
    ledger: BudgetLedger,
    cache: SemanticCache,
    queue: RequestQueue,
    backend: Arc<dyn BackendCaller>,
    backoff: Backoff,
    audit: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertSink>,
}

impl AdmissionController {
    /// Build the controller. Configuration problems are fatal here, never
    /// per-request.
    pub fn new(
        config: AdmissionConfig,
        store: Arc<dyn CounterStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn BackendCaller>,
    ) -> Result<Self, AdmissionError> {
        config.validate()?;

        let limiter = SlidingWindowLimiter::new(
            Arc::clone(&store),
            Duration::from_secs(config.window_seconds),
            config.failure_policy,
            config.store_timeout(),
        );
        let ledger = BudgetLedger::new(
            Arc::clone(&store),
            config.failure_policy,
            config.store_timeout(),
            config.session_ttl(),
        );
        let cache = SemanticCache::new(
            embedder,
            config.cache_capacity,
            config.cache_ttl(),
            config.similarity_threshold,
            config.embed_timeout(),
        );
        let queue = RequestQueue::new(config.queue_capacity);

        Ok(Self {
            config,
            limiter,
            ledger,
            cache,
            queue,
            backend,
            backoff: Backoff::default(),
            audit: Arc::new(TracingAuditSink),
            alerts: Arc::new(TracingAlertSink),
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The semantic cache, for tag invalidation by the owning service.
    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    /// The deferred-request queue, for callers that drain and re-admit.
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Current per-period usage for a principal.
    pub async fn usage(
        &self,
        principal: &Principal,
        session_id: Option<&str>,
    ) -> Result<UsageSnapshot, AdmissionError> {
        let policy = self.config.policy_for(principal.tier)?;
        Ok(self
            .ledger
            .get_usage(&principal.id, session_id, policy)
            .await?)
    }

    /// Evaluate one request end to end and return the decision.
    ///
    /// Capacity and upstream failures surface inside the decision; this
    /// method itself never fails.
    pub async fn admit(&self, request: AdmissionRequest) -> AdmissionDecision {
        let decision = self.evaluate(&request).await;
        self.audit.record(&AuditRecord {
            decision_id: decision.id,
            principal_id: request.principal.id.clone(),
            tier: request.principal.tier,
            outcome: decision.outcome.code(),
            reason: decision.outcome.reason_code(),
            estimated_tokens: decision.estimated_tokens,
            tokens_charged: decision.tokens_charged,
            timestamp: Utc::now(),
        });
        decision
    }

    /// Reconcile estimated versus actual usage after the caller learns the
    /// true token count (e.g. from a streamed response). Only the positive
    /// delta is debited; the admission decision itself is final.
    pub async fn settle(
        &self,
        principal: &Principal,
        decision: &AdmissionDecision,
        actual_tokens: u64,
    ) {
        let delta = actual_tokens.saturating_sub(decision.tokens_charged);
        if delta == 0 {
            return;
        }
        let Ok(policy) = self.config.policy_for(principal.tier) else {
            return;
        };
        let policy = *policy;
        match self
            .ledger
            .deduct(&principal.id, decision.session_id.as_deref(), delta)
            .await
        {
            Ok(outcome) => self.emit_alerts(&principal.id, &outcome, &policy),
            Err(e) => warn!(principal_id = %principal.id, "settle failed to deduct: {e}"),
        }
    }

    async fn evaluate(&self, request: &AdmissionRequest) -> AdmissionDecision {
        let id = Uuid::new_v4();
        let estimated = estimate_tokens(&request.query, self.config.expected_output_tokens);
        let mut warnings: Vec<String> = Vec::new();

        let policy = match self.config.policy_for(request.principal.tier) {
            Ok(policy) => *policy,
            Err(e) => {
                // Unreachable after validation, but a missing policy must
                // not panic the request path.
                warn!("policy lookup failed: {e}");
                return self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::Failed {
                        message: "no budget policy configured for this tier".to_string(),
                    },
                    warnings,
                );
            }
        };

        // CACHE_CHECK: cheapest path first.
        match self.cache.lookup(&request.query).await {
            Ok(Some(hit)) => {
                debug!(principal_id = %request.principal.id, similarity = hit.similarity, "served from cache");
                return self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::ServedCached {
                        response: hit.response,
                        similarity: hit.similarity,
                    },
                    warnings,
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!("cache lookup degraded to miss: {e}");
                warnings.push("semantic cache unavailable for this request".to_string());
            }
        }

        // A request that could never fit, regardless of current usage, is
        // rejected before it consumes any window capacity.
        if exceeds_absolute_ceiling(estimated, &policy, request.session_id.is_some()) {
            let budget = self
                .ledger
                .check_budget(
                    &request.principal.id,
                    request.session_id.as_deref(),
                    estimated,
                    &policy,
                )
                .await;
            return self.reject_from_budget(id, request, estimated, &budget, warnings);
        }

        // RATE_CHECK.
        let limits = self.config.rate_for(request.principal.tier);
        let rate = self
            .limiter
            .check(&request.principal.id, limits, estimated)
            .await;
        if rate.degraded {
            warnings.push("rate check failed open: counter store unavailable".to_string());
        }
        if !rate.allowed {
            let reason = match rate.reason {
                Some(crate::limiter::RateDenyReason::RequestCeiling) => RejectReason::RateLimited,
                Some(crate::limiter::RateDenyReason::TokenCeiling) => {
                    RejectReason::TokenWindowExhausted
                }
                _ => RejectReason::StoreUnavailable,
            };
            let mut decision =
                self.decide(id, request, estimated, Outcome::Rejected { reason }, warnings);
            decision.retry_after = rate.retry_after;
            return decision;
        }

        let slot = match self
            .limiter
            .acquire_slot(&request.principal.id, policy.max_concurrent)
            .await
        {
            Ok(Some(slot)) => Some(slot),
            Ok(None) => {
                let mut decision = self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::Rejected {
                        reason: RejectReason::ConcurrencyExceeded,
                    },
                    warnings,
                );
                decision.retry_after = Some(Duration::from_secs(1));
                return decision;
            }
            Err(e) => {
                warn!("slot acquisition hit store failure: {e}");
                match self.config.failure_policy {
                    FailurePolicy::FailOpen => {
                        warnings
                            .push("concurrency check failed open: counter store unavailable".to_string());
                        None
                    }
                    FailurePolicy::FailClosed => {
                        return self.decide(
                            id,
                            request,
                            estimated,
                            Outcome::Rejected {
                                reason: RejectReason::StoreUnavailable,
                            },
                            warnings,
                        );
                    }
                }
            }
        };

        // BUDGET_CHECK: read-only; denial mutates nothing.
        let budget = self
            .ledger
            .check_budget(
                &request.principal.id,
                request.session_id.as_deref(),
                estimated,
                &policy,
            )
            .await;
        if budget.degraded {
            warnings.push("budget check failed open: counter store unavailable".to_string());
        }
        if !budget.allowed {
            if budget.reason == Some(BudgetDenyReason::StoreUnavailable) {
                release(slot).await;
                return self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::Rejected {
                        reason: RejectReason::StoreUnavailable,
                    },
                    warnings,
                );
            }
            return self
                .degrade(id, request, estimated, &policy, &budget, slot, warnings)
                .await;
        }

        // BACKEND_CALL.
        let result = self
            .call_backend(&request.query, &self.config.default_profile)
            .await;
        release(slot).await;
        match result {
            Ok(response) => {
                self.write_back(request, &response, &mut warnings).await;
                let (charged, remaining) = self
                    .deduct_and_alert(request, &policy, response.actual_tokens_used)
                    .await;
                let mut decision = self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::ServedFull {
                        response: response.content,
                    },
                    warnings,
                );
                decision.tokens_charged = charged;
                decision.remaining_budget = remaining.or(Some(budget.remaining));
                decision
            }
            Err(e) => {
                warn!(principal_id = %request.principal.id, "backend call failed: {e}");
                self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::Failed {
                        message: "the backend model could not complete the request".to_string(),
                    },
                    warnings,
                )
            }
        }
    }

    /// Degradation ladder, tried in order when the budget check denies but
    /// the request is otherwise admissible: an emergency-bar cache answer
    /// is free, a cheaper profile spends within the remaining allowance,
    /// queuing defers, and only then comes a hard reject.
    async fn degrade(
        &self,
        id: Uuid,
        request: &AdmissionRequest,
        estimated: u64,
        policy: &BudgetPolicy,
        budget: &BudgetResult,
        slot: Option<SlotGuard>,
        mut warnings: Vec<String>,
    ) -> AdmissionDecision {
        if budget.remaining > 0 {
            match self
                .cache
                .lookup_with_threshold(&request.query, self.config.emergency_threshold)
                .await
            {
                Ok(Some(hit)) => {
                    release(slot).await;
                    debug!(similarity = hit.similarity, "degraded: emergency cache hit");
                    let mut decision = self.decide(
                        id,
                        request,
                        estimated,
                        Outcome::ServedDegraded {
                            response: hit.response,
                            reason: DegradedReason::EmergencyCacheHit {
                                similarity: hit.similarity,
                            },
                        },
                        warnings,
                    );
                    decision.remaining_budget = Some(budget.remaining);
                    decision.reset_at = budget.reset_at;
                    return decision;
                }
                Ok(None) => {}
                Err(e) => warn!("emergency cache lookup failed: {e}"),
            }

            if let Some(profile) = self.config.degraded_profile.clone() {
                let degraded_estimate = estimate_tokens(&request.query, profile.max_output_tokens);
                if degraded_estimate <= budget.remaining {
                    match self.call_backend(&request.query, &profile).await {
                        Ok(response) => {
                            release(slot).await;
                            self.write_back(request, &response, &mut warnings).await;
                            let (charged, remaining) = self
                                .deduct_and_alert(request, policy, response.actual_tokens_used)
                                .await;
                            let mut decision = self.decide(
                                id,
                                request,
                                estimated,
                                Outcome::ServedDegraded {
                                    response: response.content,
                                    reason: DegradedReason::CheaperProfile {
                                        model: profile.model,
                                    },
                                },
                                warnings,
                            );
                            decision.tokens_charged = charged;
                            decision.remaining_budget = remaining.or(Some(budget.remaining));
                            return decision;
                        }
                        Err(e) => {
                            warn!("degraded backend call failed, falling through: {e}");
                        }
                    }
                }
            }
        }

        release(slot).await;

        if self.queue.is_enabled() {
            let queued = QueuedRequest::new(request.principal.id.clone(), request.query.clone());
            if let Some(position) = self.queue.enqueue(queued).await {
                let mut decision = self.decide(
                    id,
                    request,
                    estimated,
                    Outcome::Queued { position },
                    warnings,
                );
                decision.remaining_budget = Some(budget.remaining);
                decision.reset_at = budget.reset_at;
                return decision;
            }
        }

        self.reject_from_budget(id, request, estimated, budget, warnings)
    }

    fn reject_from_budget(
        &self,
        id: Uuid,
        request: &AdmissionRequest,
        estimated: u64,
        budget: &BudgetResult,
        warnings: Vec<String>,
    ) -> AdmissionDecision {
        let reason = match budget.reason {
            Some(BudgetDenyReason::PerRequestCeiling) => RejectReason::RequestTooLarge,
            Some(BudgetDenyReason::SessionCeiling) => RejectReason::BudgetExhausted {
                period: "session",
            },
            Some(BudgetDenyReason::MonthlyCeiling) => RejectReason::BudgetExhausted {
                period: "monthly",
            },
            Some(BudgetDenyReason::StoreUnavailable) => RejectReason::StoreUnavailable,
            // Daily is also the fallback: check_budget denials default to
            // the daily period in ambiguous states.
            _ => RejectReason::BudgetExhausted { period: "daily" },
        };
        let mut decision = self.decide(
            id,
            request,
            estimated,
            Outcome::Rejected { reason },
            warnings,
        );
        decision.remaining_budget = Some(budget.remaining);
        decision.reset_at = budget.reset_at;
        decision
    }

    async fn call_backend(
        &self,
        prompt: &str,
        profile: &ModelProfile,
    ) -> Result<BackendResponse, BackendError> {
        let timeout = self.config.backend_timeout();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, self.backend.invoke(prompt, profile))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(timeout)),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt <= self.config.backend_retries => {
                    let delay = self.backoff.delay_for(attempt);
                    debug!(attempt, ?delay, "retrying backend after transient failure: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Store the fresh response for future approximate lookups. Failures
    /// only cost future hit rate.
    async fn write_back(
        &self,
        request: &AdmissionRequest,
        response: &BackendResponse,
        warnings: &mut Vec<String>,
    ) {
        if let Err(e) = self
            .cache
            .store(&request.query, &response.content, &request.cache_tags)
            .await
        {
            warn!("cache write-back failed: {e}");
            warnings.push("response could not be cached".to_string());
        }
    }

    /// Debit actual usage and fire any crossed alert thresholds. Returns
    /// the tokens charged and the post-deduct remaining budget.
    async fn deduct_and_alert(
        &self,
        request: &AdmissionRequest,
        policy: &BudgetPolicy,
        actual_tokens: u64,
    ) -> (u64, Option<u64>) {
        match self
            .ledger
            .deduct(
                &request.principal.id,
                request.session_id.as_deref(),
                actual_tokens,
            )
            .await
        {
            Ok(outcome) => {
                self.emit_alerts(&request.principal.id, &outcome, policy);
                let daily = policy.daily_limit.saturating_sub(outcome.daily_total);
                let monthly = policy.monthly_limit.saturating_sub(outcome.monthly_total);
                (actual_tokens, Some(daily.min(monthly)))
            }
            Err(e) => {
                // The response was already produced; losing the debit only
                // under-counts, and the store failure is already logged.
                warn!(principal_id = %request.principal.id, "deduct failed: {e}");
                (0, None)
            }
        }
    }

    fn emit_alerts(&self, principal_id: &str, outcome: &DeductOutcome, policy: &BudgetPolicy) {
        let now = Utc::now();
        for threshold in crossed_thresholds(
            outcome.daily_before(),
            outcome.daily_total,
            policy.daily_limit,
            &self.config.alert_thresholds,
        ) {
            self.alerts.notify(&BudgetAlert {
                principal_id: principal_id.to_string(),
                period: "daily",
                threshold,
                used: outcome.daily_total,
                limit: policy.daily_limit,
                timestamp: now,
            });
        }
        for threshold in crossed_thresholds(
            outcome.monthly_before(),
            outcome.monthly_total,
            policy.monthly_limit,
            &self.config.alert_thresholds,
        ) {
            self.alerts.notify(&BudgetAlert {
                principal_id: principal_id.to_string(),
                period: "monthly",
                threshold,
                used: outcome.monthly_total,
                limit: policy.monthly_limit,
                timestamp: now,
            });
        }
    }

    fn decide(
        &self,
        id: Uuid,
        request: &AdmissionRequest,
        estimated: u64,
        outcome: Outcome,
        warnings: Vec<String>,
    ) -> AdmissionDecision {
        AdmissionDecision {
            id,
            outcome,
            remaining_budget: None,
            retry_after: None,
            reset_at: None,
            estimated_tokens: estimated,
            tokens_charged: 0,
            session_id: request.session_id.clone(),
            warnings,
        }
    }
}

/// Whether the estimate exceeds a ceiling no amount of waiting within the
/// current usage state can cure (per-request) or could only be cured by a
/// period reset even from zero usage.
fn exceeds_absolute_ceiling(estimated: u64, policy: &BudgetPolicy, has_session: bool) -> bool {
    estimated > policy.per_request_limit
        || estimated > policy.daily_limit
        || estimated > policy.monthly_limit
        || (has_session && policy.per_session_limit > 0 && estimated > policy.per_session_limit)
}

async fn release(slot: Option<SlotGuard>) {
    if let Some(slot) = slot {
        slot.release().await;
    }
}
