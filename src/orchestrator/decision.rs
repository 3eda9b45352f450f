//! Request and decision value types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::principal::Principal;

/// An inbound request presented for admission.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub principal: Principal,
    pub query: String,
    /// Session the request belongs to; enables the per-session ceiling.
    pub session_id: Option<String>,
    /// Tags attached to the cached response on a successful backend call,
    /// for later [`invalidate_by_tag`](crate::cache::SemanticCache::invalidate_by_tag).
    pub cache_tags: Vec<String>,
}

impl AdmissionRequest {
    pub fn new(principal: Principal, query: impl Into<String>) -> Self {
        Self {
            principal,
            query: query.into(),
            session_id: None,
            cache_tags: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cache_tags(mut self, tags: Vec<String>) -> Self {
        self.cache_tags = tags;
        self
    }
}

/// Machine-readable rejection reason. The paired human message never
/// exposes internal counter keys or store diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Request-count ceiling for the rolling window was hit.
    RateLimited,
    /// Token-count ceiling for the rolling window was hit.
    TokenWindowExhausted,
    /// Too many requests already in flight for this principal.
    ConcurrencyExceeded,
    /// A budget period is exhausted; `period` is `session`, `daily`, or
    /// `monthly`.
    BudgetExhausted { period: &'static str },
    /// The request alone exceeds the per-request ceiling.
    RequestTooLarge,
    /// The counter store is unreachable and policy is fail-closed.
    StoreUnavailable,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate-limited",
            Self::TokenWindowExhausted => "token-window-exhausted",
            Self::ConcurrencyExceeded => "concurrency-exceeded",
            Self::BudgetExhausted { .. } => "budget-exhausted",
            Self::RequestTooLarge => "request-too-large",
            Self::StoreUnavailable => "service-unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::RateLimited => "Too many requests; slow down and retry.".to_string(),
            Self::TokenWindowExhausted => {
                "Token allowance for the current window is used up; retry later.".to_string()
            }
            Self::ConcurrencyExceeded => {
                "Too many requests in flight; wait for one to finish.".to_string()
            }
            Self::BudgetExhausted { period } => {
                format!("Your {period} token budget is exhausted.")
            }
            Self::RequestTooLarge => {
                "This request is larger than the maximum allowed size.".to_string()
            }
            Self::StoreUnavailable => {
                "Service is temporarily unavailable; retry shortly.".to_string()
            }
        }
    }
}

/// Why a degraded response was served instead of a full one.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradedReason {
    /// Cache answer above the emergency bar but below the normal one.
    EmergencyCacheHit { similarity: f32 },
    /// Served by the cheaper backend profile.
    CheaperProfile { model: String },
}

impl DegradedReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmergencyCacheHit { .. } => "emergency-cache-hit",
            Self::CheaperProfile { .. } => "cheaper-profile",
        }
    }
}

/// Terminal state of one request's evaluation.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Answered from the semantic cache.
    ServedCached { response: String, similarity: f32 },
    /// Answered by the backend at full fidelity.
    ServedFull { response: String },
    /// Answered at reduced cost under budget pressure.
    ServedDegraded {
        response: String,
        reason: DegradedReason,
    },
    /// Parked for later processing.
    Queued { position: usize },
    /// Denied with a structured reason.
    Rejected { reason: RejectReason },
    /// The backend failed permanently (or exhausted retries).
    Failed { message: String },
}

impl Outcome {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServedCached { .. } => "served-cached",
            Self::ServedFull { .. } => "served-full",
            Self::ServedDegraded { .. } => "served-degraded",
            Self::Queued { .. } => "queued",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    /// Reason code for audit records, when the outcome carries one.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { reason } => Some(reason.code()),
            Self::ServedDegraded { reason, .. } => Some(reason.code()),
            Self::Failed { .. } => Some("upstream-failure"),
            _ => None,
        }
    }

    /// Whether the caller got an answer (cached, full, or degraded).
    pub fn is_served(&self) -> bool {
        matches!(
            self,
            Self::ServedCached { .. } | Self::ServedFull { .. } | Self::ServedDegraded { .. }
        )
    }

    /// Response text, when one was served.
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::ServedCached { response, .. }
            | Self::ServedFull { response }
            | Self::ServedDegraded { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Per-request admission result. Ephemeral: consumed immediately by the
/// caller, also used as the handle for [`settle`](crate::AdmissionController::settle).
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub id: Uuid,
    pub outcome: Outcome,
    /// Tokens left under the tightest budget ceiling, when known.
    pub remaining_budget: Option<u64>,
    /// Hint for rate-limited callers.
    pub retry_after: Option<Duration>,
    /// When the exhausted budget period resets, on budget rejections.
    pub reset_at: Option<DateTime<Utc>>,
    pub estimated_tokens: u64,
    /// Tokens already debited from the ledger for this decision.
    pub tokens_charged: u64,
    /// Session the request carried, kept so `settle` debits the same
    /// session counter.
    pub session_id: Option<String>,
    /// Non-fatal anomalies (e.g. fail-open admissions), for the caller's
    /// logs. Never includes raw store errors.
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Tier;

    #[test]
    fn test_reject_reason_messages_are_user_safe() {
        let reason = RejectReason::BudgetExhausted { period: "daily" };
        assert_eq!(reason.code(), "budget-exhausted");
        assert!(reason.message().contains("daily"));
        // The store-unavailable message reveals nothing about the store.
        assert!(!RejectReason::StoreUnavailable.message().contains("counter"));
    }

    #[test]
    fn test_outcome_codes() {
        let outcome = Outcome::ServedDegraded {
            response: "hi".into(),
            reason: DegradedReason::CheaperProfile {
                model: "economy".into(),
            },
        };
        assert_eq!(outcome.code(), "served-degraded");
        assert_eq!(outcome.reason_code(), Some("cheaper-profile"));
        assert!(outcome.is_served());
        assert_eq!(outcome.response(), Some("hi"));
    }

    #[test]
    fn test_request_builder() {
        let req = AdmissionRequest::new(Principal::new("p", Tier::Pro), "hello")
            .with_session("s-1")
            .with_cache_tags(vec!["faq".into()]);
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert_eq!(req.cache_tags, vec!["faq".to_string()]);
    }
}
