//! Audit and alerting sinks.
//!
//! Both sinks are fire-and-forget observers of the request path: they must
//! return quickly and never block admission. The defaults emit structured
//! `tracing` events; deployments plug in their own delivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::principal::Tier;

/// One structured record per admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub decision_id: Uuid,
    pub principal_id: String,
    pub tier: Tier,
    /// Machine-readable outcome code, e.g. `served-cached`, `rejected`.
    pub outcome: &'static str,
    /// Machine-readable denial/degradation reason code, when applicable.
    pub reason: Option<&'static str>,
    pub estimated_tokens: u64,
    pub tokens_charged: u64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit receiver. Implementations must be best-effort and
/// bounded; a slow sink must not slow admission.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Default audit sink: one `tracing` event per decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "tollgate::audit",
            decision_id = %record.decision_id,
            principal_id = %record.principal_id,
            tier = record.tier.as_str(),
            outcome = record.outcome,
            reason = record.reason,
            estimated_tokens = record.estimated_tokens,
            tokens_charged = record.tokens_charged,
            "admission decision"
        );
    }
}

/// A budget utilization threshold crossing.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub principal_id: String,
    /// `daily` or `monthly`.
    pub period: &'static str,
    /// The configured threshold that was crossed, e.g. `0.8`.
    pub threshold: f64,
    pub used: u64,
    pub limit: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receiver for threshold-crossing events. Fire-and-forget; the ledger
/// never owns notification delivery.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &BudgetAlert);
}

/// Default alert sink: warn-level `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &BudgetAlert) {
        warn!(
            target: "tollgate::alerts",
            principal_id = %alert.principal_id,
            period = alert.period,
            threshold = alert.threshold,
            used = alert.used,
            limit = alert.limit,
            "budget threshold crossed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_record_serializes() {
        let record = AuditRecord {
            decision_id: Uuid::new_v4(),
            principal_id: "p".into(),
            tier: Tier::Free,
            outcome: "rejected",
            reason: Some("rate-limited"),
            estimated_tokens: 600,
            tokens_charged: 0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["tier"], "free");
    }
}
