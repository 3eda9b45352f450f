//! Layer configuration.
//!
//! An [`AdmissionConfig`] is built once, validated, and handed to the
//! orchestrator at construction time. There is no process-wide mutable
//! policy state; tests inject fixture configs directly.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ModelProfile;
use crate::error::AdmissionError;
use crate::principal::Tier;
use crate::store::FailurePolicy;

/// Per-tier spend ceilings, all in token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Largest single request (estimated tokens) this tier may make.
    pub per_request_limit: u64,
    /// Ceiling per session; `0` disables the session ceiling.
    #[serde(default)]
    pub per_session_limit: u64,
    /// Ceiling per UTC calendar day.
    pub daily_limit: u64,
    /// Ceiling per calendar month.
    pub monthly_limit: u64,
    /// Simultaneous in-flight backend calls.
    pub max_concurrent: u32,
}

/// Ceilings for the rolling rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests admitted per window.
    pub max_requests: u64,
    /// Estimated tokens admitted per window.
    pub max_window_tokens: u64,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_similarity_threshold() -> f32 {
    0.92
}

fn default_emergency_threshold() -> f32 {
    0.78
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    24 * 3600
}

fn default_session_ttl_secs() -> u64 {
    2 * 3600
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_embed_timeout_ms() -> u64 {
    2_000
}

fn default_backend_timeout_ms() -> u64 {
    60_000
}

fn default_backend_retries() -> u32 {
    2
}

fn default_alert_thresholds() -> Vec<f64> {
    vec![0.5, 0.8, 1.0]
}

fn default_expected_output_tokens() -> u64 {
    500
}

fn default_profile() -> ModelProfile {
    ModelProfile::new("standard", 1024)
}

fn default_degraded_profile() -> Option<ModelProfile> {
    Some(ModelProfile::new("economy", 256))
}

fn default_tiers() -> HashMap<Tier, BudgetPolicy> {
    HashMap::from([
        (
            Tier::Free,
            BudgetPolicy {
                per_request_limit: 4_000,
                per_session_limit: 0,
                daily_limit: 10_000,
                monthly_limit: 100_000,
                max_concurrent: 1,
            },
        ),
        (
            Tier::Pro,
            BudgetPolicy {
                per_request_limit: 16_000,
                per_session_limit: 0,
                daily_limit: 100_000,
                monthly_limit: 2_000_000,
                max_concurrent: 5,
            },
        ),
        (
            Tier::Business,
            BudgetPolicy {
                per_request_limit: 32_000,
                per_session_limit: 0,
                daily_limit: 500_000,
                monthly_limit: 10_000_000,
                max_concurrent: 20,
            },
        ),
        (
            Tier::Enterprise,
            BudgetPolicy {
                per_request_limit: 64_000,
                per_session_limit: 0,
                daily_limit: 2_000_000,
                monthly_limit: 50_000_000,
                max_concurrent: 100,
            },
        ),
    ])
}

fn default_rate() -> RateLimits {
    RateLimits {
        max_requests: 60,
        max_window_tokens: 200_000,
    }
}

/// Full configuration surface for the admission layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Per-tier budget policy table.
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<Tier, BudgetPolicy>,

    /// Default rate ceilings for the rolling window.
    #[serde(default = "default_rate")]
    pub rate: RateLimits,

    /// Per-tier overrides of the rate ceilings. Tiers without an override
    /// use [`AdmissionConfig::rate`].
    #[serde(default)]
    pub rate_overrides: HashMap<Tier, RateLimits>,

    /// Length of the rolling rate window, shared by the request-count and
    /// token-count ceilings.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Minimum cosine similarity for a normal cache hit (inclusive).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Lower similarity bar used only by the degradation path.
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f32,

    /// Maximum number of semantic cache entries.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Semantic cache entry lifetime.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Idle lifetime of per-session budget counters.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Behavior when the counter store is unreachable.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Deadline for a single counter store operation.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Deadline for a single embedding call.
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,

    /// Deadline for a single backend attempt.
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Transient backend failures retried before giving up.
    #[serde(default = "default_backend_retries")]
    pub backend_retries: u32,

    /// Budget utilization fractions at which alerts fire.
    #[serde(default = "default_alert_thresholds")]
    pub alert_thresholds: Vec<f64>,

    /// Output-token buffer added to input-length estimates, since true
    /// usage is unknown before the call.
    #[serde(default = "default_expected_output_tokens")]
    pub expected_output_tokens: u64,

    /// Queue capacity for the degradation path; `0` disables queuing.
    #[serde(default)]
    pub queue_capacity: usize,

    /// Profile used for normal backend calls.
    #[serde(default = "default_profile")]
    pub default_profile: ModelProfile,

    /// Cheaper profile for degraded serving; `None` disables that rung.
    #[serde(default = "default_degraded_profile")]
    pub degraded_profile: Option<ModelProfile>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            rate: default_rate(),
            rate_overrides: HashMap::new(),
            window_seconds: default_window_seconds(),
            similarity_threshold: default_similarity_threshold(),
            emergency_threshold: default_emergency_threshold(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
            embed_timeout_ms: default_embed_timeout_ms(),
            backend_timeout_ms: default_backend_timeout_ms(),
            backend_retries: default_backend_retries(),
            alert_thresholds: default_alert_thresholds(),
            expected_output_tokens: default_expected_output_tokens(),
            queue_capacity: 0,
            default_profile: default_profile(),
            degraded_profile: default_degraded_profile(),
        }
    }
}

impl AdmissionConfig {
    /// Look up the budget policy for a tier.
    ///
    /// Only fails on a policy table that skipped [`validate`](Self::validate),
    /// since validation requires every tier to be present.
    pub fn policy_for(&self, tier: Tier) -> Result<&BudgetPolicy, AdmissionError> {
        self.tiers
            .get(&tier)
            .ok_or_else(|| AdmissionError::Config(format!("no budget policy for tier {}", tier.as_str())))
    }

    /// Effective rate ceilings for a tier.
    pub fn rate_for(&self, tier: Tier) -> RateLimits {
        self.rate_overrides.get(&tier).copied().unwrap_or(self.rate)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), AdmissionError> {
        for tier in Tier::ALL {
            let policy = self
                .tiers
                .get(&tier)
                .ok_or_else(|| AdmissionError::Config(format!("missing budget policy for tier {}", tier.as_str())))?;

            if policy.per_request_limit == 0
                || policy.daily_limit == 0
                || policy.monthly_limit == 0
            {
                return Err(AdmissionError::Config(format!(
                    "tier {} has a zero spend ceiling",
                    tier.as_str()
                )));
            }
            if policy.per_request_limit > policy.daily_limit
                || policy.daily_limit > policy.monthly_limit
            {
                return Err(AdmissionError::Config(format!(
                    "tier {} ceilings are not nested (per-request <= daily <= monthly)",
                    tier.as_str()
                )));
            }
            if policy.max_concurrent == 0 {
                return Err(AdmissionError::Config(format!(
                    "tier {} allows zero concurrent requests",
                    tier.as_str()
                )));
            }
        }

        if self.window_seconds == 0 {
            return Err(AdmissionError::Config("window_seconds must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(AdmissionError::Config(
                "similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.emergency_threshold > self.similarity_threshold {
            return Err(AdmissionError::Config(
                "emergency_threshold must not exceed similarity_threshold".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(AdmissionError::Config("cache_capacity must be positive".into()));
        }
        for threshold in &self.alert_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(AdmissionError::Config(
                    "alert thresholds must be within [0, 1]".into(),
                ));
            }
        }

        Ok(())
    }
}
