//! Backend model caller seam.
//!
//! The orchestrator authorizes and performs the expensive model call
//! through [`BackendCaller`]; the actual inference client lives outside
//! this crate.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// A named backend configuration. The degraded profile typically points at
/// a cheaper model with a shorter response cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Backend-specific model identifier.
    pub model: String,
    /// Ceiling on generated output tokens for calls under this profile.
    pub max_output_tokens: u64,
}

impl ModelProfile {
    pub fn new(model: impl Into<String>, max_output_tokens: u64) -> Self {
        Self {
            model: model.into(),
            max_output_tokens,
        }
    }
}

/// Result of a successful backend call.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    /// True token consumption reported by the backend. May differ from the
    /// pre-call estimate; the ledger is debited with this value.
    pub actual_tokens_used: u64,
}

/// The expensive model behind the admission layer.
#[async_trait]
pub trait BackendCaller: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        profile: &ModelProfile,
    ) -> Result<BackendResponse, BackendError>;
}

/// Jittered exponential backoff between transient-failure retries.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2.0,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given retry attempt (first retry is attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            let offset = rand::random::<f64>() * range * 2.0 - range;
            (clamped + offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}
