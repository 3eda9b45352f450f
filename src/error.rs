//! Error types for the admission layer.

use std::time::Duration;

use thiserror::Error;

/// Errors from the counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unreachable: {0}")]
    Unreachable(String),

    /// A store operation exceeded its deadline.
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the embedding provider.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The provider could not be reached or returned a failure.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The embedding call exceeded its deadline.
    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider returned a vector of the wrong dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimensionality.
        expected: usize,
        /// Dimensionality actually returned.
        actual: usize,
    },
}

/// Errors from the backend model caller.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transient failure; safe to retry.
    #[error("backend transient failure: {0}")]
    Transient(String),

    /// Permanent failure; retrying will not help.
    #[error("backend permanent failure: {0}")]
    Permanent(String),

    /// The backend call exceeded its deadline.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Top-level error for the admission layer.
///
/// Capacity exhaustion is deliberately absent: rate and budget denials are
/// decision outcomes, not errors, so callers can branch on the decision
/// without exception ceremony.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Malformed or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Counter store failure that could not be resolved by policy.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Embedding provider failure.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Backend model failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
