//! Embedding provider seam.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// External embedding model.
///
/// Assumed deterministic for a given provider version. The version string
/// identifies the embedding space: when it changes, previously stored
/// vectors are incomparable and the cache drops them wholesale.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Identifier of the embedding space/version.
    fn version(&self) -> String;

    /// Fixed output dimensionality for this version.
    fn dimension(&self) -> usize;
}
