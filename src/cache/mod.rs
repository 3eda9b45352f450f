//! Semantic response caching.
//!
//! Stores (embedding, response) pairs and answers "is there a sufficiently
//! similar prior request?" so semantically equivalent queries skip the
//! expensive backend call.

mod embedding;
mod semantic;

pub use embedding::EmbeddingProvider;
pub use semantic::{CacheHit, SemanticCache};
