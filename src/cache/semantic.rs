//! Approximate-match response cache over embedding vectors.
//!
//! Lookup embeds the query and scans for the stored entry with the highest
//! cosine similarity. Vectors are normalized once at insertion so the scan
//! is a plain dot product. The scan is linear; at the capacities this layer
//! is configured for it stays well under the cost of one backend call.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::embedding::EmbeddingProvider;
use crate::error::EmbeddingError;

struct Entry {
    /// L2-normalized embedding in the current provider's space.
    embedding: Vec<f32>,
    /// Original question text, kept for debugging and audit.
    question: String,
    response: String,
    created_at: DateTime<Utc>,
    last_hit_at: Option<DateTime<Utc>>,
    hit_count: u64,
    tags: Vec<String>,
    expires_at: Instant,
}

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: String,
    /// Canonical question text of the matched entry.
    pub question: String,
    pub similarity: f32,
    /// Hit count of the entry after this lookup.
    pub hit_count: u64,
}

/// Concurrent semantic cache with TTL, tag invalidation, and
/// lowest-hit-count eviction.
pub struct SemanticCache {
    provider: Arc<dyn EmbeddingProvider>,
    entries: DashMap<Uuid, Entry>,
    capacity: usize,
    ttl: Duration,
    threshold: f32,
    embed_timeout: Duration,
    /// Embedding space the stored vectors belong to. A provider version
    /// bump invalidates the entire cache, not individual entries.
    space_version: RwLock<String>,
}

impl SemanticCache {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        capacity: usize,
        ttl: Duration,
        threshold: f32,
        embed_timeout: Duration,
    ) -> Self {
        let space_version = RwLock::new(provider.version());
        Self {
            provider,
            entries: DashMap::new(),
            capacity,
            ttl,
            threshold,
            embed_timeout,
            space_version,
        }
    }

    /// Number of entries currently stored, including not-yet-collected
    /// expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured similarity threshold for a normal hit.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Look up the most similar cached response at the configured
    /// threshold.
    pub async fn lookup(&self, query: &str) -> Result<Option<CacheHit>, EmbeddingError> {
        self.lookup_with_threshold(query, self.threshold).await
    }

    /// Look up with an explicit similarity bar. The degradation path uses
    /// this with the emergency threshold. The bar is inclusive: a best
    /// match exactly at `min_similarity` is a hit.
    pub async fn lookup_with_threshold(
        &self,
        query: &str,
        min_similarity: f32,
    ) -> Result<Option<CacheHit>, EmbeddingError> {
        self.ensure_space_version();
        let query_vec = self.embed_normalized(query).await?;

        let now = Instant::now();
        let mut expired: Vec<Uuid> = Vec::new();
        let mut best: Option<(Uuid, f32)> = None;
        for entry in self.entries.iter() {
            if entry.expires_at <= now {
                expired.push(*entry.key());
                continue;
            }
            let similarity = dot(&query_vec, &entry.embedding);
            if best.is_none_or(|(_, s)| similarity > s) {
                best = Some((*entry.key(), similarity));
            }
        }
        for id in expired {
            self.entries.remove(&id);
        }

        let Some((id, similarity)) = best else {
            return Ok(None);
        };
        if similarity < min_similarity {
            debug!(similarity, min_similarity, "cache miss: best match below bar");
            return Ok(None);
        }

        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.hit_count += 1;
        entry.last_hit_at = Some(Utc::now());
        debug!(similarity, hits = entry.hit_count, "cache hit");
        Ok(Some(CacheHit {
            response: entry.response.clone(),
            question: entry.question.clone(),
            similarity,
            hit_count: entry.hit_count,
        }))
    }

    /// Persist a response for future approximate lookups.
    pub async fn store(
        &self,
        query: &str,
        response: &str,
        tags: &[String],
    ) -> Result<Uuid, EmbeddingError> {
        self.ensure_space_version();
        let embedding = self.embed_normalized(query).await?;

        if self.entries.len() >= self.capacity {
            self.evict_least_valuable();
        }

        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            Entry {
                embedding,
                question: query.to_string(),
                response: response.to_string(),
                created_at: Utc::now(),
                last_hit_at: None,
                hit_count: 0,
                tags: tags.to_vec(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(id)
    }

    /// Remove every entry carrying the given tag. Used when the source
    /// data a set of cached answers depended on changes.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .map(|e| *e.key())
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        if !ids.is_empty() {
            info!(tag, removed = ids.len(), "cache entries invalidated by tag");
        }
        ids.len()
    }

    /// Evict the entry with the lowest hit count, oldest first on ties.
    /// Approximates least-valuable rather than least-recently-used: a
    /// rarely-asked but expensive-to-recompute entry may still be worth
    /// keeping over a fresher zero-hit one.
    fn evict_least_valuable(&self) {
        let victim = self
            .entries
            .iter()
            .min_by(|a, b| {
                a.hit_count
                    .cmp(&b.hit_count)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|e| *e.key());
        if let Some(id) = victim {
            self.entries.remove(&id);
        }
    }

    /// Drop everything if the provider's embedding space changed since the
    /// cache was filled.
    fn ensure_space_version(&self) {
        let current = self.provider.version();
        {
            let held = self.space_version.read().unwrap_or_else(|e| e.into_inner());
            if *held == current {
                return;
            }
        }
        let mut held = self
            .space_version
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *held != current {
            info!(from = %held, to = %current, "embedding space changed; clearing cache");
            self.entries.clear();
            *held = current;
        }
    }

    async fn embed_normalized(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = match tokio::time::timeout(self.embed_timeout, self.provider.embed(text)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(EmbeddingError::Timeout(self.embed_timeout)),
        };
        let expected = self.provider.dimension();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(normalize(vector))
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity of two normalized vectors.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Test embedder with preset vectors per text; unknown texts hash to a
    /// quasi-random unit vector so they are dissimilar to everything.
    struct StaticEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        version: Mutex<String>,
    }

    impl StaticEmbedder {
        fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: vectors
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                version: Mutex::new("v1".to_string()),
            }
        }

        fn bump_version(&self) {
            *self.version.lock().unwrap() = "v2".to_string();
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StaticEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if let Some(v) = self.vectors.get(text) {
                return Ok(v.clone());
            }
            let mut v = vec![0.0f32; 4];
            let h = text.bytes().fold(7u64, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as u64)
            });
            v[(h % 4) as usize] = 1.0;
            v[((h / 4) % 4) as usize] += 0.3;
            Ok(v)
        }

        fn version(&self) -> String {
            self.version.lock().unwrap().clone()
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn cache_with(provider: Arc<StaticEmbedder>, capacity: usize, threshold: f32) -> SemanticCache {
        SemanticCache::new(
            provider,
            capacity,
            Duration::from_secs(60),
            threshold,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_exact_round_trip() {
        let provider = Arc::new(StaticEmbedder::new(&[]));
        let cache = cache_with(provider, 100, 0.92);

        cache.store("What is the return policy?", "30 days.", &[]).await.unwrap();
        let hit = cache.lookup("What is the return policy?").await.unwrap().unwrap();

        assert_eq!(hit.response, "30 days.");
        assert!((hit.similarity - 1.0).abs() < 1e-5);
        assert_eq!(hit.hit_count, 1);
    }

    #[tokio::test]
    async fn test_paraphrase_above_threshold_hits() {
        // cos(q, stored) = 0.95 by construction.
        let provider = Arc::new(StaticEmbedder::new(&[
            ("What is the return policy?", vec![1.0, 0.0, 0.0, 0.0]),
            (
                "What's your return policy?",
                vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt(), 0.0, 0.0],
            ),
        ]));
        let cache = cache_with(provider, 100, 0.92);

        cache.store("What is the return policy?", "30 days.", &[]).await.unwrap();
        let hit = cache.lookup("What's your return policy?").await.unwrap().unwrap();

        assert_eq!(hit.response, "30 days.");
        assert!((hit.similarity - 0.95).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let threshold = 0.92f32;
        let provider = Arc::new(StaticEmbedder::new(&[
            ("stored", vec![1.0, 0.0, 0.0, 0.0]),
            (
                "at-threshold",
                vec![threshold, (1.0f32 - threshold * threshold).sqrt(), 0.0, 0.0],
            ),
            (
                "below-threshold",
                vec![
                    threshold - 0.001,
                    (1.0f32 - (threshold - 0.001) * (threshold - 0.001)).sqrt(),
                    0.0,
                    0.0,
                ],
            ),
        ]));
        let cache = cache_with(provider, 100, threshold);
        cache.store("stored", "answer", &[]).await.unwrap();

        // Exactly at the bar: hit. Slightly below: miss. Float error from
        // normalization stays far smaller than the 1e-3 gap used here.
        assert!(cache.lookup("at-threshold").await.unwrap().is_some());
        assert!(cache.lookup("below-threshold").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_emergency_bar_lookup() {
        let provider = Arc::new(StaticEmbedder::new(&[
            ("stored", vec![1.0, 0.0, 0.0, 0.0]),
            ("kind-of-close", vec![0.85, (1.0f32 - 0.85 * 0.85).sqrt(), 0.0, 0.0]),
        ]));
        let cache = cache_with(provider, 100, 0.92);
        cache.store("stored", "answer", &[]).await.unwrap();

        assert!(cache.lookup("kind-of-close").await.unwrap().is_none());
        let hit = cache
            .lookup_with_threshold("kind-of-close", 0.78)
            .await
            .unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let provider = Arc::new(StaticEmbedder::new(&[]));
        let cache = cache_with(provider, 100, 0.92);

        cache
            .store("q1", "a1", &["policy-doc".to_string()])
            .await
            .unwrap();
        cache
            .store("q2", "a2", &["policy-doc".to_string(), "other".to_string()])
            .await
            .unwrap();
        cache.store("q3", "a3", &[]).await.unwrap();

        assert_eq!(cache.invalidate_by_tag("policy-doc"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("q3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_eviction_removes_lowest_hit_count() {
        let provider = Arc::new(StaticEmbedder::new(&[
            ("popular", vec![1.0, 0.0, 0.0, 0.0]),
            ("unpopular", vec![0.0, 1.0, 0.0, 0.0]),
            ("newcomer", vec![0.0, 0.0, 1.0, 0.0]),
        ]));
        let cache = cache_with(provider, 2, 0.92);

        cache.store("popular", "a", &[]).await.unwrap();
        cache.store("unpopular", "b", &[]).await.unwrap();
        cache.lookup("popular").await.unwrap().unwrap();

        // At capacity: the zero-hit entry goes.
        cache.store("newcomer", "c", &[]).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("popular").await.unwrap().is_some());
        assert!(cache.lookup("unpopular").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let provider = Arc::new(StaticEmbedder::new(&[]));
        let cache = SemanticCache::new(
            provider,
            100,
            Duration::from_millis(10),
            0.92,
            Duration::from_millis(200),
        );

        cache.store("q", "a", &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup("q").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_provider_version_bump_clears_cache() {
        let provider = Arc::new(StaticEmbedder::new(&[]));
        let cache = cache_with(Arc::clone(&provider), 100, 0.92);

        cache.store("q", "a", &[]).await.unwrap();
        assert!(cache.lookup("q").await.unwrap().is_some());

        provider.bump_version();
        assert!(cache.lookup("q").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_config_error() {
        struct WrongDim;
        #[async_trait]
        impl EmbeddingProvider for WrongDim {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
                Ok(vec![1.0, 0.0])
            }
            fn version(&self) -> String {
                "v1".to_string()
            }
            fn dimension(&self) -> usize {
                4
            }
        }

        let cache = SemanticCache::new(
            Arc::new(WrongDim),
            100,
            Duration::from_secs(60),
            0.92,
            Duration::from_millis(200),
        );
        let err = cache.store("q", "a", &[]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { expected: 4, actual: 2 }));
    }
}
