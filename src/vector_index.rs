//! Approximate nearest-neighbor lookup over fingerprint embeddings
//! (spec.md §4.2). The reference implementation here is an in-memory,
//! partition-sharded, brute-force cosine-similarity index — the same
//! precedent the crewAI blackboard module sets for a vector-search trait
//! backed by an honest in-memory fallback rather than a fabricated
//! dependency on a vector database. Swapping in a real ANN backend later is
//! a new `VectorIndex` implementation, not a change to any caller.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::models::{ContentHash, Fingerprint};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent on `content_hash`.
    async fn upsert(&self, partition: &str, fingerprint: &Fingerprint) -> Result<()>;

    /// Ordered by decreasing cosine similarity.
    async fn query(
        &self,
        partition: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(Fingerprint, f64)>>;

    /// Idempotent.
    async fn remove(&self, partition: &str, content_hash: &ContentHash) -> Result<()>;
}

/// Cosine similarity assuming both vectors are already unit-norm, in which
/// case it reduces to the dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

type Shard = RwLock<HashMap<ContentHash, Fingerprint>>;

pub struct InMemoryVectorIndex {
    shards: DashMap<String, Shard>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }

    pub fn len(&self, partition: &str) -> usize {
        self.shards
            .get(partition)
            .map(|shard| shard.read().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, partition: &str) -> bool {
        self.len(partition) == 0
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, partition: &str, fingerprint: &Fingerprint) -> Result<()> {
        let shard = self.shards.entry(partition.to_string()).or_insert_with(|| RwLock::new(HashMap::new()));
        shard
            .write()
            .insert(fingerprint.content_hash, fingerprint.clone());
        Ok(())
    }

    async fn query(
        &self,
        partition: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(Fingerprint, f64)>> {
        let Some(shard) = self.shards.get(partition) else {
            return Ok(Vec::new());
        };

        let guard = shard.read();
        let mut scored: Vec<(Fingerprint, f64)> = guard
            .values()
            .map(|fp| (fp.clone(), cosine_similarity(embedding, &fp.embedding)))
            .collect();
        drop(guard);

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn remove(&self, partition: &str, content_hash: &ContentHash) -> Result<()> {
        if let Some(shard) = self.shards.get(partition) {
            shard.write().remove(content_hash);
        }
        Ok(())
    }
}
