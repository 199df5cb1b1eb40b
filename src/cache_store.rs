//! Durable key-value store from `content_hash → CacheEntry`, scoped by
//! `partition_key` (spec.md §4.3). Reference implementation grounded on the
//! crewAI blackboard module's content-addressed `DashMap` store with a
//! revocation/tombstone bit and capacity-bounded compaction, adapted here to
//! LRU-by-`last_verified_at` eviction with revoked entries preferred.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::{CacheEntry, ContentHash};
use crate::vector_index::VectorIndex;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, content_hash: &ContentHash) -> Result<Option<CacheEntry>>;

    /// Must be called only after the matching `VectorIndex::upsert` has
    /// completed (the two-phase write protocol lives in the C³Engine, not
    /// here — see spec.md §5).
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Sets `revocation_bit`; does not remove from the index.
    async fn mark_revoked(&self, content_hash: &ContentHash) -> Result<()>;

    /// Sets `force_refresh`, so the next matching `process()` call is
    /// forced through rebuild with a counterfactual calibration sample
    /// (spec.md §4.5, §6 `ExtractionPipeline.refresh`). No-op if the entry
    /// does not exist.
    async fn mark_for_refresh(&self, content_hash: &ContentHash) -> Result<()>;

    /// Clears `force_refresh` once it has been honored by a `decide()` call.
    async fn clear_refresh_flag(&self, content_hash: &ContentHash) -> Result<()>;

    /// Physically removes the entry and also removes it from the vector
    /// index it was registered against.
    async fn evict(&self, content_hash: &ContentHash) -> Result<()>;
}

/// In-memory reference implementation. Capacity is enforced per partition;
/// on overflow, a revoked entry is evicted if one exists, otherwise the
/// least-recently-verified entry.
pub struct InMemoryCacheStore {
    entries: DashMap<ContentHash, CacheEntry>,
    order: Mutex<HashMap<String, VecDeque<ContentHash>>>,
    capacity_per_partition: usize,
    vector_index: Arc<dyn VectorIndex>,
}

impl InMemoryCacheStore {
    pub fn new(capacity_per_partition: usize, vector_index: Arc<dyn VectorIndex>) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(HashMap::new()),
            capacity_per_partition,
            vector_index,
        }
    }

    fn touch(&self, partition: &str, hash: ContentHash) {
        let mut order = self.order.lock();
        let deque = order.entry(partition.to_string()).or_default();
        deque.retain(|h| *h != hash);
        deque.push_back(hash);
    }

    fn untrack(&self, partition: &str, hash: &ContentHash) {
        let mut order = self.order.lock();
        if let Some(deque) = order.get_mut(partition) {
            deque.retain(|h| h != hash);
        }
    }

    fn eviction_candidate(&self, partition: &str) -> Option<ContentHash> {
        let order = self.order.lock();
        let deque = order.get(partition)?;
        deque
            .iter()
            .find(|h| {
                self.entries
                    .get(*h)
                    .map(|e| e.revocation_bit)
                    .unwrap_or(false)
            })
            .or_else(|| deque.front())
            .copied()
    }

    async fn enforce_capacity(&self, partition: &str) -> Result<()> {
        loop {
            let over_capacity = {
                let order = self.order.lock();
                order.get(partition).map(|d| d.len()).unwrap_or(0) > self.capacity_per_partition
            };
            if !over_capacity {
                return Ok(());
            }
            match self.eviction_candidate(partition) {
                Some(hash) => self.evict(&hash).await?,
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, content_hash: &ContentHash) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(content_hash).map(|e| e.clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let partition = entry.fingerprint.partition_key.clone();
        let hash = entry.fingerprint.content_hash;
        self.entries.insert(hash, entry);
        self.touch(&partition, hash);
        self.enforce_capacity(&partition).await
    }

    async fn mark_revoked(&self, content_hash: &ContentHash) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(content_hash) {
            entry.revocation_bit = true;
        }
        Ok(())
    }

    async fn mark_for_refresh(&self, content_hash: &ContentHash) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(content_hash) {
            entry.force_refresh = true;
        }
        Ok(())
    }

    async fn clear_refresh_flag(&self, content_hash: &ContentHash) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(content_hash) {
            entry.force_refresh = false;
        }
        Ok(())
    }

    async fn evict(&self, content_hash: &ContentHash) -> Result<()> {
        if let Some((_, entry)) = self.entries.remove(content_hash) {
            let _ = self
                .vector_index
                .remove(&entry.fingerprint.partition_key, content_hash)
                .await;
            self.untrack(&entry.fingerprint.partition_key, content_hash);
        }
        Ok(())
    }
}
