//! The conformal counterfactual cache (spec.md §4.5): decides reuse vs.
//! rebuild with a quantified risk bound. Composes `CacheStore`,
//! `VectorIndex` and `CalibrationLog` behind one decision algorithm; never
//! talks to a `ModelTier` directly — rebuilds are the caller's job.

use std::sync::Arc;

use crate::cache_store::CacheStore;
use crate::calibration::CalibrationLog;
use crate::clock::Clock;
use crate::config::{C3Config, PipelineSettings};
use crate::error::{CoreError, Result};
use crate::models::{
    CacheEntry, Certificate, ContentHash, Decision, ExtractionRequest, Fingerprint, Label,
    TierUsed,
};
use crate::vector_index::{cosine_similarity, VectorIndex};

/// Outcome of a decision pass. `Rebuild` still carries the degraded flags
/// accumulated along the way, so the pipeline can attach them to whatever
/// certificate it eventually produces for the rebuilt result.
pub enum C3Outcome {
    Reuse {
        entry: CacheEntry,
        certificate: Certificate,
    },
    Rebuild {
        degraded: Vec<String>,
        /// The entry/certificate the engine would otherwise have reused,
        /// had `reuse_policy` not forced a rebuild (spec.md §4.5's
        /// "counterfactual"). `None` when no reuse candidate existed at
        /// all, regardless of policy.
        counterfactual: Option<(CacheEntry, Certificate)>,
    },
}

pub struct C3Engine {
    config: C3Config,
    pipeline: PipelineSettings,
    cache: Arc<dyn CacheStore>,
    index: Arc<dyn VectorIndex>,
    calibration: Arc<dyn CalibrationLog>,
    clock: Arc<dyn Clock>,
    validator_version: u32,
}

impl C3Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: C3Config,
        pipeline: PipelineSettings,
        cache: Arc<dyn CacheStore>,
        index: Arc<dyn VectorIndex>,
        calibration: Arc<dyn CalibrationLog>,
        clock: Arc<dyn Clock>,
        validator_version: u32,
    ) -> Self {
        Self {
            config,
            pipeline,
            cache,
            index,
            calibration,
            clock,
            validator_version,
        }
    }

    /// Whether `entry` has outlived its partition's TTL and must be treated
    /// as stale (spec.md §9 per-partition TTL decision, DESIGN.md). Does not
    /// mutate `revocation_bit` — staleness is re-evaluated on every read
    /// rather than requiring a background sweep.
    fn is_stale(&self, entry: &CacheEntry) -> bool {
        let ttl = self.pipeline.ttl_for(&entry.fingerprint.partition_key);
        let age = self.clock.utc_now().signed_duration_since(entry.last_verified_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        }
    }

    pub async fn decide(&self, request: &ExtractionRequest, fp: &Fingerprint) -> Result<C3Outcome> {
        let mut degraded = Vec::new();

        if request.reuse_policy == crate::models::ReusePolicy::Forbid {
            return Ok(C3Outcome::Rebuild {
                degraded,
                counterfactual: None,
            });
        }

        let candidate = self
            .find_reuse_candidate(request, fp, &mut degraded)
            .await?;

        let force_refresh = request.reuse_policy == crate::models::ReusePolicy::Refresh
            || candidate
                .as_ref()
                .map(|(entry, _)| entry.force_refresh)
                .unwrap_or(false);

        match candidate {
            Some((entry, certificate)) if force_refresh => {
                // Counterfactual: record what the engine would have
                // decided, but always force a rebuild — this is the
                // "counterfactual" in C³ (spec.md §4.5).
                if entry.force_refresh {
                    let _ = self
                        .cache
                        .clear_refresh_flag(&entry.fingerprint.content_hash)
                        .await;
                }
                Ok(C3Outcome::Rebuild {
                    degraded,
                    counterfactual: Some((entry, certificate)),
                })
            }
            Some((entry, certificate)) => Ok(C3Outcome::Reuse { entry, certificate }),
            None => Ok(C3Outcome::Rebuild {
                degraded,
                counterfactual: None,
            }),
        }
    }

    /// Finds the entry/certificate C³ would reuse for `request`, entirely
    /// independent of `reuse_policy` — exact match first, then approximate
    /// match — so `decide()` can apply the `Forbid`/`Refresh` policy
    /// uniformly on top of the same underlying decision.
    async fn find_reuse_candidate(
        &self,
        request: &ExtractionRequest,
        fp: &Fingerprint,
        degraded: &mut Vec<String>,
    ) -> Result<Option<(CacheEntry, Certificate)>> {
        if let Some(entry) = self.exact_match(&fp.content_hash, &request.required_fields).await? {
            let certificate = Certificate {
                decision: Decision::Reuse,
                neighbor_fingerprint: Some(fp.content_hash),
                similarity: 1.0,
                nonconformity: 0.0,
                risk_bound: f64::INFINITY,
                calibration_n: 0,
                tier_used: TierUsed::Cached,
                shared: false,
                degraded: degraded.clone(),
            };
            return Ok(Some((entry, certificate)));
        }

        // EmbeddingUnavailable path: caller passes an empty embedding when
        // the embedding provider was down; the approximate-match path is
        // meaningless without one, so skip straight to rebuild.
        if fp.embedding.is_empty() {
            degraded.push("embedding_unavailable".to_string());
            return Ok(None);
        }

        match self.approximate_match(request, fp, degraded).await {
            Ok(candidate) => Ok(candidate),
            Err(_) => {
                degraded.push("c3_degraded".to_string());
                Ok(None)
            }
        }
    }

    async fn exact_match(
        &self,
        content_hash: &ContentHash,
        required_fields: &[String],
    ) -> Result<Option<CacheEntry>> {
        let entry = match self.cache.get(content_hash).await {
            Ok(entry) => entry,
            Err(_) => return Ok(None),
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.revocation_bit || self.is_stale(&entry) {
            return Ok(None);
        }
        if entry.validator_version != self.validator_version {
            return Ok(None);
        }
        if !entry.covers(required_fields) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn approximate_match(
        &self,
        request: &ExtractionRequest,
        fp: &Fingerprint,
        degraded: &mut Vec<String>,
    ) -> Result<Option<(CacheEntry, Certificate)>> {
        let neighbors = self
            .index
            .query(&fp.partition_key, &fp.embedding, self.config.k_neighbors)
            .await?;

        let tau = self
            .calibration
            .quantile(
                &fp.partition_key,
                self.config.delta,
                self.config.calibration_n_min,
            )
            .await?;

        let n = self
            .calibration
            .window_size(&fp.partition_key)
            .await
            .unwrap_or(0);

        let mut best: Option<(CacheEntry, f64, f64)> = None;

        for (neighbor_fp, similarity) in neighbors {
            if similarity < self.config.similarity_floor {
                continue;
            }
            let Ok(Some(entry)) = self.cache.get(&neighbor_fp.content_hash).await else {
                // found in index but missing in cache: benign miss, skip.
                continue;
            };
            if entry.revocation_bit || self.is_stale(&entry) {
                continue;
            }
            if entry.validator_version != self.validator_version {
                continue;
            }
            if !entry.covers(&request.required_fields) {
                continue;
            }

            let edit_ratio = edit_distance_ratio(&request.canonical_text, &entry.canonical_text);
            let nonconformity = 1.0 - similarity + self.config.lambda_edit * edit_ratio;

            if nonconformity > tau {
                continue;
            }

            match &best {
                Some((_, best_a, _)) if nonconformity >= *best_a => {}
                _ => best = Some((entry, nonconformity, similarity)),
            }
        }

        let Some((entry, nonconformity, similarity)) = best else {
            return Ok(None);
        };

        let certificate = Certificate {
            decision: Decision::Reuse,
            neighbor_fingerprint: Some(entry.fingerprint.content_hash),
            similarity,
            nonconformity,
            risk_bound: tau,
            calibration_n: n,
            tier_used: TierUsed::Cached,
            shared: false,
            degraded: degraded.clone(),
        };
        Ok(Some((entry, certificate)))
    }

    pub async fn record_accept(&self, partition: &str) -> Result<()> {
        self.calibration
            .append(
                partition,
                crate::models::CalibrationSample {
                    nonconformity_score: 0.0,
                    label: Label::Accepted,
                    partition_key: partition.to_string(),
                    timestamp: self.clock.utc_now(),
                },
            )
            .await
    }

    pub async fn record_reject(&self, partition: &str) -> Result<()> {
        self.calibration
            .append(
                partition,
                crate::models::CalibrationSample {
                    nonconformity_score: 1.0,
                    label: Label::Rejected,
                    partition_key: partition.to_string(),
                    timestamp: self.clock.utc_now(),
                },
            )
            .await
    }

    pub async fn record_refresh_sample(
        &self,
        partition: &str,
        observed_nonconformity: f64,
        within_tolerance: bool,
    ) -> Result<()> {
        self.calibration
            .append(
                partition,
                crate::models::CalibrationSample {
                    nonconformity_score: observed_nonconformity,
                    label: if within_tolerance {
                        Label::Accepted
                    } else {
                        Label::Rejected
                    },
                    partition_key: partition.to_string(),
                    timestamp: self.clock.utc_now(),
                },
            )
            .await
    }
}

/// Bounded, monotone text-distance proxy satisfying `0 <= proxy <= 1` with
/// `proxy == 0` iff the inputs are identical: normalized Levenshtein
/// distance over characters.
pub fn edit_distance_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 0.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    (prev[b.len()] as f64 / max_len as f64).clamp(0.0, 1.0)
}
