//! Thin façade composing Fingerprinter, C³Engine, SingleFlight, VoIT and the
//! write-back/calibration/telemetry steps into one public operation
//! (spec.md §4.9).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::c3::{C3Engine, C3Outcome};
use crate::cache_store::CacheStore;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::{CoreError, Result};
use crate::fingerprint::Fingerprinter;
use crate::models::{
    CacheEntry, Certificate, ContentHash, Decision, ExtractionRequest, ExtractionResult, TierUsed,
};
use crate::single_flight::SingleFlight;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::validator::Validator;
use crate::vector_index::VectorIndex;
use crate::voit::VoITController;

pub struct ProcessOutcome {
    pub result: ExtractionResult,
    pub certificate: Certificate,
}

pub struct ExtractionPipeline {
    config: PipelineConfig,
    fingerprinter: Arc<Fingerprinter>,
    c3: Arc<C3Engine>,
    voit: Arc<VoITController>,
    cache: Arc<dyn CacheStore>,
    index: Arc<dyn VectorIndex>,
    single_flight: Arc<SingleFlight<RebuildOutcome>>,
    validator: Arc<Validator>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Per-partition bounded concurrency (spec.md §5): requests beyond
    /// `pipeline.max_concurrency_per_partition` are rejected with
    /// `Overloaded` rather than queued inside the core.
    concurrency: DashMap<String, Arc<Semaphore>>,
}

struct RebuildOutcome {
    result: ExtractionResult,
    cost_actual: f64,
    flags: Vec<String>,
    overall_quality: f64,
}

impl ExtractionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        fingerprinter: Arc<Fingerprinter>,
        c3: Arc<C3Engine>,
        voit: Arc<VoITController>,
        cache: Arc<dyn CacheStore>,
        index: Arc<dyn VectorIndex>,
        validator: Arc<Validator>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            fingerprinter,
            c3,
            voit,
            cache,
            index,
            single_flight: Arc::new(SingleFlight::new()),
            validator,
            clock,
            telemetry,
            concurrency: DashMap::new(),
        }
    }

    fn partition_semaphore(&self, partition: &str) -> Arc<Semaphore> {
        self.concurrency
            .entry(partition.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.pipeline.max_concurrency_per_partition))
            })
            .clone()
    }

    pub async fn process(&self, request: ExtractionRequest) -> Result<ProcessOutcome> {
        let partial = self.fingerprinter.partial(&request)?;

        let semaphore = self.partition_semaphore(&partial.partition_key);
        let Ok(_permit) = semaphore.try_acquire() else {
            return Err(CoreError::Overloaded);
        };

        let fp = match self.fingerprinter.compute(&request).await {
            Ok(fp) => fp,
            Err(CoreError::EmbeddingUnavailable) => crate::models::Fingerprint {
                content_hash: partial.content_hash,
                embedding: Vec::new(),
                partition_key: partial.partition_key.clone(),
            },
            Err(err) => return Err(err),
        };

        match self.c3.decide(&request, &fp).await? {
            C3Outcome::Reuse { entry, certificate } => {
                let cost_saved = self.cheapest_tier_cost();
                self.emit_telemetry(
                    &fp.partition_key,
                    &certificate,
                    &entry.result,
                    0.0,
                    Some(cost_saved),
                    None,
                )
                .await;
                Ok(ProcessOutcome {
                    result: entry.result,
                    certificate,
                })
            }
            C3Outcome::Rebuild {
                degraded,
                counterfactual,
            } => {
                self.rebuild_and_write_back(request, fp, degraded, counterfactual)
                    .await
            }
        }
    }

    fn cheapest_tier_cost(&self) -> f64 {
        self.config
            .voit
            .tiers
            .iter()
            .map(|t| t.expected_cost)
            .fold(f64::INFINITY, f64::min)
    }

    async fn rebuild_and_write_back(
        &self,
        request: ExtractionRequest,
        fp: crate::models::Fingerprint,
        mut degraded: Vec<String>,
        counterfactual: Option<(CacheEntry, Certificate)>,
    ) -> Result<ProcessOutcome> {
        let content_hash = fp.content_hash;
        let partition = fp.partition_key.clone();
        let voit = self.voit.clone();
        let req_for_voit = request.clone();
        let partition_for_voit = partition.clone();

        let (outcome, shared) = self
            .single_flight
            .do_(content_hash, move || async move {
                let outcome = voit.run(&req_for_voit, &partition_for_voit).await?;
                let overall_quality = outcome.report.overall_quality();
                Ok(RebuildOutcome {
                    result: outcome.result,
                    cost_actual: outcome.cost_actual,
                    flags: outcome.flags,
                    overall_quality,
                })
            })
            .await;

        let rebuild = outcome?;
        degraded.extend(rebuild.flags.clone());

        // A rebuild that missed `quality_target` is still cached if it
        // clears the partition's absolute floor (spec.md §8 S4); the
        // `quality_shortfall` flag on the certificate is what tells callers
        // the target itself wasn't met, independent of whether we cached it.
        let accepted = rebuild.overall_quality >= self.config.pipeline.min_cacheable_quality;

        if accepted {
            let entry = CacheEntry {
                fingerprint: fp.clone(),
                canonical_text: request.canonical_text.clone(),
                result: rebuild.result.clone(),
                required_fields: request.required_fields.clone(),
                created_at: self.clock.utc_now(),
                last_verified_at: self.clock.utc_now(),
                validator_version: self.validator.version(),
                certificate_history: Default::default(),
                revocation_bit: false,
                force_refresh: false,
            };

            if !fp.embedding.is_empty() {
                let _ = self.index.upsert(&partition, &fp).await;
            }
            if let Err(err) = self.cache.put(entry).await {
                degraded.push("cache_write_failed".to_string());
                tracing::warn!(error = %err, "cache write failed after rebuild");
            }
            let _ = self.c3.record_accept(&partition).await;
        } else {
            let _ = self.c3.record_reject(&partition).await;
        }

        if let Some((counterfactual_entry, _)) = &counterfactual {
            let observed = crate::c3::edit_distance_ratio(
                &counterfactual_entry.result_text(),
                &rebuild.result.result_text(),
            );
            let within_tolerance = observed < 0.1;
            if let Err(err) = self
                .c3
                .record_refresh_sample(&partition, observed, within_tolerance)
                .await
            {
                degraded.push("calibration_write_failed".to_string());
                tracing::warn!(error = %err, "failed to record refresh counterfactual sample");
            }
        }

        let certificate = Certificate {
            decision: Decision::Rebuild,
            neighbor_fingerprint: None,
            similarity: 0.0,
            nonconformity: 1.0,
            risk_bound: f64::NEG_INFINITY,
            calibration_n: 0,
            tier_used: tier_used_from_result(&rebuild.result),
            shared,
            degraded: degraded.clone(),
        };

        self.emit_telemetry(
            &partition,
            &certificate,
            &rebuild.result,
            rebuild.cost_actual,
            None,
            Some(rebuild.overall_quality),
        )
        .await;

        Ok(ProcessOutcome {
            result: rebuild.result,
            certificate,
        })
    }

    /// Marks a cached entry as no longer trustworthy; a subsequent request
    /// with the same content hash will not exact-match against it.
    pub async fn invalidate(&self, content_hash: &crate::models::ContentHash) -> Result<()> {
        self.cache.mark_revoked(content_hash).await
    }

    /// Marks the cached entry for `content_hash` so the next matching
    /// `process()` call is forced through rebuild, still recording what the
    /// reuse decision would have been as a calibration sample
    /// (spec.md §4.5, §6 `ExtractionPipeline.refresh`). Does not rebuild
    /// itself — `decide()` is the single source of truth for the policy.
    pub async fn refresh(&self, partition: &str, content_hash: &ContentHash) -> Result<()> {
        tracing::debug!(partition, "marking entry for forced refresh");
        self.cache.mark_for_refresh(content_hash).await
    }

    async fn emit_telemetry(
        &self,
        partition_key: &str,
        certificate: &Certificate,
        result: &ExtractionResult,
        cost_actual: f64,
        cost_saved: Option<f64>,
        quality: Option<f64>,
    ) {
        let event = TelemetryEvent {
            partition_key: partition_key.to_string(),
            decision: certificate.decision,
            similarity: Some(certificate.similarity),
            nonconformity: Some(certificate.nonconformity),
            risk_bound: certificate.risk_bound,
            tier_used: match certificate.tier_used {
                TierUsed::Cached => None,
                TierUsed::Tier(kind) => Some(kind),
            },
            cost_actual,
            cost_saved,
            quality: quality.or(Some(result.overall_confidence)),
            flags: certificate.degraded.clone(),
        };
        self.telemetry.emit(event).await;
    }
}

fn tier_used_from_result(result: &ExtractionResult) -> TierUsed {
    TierUsed::Tier(result.source_model_tier)
}

trait ResultTextExt {
    fn result_text(&self) -> String;
}

impl ResultTextExt for ExtractionResult {
    fn result_text(&self) -> String {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={:?}", v.value))
            .collect();
        parts.sort();
        parts.join("|")
    }
}

impl ResultTextExt for CacheEntry {
    fn result_text(&self) -> String {
        self.result.result_text()
    }
}
