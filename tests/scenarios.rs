//! End-to-end scenarios (spec.md §8, S1-S6) plus the quantified invariants
//! not already exercised by a unit test, driven entirely through the
//! public API the way the reference orchestrator's own
//! `agents/orchestrator/tests/integration.rs` exercises `AgentOrchestrator`
//! rather than its internals.

use std::collections::HashMap as Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use c3voit_core::c3::{edit_distance_ratio, C3Engine, C3Outcome};
use c3voit_core::cache_store::{CacheStore, InMemoryCacheStore};
use c3voit_core::calibration::{CalibrationLog, InMemoryCalibrationLog};
use c3voit_core::clock::FixedClock;
use c3voit_core::config::{C3Config, PipelineConfig, PipelineSettings, TierPrior, VoitConfig};
use c3voit_core::fingerprint::{EmbeddingProvider, Fingerprinter};
use c3voit_core::model_tier::ModelTier;
use c3voit_core::models::{
    CacheEntry, Decision, ExtractionRequest, ExtractionResult, FieldResult, FieldValue,
    ModelTierKind, ReusePolicy, TierUsed,
};
use c3voit_core::pipeline::ExtractionPipeline;
use c3voit_core::telemetry::{NullTelemetrySink, TracingTelemetrySink};
use c3voit_core::validator::{Validator, ValidatorConfig};
use c3voit_core::vector_index::{cosine_similarity, InMemoryVectorIndex, VectorIndex};
use c3voit_core::Result;

fn request(text: &str, required_fields: &[&str]) -> ExtractionRequest {
    ExtractionRequest {
        canonical_text: text.to_string(),
        context_tags: ["sales".to_string()].into_iter().collect(),
        required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
        quality_target: 0.9,
        budget: 1.0,
        deadline: Duration::from_secs(5),
        reuse_policy: ReusePolicy::Allow,
    }
}

fn result_with(fields: Vec<(&str, FieldValue, f64)>, tier: ModelTierKind, confidence: f64) -> ExtractionResult {
    let mut map = Map::new();
    for (name, value, confidence) in fields {
        map.insert(name.to_string(), FieldResult { value, field_confidence: confidence });
    }
    ExtractionResult {
        fields: map,
        overall_confidence: confidence,
        source_model_tier: tier,
        extensions: Map::new(),
    }
}

/// Maps canonical text to a caller-chosen embedding, so a scenario can pin
/// the exact cosine similarity between two fingerprints instead of hoping a
/// real embedder lands on one.
struct ScriptedEmbedding {
    vectors: Map<String, Vec<f32>>,
    default: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectors.get(text).cloned().unwrap_or_else(|| self.default.clone()))
    }
}

/// A model tier with a fixed cost/quality/confidence and a call counter, so
/// S5's single-flight guarantee and S3/S4's escalation can be asserted on
/// invocation counts rather than timing.
struct ScriptedTier {
    kind: ModelTierKind,
    cost: f64,
    quality: f64,
    confidence: f64,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelTier for ScriptedTier {
    fn kind(&self) -> ModelTierKind {
        self.kind
    }

    fn expected_cost(&self) -> f64 {
        self.cost
    }

    fn expected_quality(&self) -> f64 {
        self.quality
    }

    async fn extract(&self, _request: &ExtractionRequest) -> Result<ExtractionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(result_with(
            vec![
                ("name", FieldValue::Text("A. Smith".into()), self.confidence),
                ("company", FieldValue::Text("Acme".into()), self.confidence),
            ],
            self.kind,
            self.confidence,
        ))
    }
}

fn seeded_cache(capacity: usize) -> (Arc<InMemoryVectorIndex>, Arc<InMemoryCacheStore>, Arc<InMemoryCalibrationLog>) {
    let index = Arc::new(InMemoryVectorIndex::new());
    let cache = Arc::new(InMemoryCacheStore::new(capacity, index.clone()));
    let calibration = Arc::new(InMemoryCalibrationLog::new(1000));
    (index, cache, calibration)
}

fn seed_entry(
    content_hash: [u8; 32],
    partition: &str,
    canonical_text: &str,
    embedding: Vec<f32>,
    required_fields: &[&str],
    validator_version: u32,
) -> CacheEntry {
    CacheEntry {
        fingerprint: c3voit_core::models::Fingerprint {
            content_hash,
            embedding,
            partition_key: partition.to_string(),
        },
        canonical_text: canonical_text.to_string(),
        result: result_with(
            vec![
                ("name", FieldValue::Text("A. Smith".into()), 0.95),
                ("company", FieldValue::Text("Acme".into()), 0.90),
            ],
            ModelTierKind::Full,
            0.95,
        ),
        required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
        created_at: chrono::Utc::now(),
        last_verified_at: chrono::Utc::now(),
        validator_version,
        certificate_history: Default::default(),
        revocation_bit: false,
        force_refresh: false,
    }
}

/// Unit vector at angle `theta` (radians) from the x-axis, so two vectors
/// `angled(0.0)` and `angled(theta)` have cosine similarity exactly
/// `cos(theta)`.
fn angled(theta: f64) -> Vec<f32> {
    vec![theta.cos() as f32, theta.sin() as f32]
}

// ---------------------------------------------------------------------
// S1 — Exact hit
// ---------------------------------------------------------------------

#[tokio::test]
async fn s1_exact_hit_reuses_with_perfect_similarity_and_identical_result() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));

    let text = "A. Smith at Acme";
    let hash = Fingerprinter::content_hash("sales", text);
    let embedding = angled(0.0);

    let seeded = seed_entry(hash, "sales", text, embedding.clone(), &["name", "company"], 3);
    index.upsert("sales", &seeded.fingerprint).await.unwrap();
    cache.put(seeded.clone()).await.unwrap();

    let c3 = C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration.clone(),
        clock,
        3,
    );

    let req = request(text, &["name", "company"]);
    let fp = c3voit_core::models::Fingerprint {
        content_hash: hash,
        embedding,
        partition_key: "sales".to_string(),
    };

    match c3.decide(&req, &fp).await.unwrap() {
        C3Outcome::Reuse { entry, certificate } => {
            assert_eq!(certificate.decision, Decision::Reuse);
            assert_eq!(certificate.similarity, 1.0);
            assert_eq!(certificate.nonconformity, 0.0);
            assert_eq!(certificate.tier_used, TierUsed::Cached);
            assert_eq!(entry.result.overall_confidence, seeded.result.overall_confidence);
        }
        C3Outcome::Rebuild { .. } => panic!("expected an exact-match reuse"),
    }
}

// ---------------------------------------------------------------------
// S2 — Approximate hit under calibrated tau
// ---------------------------------------------------------------------

/// Fills the calibration window with `n` constant samples so `quantile`
/// returns exactly `value` for any `delta` with `n >= n_min` — the window
/// is stationary, so every order statistic equals the same value.
async fn fix_calibration_threshold(log: &InMemoryCalibrationLog, partition: &str, value: f64, n: usize) {
    for _ in 0..n {
        log.append(
            partition,
            c3voit_core::models::CalibrationSample {
                nonconformity_score: value,
                label: c3voit_core::models::Label::Accepted,
                partition_key: partition.to_string(),
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn s2_approximate_hit_reuses_when_nonconformity_is_under_tau() {
    let (index, cache, calibration) = seeded_cache(1000);
    fix_calibration_threshold(&calibration, "sales", 0.12, 150).await;

    let neighbor_text = "A. Smith at Acme";
    let neighbor_hash = Fingerprinter::content_hash("sales", neighbor_text);
    let neighbor_embedding = angled(0.0);
    let seeded = seed_entry(
        neighbor_hash,
        "sales",
        neighbor_text,
        neighbor_embedding.clone(),
        &["name", "company"],
        1,
    );
    index.upsert("sales", &seeded.fingerprint).await.unwrap();
    cache.put(seeded).await.unwrap();

    // One character off from the neighbor: edit_distance_ratio is small, so
    // together with cos(theta) this keeps nonconformity comfortably under
    // the fixed tau of 0.12.
    let query_text = "A. Smyth at Acme";
    let theta = (0.93_f64).acos();
    let query_embedding = angled(theta);
    let cos = cosine_similarity(&neighbor_embedding, &query_embedding);
    let edit_ratio = edit_distance_ratio(query_text, neighbor_text);
    let expected_nonconformity = 1.0 - cos + 0.25 * edit_ratio;
    assert!(expected_nonconformity < 0.12, "fixture must produce a < tau");

    let c3 = C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration.clone(),
        Arc::new(FixedClock::new(chrono::Utc::now())),
        1,
    );

    let req = request(query_text, &["name", "company"]);
    let query_hash = Fingerprinter::content_hash("sales", query_text);
    let fp = c3voit_core::models::Fingerprint {
        content_hash: query_hash,
        embedding: query_embedding,
        partition_key: "sales".to_string(),
    };

    match c3.decide(&req, &fp).await.unwrap() {
        C3Outcome::Reuse { certificate, .. } => {
            assert_eq!(certificate.decision, Decision::Reuse);
            assert!((certificate.nonconformity - expected_nonconformity).abs() < 1e-9);
            assert_eq!(certificate.risk_bound, 0.12);
        }
        C3Outcome::Rebuild { .. } => panic!("expected an approximate-match reuse"),
    }
}

// ---------------------------------------------------------------------
// S3 — Approximate miss -> rebuild with escalation
// ---------------------------------------------------------------------

#[tokio::test]
async fn s3_approximate_miss_rebuilds_escalates_to_full_and_caches() {
    let (index, cache, calibration) = seeded_cache(1000);
    fix_calibration_threshold(&calibration, "sales", 0.12, 150).await;

    let neighbor_text = "A. Smith at Acme";
    let neighbor_hash = Fingerprinter::content_hash("sales", neighbor_text);
    let neighbor_embedding = angled(0.0);
    let seeded = seed_entry(
        neighbor_hash,
        "sales",
        neighbor_text,
        neighbor_embedding.clone(),
        &["name", "company"],
        1,
    );
    index.upsert("sales", &seeded.fingerprint).await.unwrap();
    cache.put(seeded).await.unwrap();

    // Far enough in both angle and text that nonconformity clears tau.
    let query_text = "a completely unrelated block of text about quarterly widgets";
    let theta = (0.90_f64).acos();
    let query_embedding = angled(theta);
    let cos = cosine_similarity(&neighbor_embedding, &query_embedding);
    let edit_ratio = edit_distance_ratio(query_text, neighbor_text);
    let expected_nonconformity = 1.0 - cos + 0.25 * edit_ratio;
    assert!(expected_nonconformity > 0.12, "fixture must produce a > tau");

    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration.clone(),
        clock.clone(),
        1,
    ));

    let tiers: Vec<Arc<dyn ModelTier>> = vec![
        Arc::new(ScriptedTier { kind: ModelTierKind::Nano, cost: 0.1, quality: 0.55, confidence: 0.55, calls: Arc::new(AtomicUsize::new(0)) }),
        Arc::new(ScriptedTier { kind: ModelTierKind::Mini, cost: 0.3, quality: 0.80, confidence: 0.80, calls: Arc::new(AtomicUsize::new(0)) }),
        Arc::new(ScriptedTier { kind: ModelTierKind::Full, cost: 0.7, quality: 0.92, confidence: 0.94, calls: Arc::new(AtomicUsize::new(0)) }),
    ];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(
        VoitConfig {
            tiers: vec![
                TierPrior { kind: ModelTierKind::Nano, expected_cost: 0.1, prior_quality: 0.55 },
                TierPrior { kind: ModelTierKind::Mini, expected_cost: 0.3, prior_quality: 0.80 },
                TierPrior { kind: ModelTierKind::Full, expected_cost: 0.7, prior_quality: 0.92 },
                TierPrior { kind: ModelTierKind::Ensemble, expected_cost: 1.0, prior_quality: 0.96 },
            ],
            ensemble_enabled: true,
            ewma_alpha: 0.2,
        },
        tiers,
        validator.clone(),
    ));

    let embed_text = query_text.to_string();
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: [(embed_text, query_embedding.clone())].into_iter().collect(),
        default: angled(0.0),
    })));

    let mut config = PipelineConfig::default();
    config.voit = VoitConfig {
        tiers: vec![
            TierPrior { kind: ModelTierKind::Nano, expected_cost: 0.1, prior_quality: 0.55 },
            TierPrior { kind: ModelTierKind::Mini, expected_cost: 0.3, prior_quality: 0.80 },
            TierPrior { kind: ModelTierKind::Full, expected_cost: 0.7, prior_quality: 0.92 },
            TierPrior { kind: ModelTierKind::Ensemble, expected_cost: 1.0, prior_quality: 0.96 },
        ],
        ensemble_enabled: true,
        ewma_alpha: 0.2,
    };

    let pipeline = ExtractionPipeline::new(
        config,
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    let mut req = request(query_text, &["name", "company"]);
    req.quality_target = 0.90;
    req.budget = 1.0;

    let outcome = pipeline.process(req).await.unwrap();
    assert_eq!(outcome.certificate.decision, Decision::Rebuild);
    assert_eq!(outcome.certificate.tier_used, TierUsed::Tier(ModelTierKind::Full));
    assert!(!outcome.certificate.degraded.contains(&"quality_shortfall".to_string()));

    let cached = cache.get(&Fingerprinter::content_hash("sales", query_text)).await.unwrap();
    assert!(cached.is_some(), "accepted rebuild must be written back");
}

// ---------------------------------------------------------------------
// S4 — Budget-constrained degradation
// ---------------------------------------------------------------------

#[tokio::test]
async fn s4_budget_constrained_rebuild_is_flagged_but_still_cached_above_floor() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));

    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration,
        clock.clone(),
        1,
    ));

    // Only nano and mini fit a 0.35 budget; mini tops out under the 0.90
    // quality target, so VoIT cannot escalate to `full`.
    let tiers: Vec<Arc<dyn ModelTier>> = vec![
        Arc::new(ScriptedTier { kind: ModelTierKind::Nano, cost: 0.1, quality: 0.55, confidence: 0.55, calls: Arc::new(AtomicUsize::new(0)) }),
        Arc::new(ScriptedTier { kind: ModelTierKind::Mini, cost: 0.3, quality: 0.80, confidence: 0.78, calls: Arc::new(AtomicUsize::new(0)) }),
        Arc::new(ScriptedTier { kind: ModelTierKind::Full, cost: 0.7, quality: 0.92, confidence: 0.94, calls: Arc::new(AtomicUsize::new(0)) }),
    ];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit_config = VoitConfig {
        tiers: vec![
            TierPrior { kind: ModelTierKind::Nano, expected_cost: 0.1, prior_quality: 0.55 },
            TierPrior { kind: ModelTierKind::Mini, expected_cost: 0.3, prior_quality: 0.80 },
            TierPrior { kind: ModelTierKind::Full, expected_cost: 0.7, prior_quality: 0.92 },
            TierPrior { kind: ModelTierKind::Ensemble, expected_cost: 1.0, prior_quality: 0.96 },
        ],
        ensemble_enabled: false,
        ewma_alpha: 0.2,
    };
    let voit = Arc::new(c3voit_core::voit::VoITController::new(voit_config.clone(), tiers, validator.clone()));

    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let mut config = PipelineConfig::default();
    config.voit = voit_config;
    config.pipeline.min_cacheable_quality = 0.5;

    let pipeline = ExtractionPipeline::new(
        config,
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    let mut req = request("budget constrained request", &["name", "company"]);
    req.quality_target = 0.90;
    req.budget = 0.35;

    let outcome = pipeline.process(req).await.unwrap();
    assert_eq!(outcome.certificate.decision, Decision::Rebuild);
    assert!(outcome.certificate.degraded.contains(&"quality_shortfall".to_string()));
    assert_eq!(outcome.certificate.tier_used, TierUsed::Tier(ModelTierKind::Mini));

    // 0.78 quality clears the 0.5 floor: still written back despite the
    // shortfall, per spec.md's S4 caching policy.
    let cached = cache
        .get(&Fingerprinter::content_hash("sales", "budget constrained request"))
        .await
        .unwrap();
    assert!(cached.is_some());
}

// ---------------------------------------------------------------------
// S5 — Single-flight
// ---------------------------------------------------------------------

#[tokio::test]
async fn s5_sixteen_concurrent_identical_requests_invoke_the_model_once() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));

    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration,
        clock.clone(),
        1,
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let tiers: Vec<Arc<dyn ModelTier>> = vec![Arc::new(ScriptedTier {
        kind: ModelTierKind::Full,
        cost: 0.5,
        quality: 0.95,
        confidence: 0.95,
        calls: calls.clone(),
    })];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(VoitConfig::default(), tiers, validator.clone()));
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let telemetry = Arc::new(TracingTelemetrySink::new(64));
    let pipeline = Arc::new(ExtractionPipeline::new(
        PipelineConfig::default(),
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        telemetry.clone(),
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.process(request("concurrent burst text", &["name", "company"])).await
        }));
    }

    let mut shared_count = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.certificate.shared {
            shared_count += 1;
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one path through VoIT");
    assert_eq!(shared_count, 15, "15 of 16 callers observe a shared rebuild");
    assert_eq!(telemetry.recent().len(), 16, "one telemetry event per completion");
}

// ---------------------------------------------------------------------
// S6 — Invalidate during reuse
// ---------------------------------------------------------------------

#[tokio::test]
async fn s6_process_starting_after_invalidate_returns_never_reuses_the_stale_entry() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));

    let text = "invalidate me";
    let hash = Fingerprinter::content_hash("sales", text);
    let embedding = angled(0.0);
    let seeded = seed_entry(hash, "sales", text, embedding, &["name", "company"], 1);
    index.upsert("sales", &seeded.fingerprint).await.unwrap();
    cache.put(seeded).await.unwrap();

    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration,
        clock.clone(),
        1,
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let tiers: Vec<Arc<dyn ModelTier>> = vec![Arc::new(ScriptedTier {
        kind: ModelTierKind::Full,
        cost: 0.5,
        quality: 0.95,
        confidence: 0.95,
        calls: calls.clone(),
    })];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(VoitConfig::default(), tiers, validator.clone()));
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let pipeline = ExtractionPipeline::new(
        PipelineConfig::default(),
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    pipeline.invalidate(&hash).await.unwrap();

    let outcome = pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(outcome.certificate.decision, Decision::Rebuild);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------
// Quantified invariants not already covered by a module-local unit test
// ---------------------------------------------------------------------

/// Invariant 4 (budget safety): the sum of `actual_cost` over invoked tiers
/// never exceeds `request.budget`.
#[tokio::test]
async fn invariant_budget_safety_never_overspends_the_ledger() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration,
        clock,
        1,
    ));

    let tiers: Vec<Arc<dyn ModelTier>> = vec![
        Arc::new(ScriptedTier { kind: ModelTierKind::Nano, cost: 0.2, quality: 0.55, confidence: 0.3, calls: Arc::new(AtomicUsize::new(0)) }),
        Arc::new(ScriptedTier { kind: ModelTierKind::Mini, cost: 0.4, quality: 0.80, confidence: 0.3, calls: Arc::new(AtomicUsize::new(0)) }),
    ];
    let schema = ["name"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit_config = VoitConfig {
        tiers: vec![
            TierPrior { kind: ModelTierKind::Nano, expected_cost: 0.2, prior_quality: 0.55 },
            TierPrior { kind: ModelTierKind::Mini, expected_cost: 0.4, prior_quality: 0.80 },
        ],
        ensemble_enabled: false,
        ewma_alpha: 0.2,
    };
    let voit = c3voit_core::voit::VoITController::new(voit_config, tiers, validator);

    let mut req = request("budget probe", &["name"]);
    req.budget = 0.5;
    req.quality_target = 0.95;

    let outcome = voit.run(&req, "sales").await.unwrap();
    assert!(outcome.cost_actual <= req.budget);
}

/// Invariant 6 (idempotence of invalidate): calling `invalidate` twice has
/// the same externally observable effect as calling it once.
#[tokio::test]
async fn invariant_invalidate_is_idempotent() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration,
        clock.clone(),
        1,
    ));

    let tiers: Vec<Arc<dyn ModelTier>> = vec![Arc::new(ScriptedTier {
        kind: ModelTierKind::Full,
        cost: 0.5,
        quality: 0.95,
        confidence: 0.95,
        calls: Arc::new(AtomicUsize::new(0)),
    })];
    let schema = ["name"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(VoitConfig::default(), tiers, validator.clone()));
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let pipeline = ExtractionPipeline::new(
        PipelineConfig::default(),
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    let text = "idempotent invalidate";
    pipeline.process(request(text, &["name"])).await.unwrap();
    let hash = Fingerprinter::content_hash("sales", text);

    pipeline.invalidate(&hash).await.unwrap();
    let once = cache.get(&hash).await.unwrap().unwrap();
    pipeline.invalidate(&hash).await.unwrap();
    let twice = cache.get(&hash).await.unwrap().unwrap();

    assert_eq!(once.revocation_bit, twice.revocation_bit);
    assert!(twice.revocation_bit);
}

/// `ReusePolicy::Refresh` at the request level forces a rebuild even though
/// an exact-match entry already exists, and records the counterfactual reuse
/// decision as a calibration sample (spec.md §4.5).
#[tokio::test]
async fn request_level_refresh_policy_forces_rebuild_and_records_counterfactual() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration.clone(),
        clock.clone(),
        1,
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let tiers: Vec<Arc<dyn ModelTier>> = vec![Arc::new(ScriptedTier {
        kind: ModelTierKind::Full,
        cost: 0.5,
        quality: 0.95,
        confidence: 0.95,
        calls: calls.clone(),
    })];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(VoitConfig::default(), tiers, validator.clone()));
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let pipeline = ExtractionPipeline::new(
        PipelineConfig::default(),
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    let text = "refresh policy probe";
    pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut refresh_req = request(text, &["name", "company"]);
    refresh_req.reuse_policy = ReusePolicy::Refresh;
    let outcome = pipeline.process(refresh_req).await.unwrap();

    assert_eq!(outcome.certificate.decision, Decision::Rebuild);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "refresh must always force a rebuild");
    assert_eq!(
        calibration.window_size("sales").await.unwrap(),
        1,
        "the counterfactual reuse decision must be recorded as a calibration sample"
    );
}

/// `ExtractionPipeline::refresh(partition, content_hash)` only marks the
/// entry; the forced rebuild happens on the next matching `process()` call,
/// exactly once, after which the entry reuses normally again.
#[tokio::test]
async fn entry_level_refresh_forces_rebuild_once_on_next_process_then_clears() {
    let (index, cache, calibration) = seeded_cache(1000);
    let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
    let c3 = Arc::new(C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache.clone(),
        index.clone(),
        calibration.clone(),
        clock.clone(),
        1,
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let tiers: Vec<Arc<dyn ModelTier>> = vec![Arc::new(ScriptedTier {
        kind: ModelTierKind::Full,
        cost: 0.5,
        quality: 0.95,
        confidence: 0.95,
        calls: calls.clone(),
    })];
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Arc::new(Validator::new(ValidatorConfig::new(schema, 1)));
    let voit = Arc::new(c3voit_core::voit::VoITController::new(VoitConfig::default(), tiers, validator.clone()));
    let fingerprinter = Arc::new(Fingerprinter::new(Arc::new(ScriptedEmbedding {
        vectors: Map::new(),
        default: angled(0.0),
    })));

    let pipeline = ExtractionPipeline::new(
        PipelineConfig::default(),
        fingerprinter,
        c3,
        voit,
        cache.clone(),
        index.clone(),
        validator,
        clock,
        Arc::new(NullTelemetrySink),
    );

    let text = "entry level refresh probe";
    let hash = Fingerprinter::content_hash("sales", text);

    pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "cold request rebuilds");

    let warm = pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(warm.certificate.decision, Decision::Reuse);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "warm request reuses");

    pipeline.refresh("sales", &hash).await.unwrap();

    let forced = pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(forced.certificate.decision, Decision::Rebuild);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "refresh() must force exactly the next request to rebuild");

    let after = pipeline.process(request(text, &["name", "company"])).await.unwrap();
    assert_eq!(after.certificate.decision, Decision::Reuse);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "the forced flag is one-shot and clears once honored");
}

/// Invariant 7 (validator monotonicity): re-evaluating the same
/// `(request, result)` pair under the same validator version never changes
/// the `QualityReport`.
#[test]
fn invariant_validator_monotonicity_same_inputs_same_report() {
    let schema = ["name", "company"].iter().map(|s| s.to_string()).collect();
    let validator = Validator::new(ValidatorConfig::new(schema, 7));
    let req = request("repeated evaluation", &["name", "company"]);
    let result = result_with(
        vec![
            ("name", FieldValue::Text("Ada".into()), 0.8),
            ("company", FieldValue::Text("Acme".into()), 0.7),
        ],
        ModelTierKind::Mini,
        0.75,
    );

    let first = validator.evaluate(&req, &result);
    let second = validator.evaluate(&req, &result);

    assert_eq!(first.completeness, second.completeness);
    assert_eq!(first.consistency, second.consistency);
    assert_eq!(first.confidence, second.confidence);
    assert_eq!(first.flags, second.flags);
}

/// Invariant 8 (exact-match dominance): a non-revoked, version-matching
/// exact-match entry is reused without ever touching the vector index.
#[tokio::test]
async fn invariant_exact_match_dominance_never_consults_the_index() {
    let (index, cache, calibration) = seeded_cache(1000);
    let text = "dominance check";
    let hash = Fingerprinter::content_hash("sales", text);
    let embedding = angled(0.0);
    let seeded = seed_entry(hash, "sales", text, embedding.clone(), &["name"], 1);
    // Deliberately never upsert into the index: if the engine fell through
    // to the approximate-match path it would find nothing and rebuild.
    cache.put(seeded).await.unwrap();
    assert!(index.is_empty("sales"));

    let c3 = C3Engine::new(
        C3Config::default(),
        PipelineSettings::default(),
        cache,
        index,
        calibration,
        Arc::new(FixedClock::new(chrono::Utc::now())),
        1,
    );

    let req = request(text, &["name"]);
    let fp = c3voit_core::models::Fingerprint { content_hash: hash, embedding, partition_key: "sales".to_string() };

    match c3.decide(&req, &fp).await.unwrap() {
        C3Outcome::Reuse { certificate, .. } => assert_eq!(certificate.decision, Decision::Reuse),
        C3Outcome::Rebuild { .. } => panic!("exact match must dominate the approximate path"),
    }
}
