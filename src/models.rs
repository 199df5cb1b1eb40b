//! Core data types shared by every component: requests, fingerprints,
//! extraction results, quality reports, cache entries, certificates,
//! calibration samples and the per-request budget ledger.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// 256-bit content hash of `partition_key || 0x00 || canonical_text`.
pub type ContentHash = [u8; 32];

/// How a request's cache decision interacts with C³.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReusePolicy {
    Allow,
    Forbid,
    /// Force rebuild, but still record what the reuse decision would have been.
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelTierKind {
    Nano,
    Mini,
    Full,
    Ensemble,
}

impl std::fmt::Display for ModelTierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelTierKind::Nano => "nano",
            ModelTierKind::Mini => "mini",
            ModelTierKind::Full => "full",
            ModelTierKind::Ensemble => "ensemble",
        };
        write!(f, "{s}")
    }
}

/// Inputs to one extraction. `canonical_text` is assumed already normalized
/// by the caller (whitespace-collapsed, lowercased where safe, attachments
/// excluded) — the core does not re-normalize it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub canonical_text: String,
    pub context_tags: HashSet<String>,
    pub required_fields: Vec<String>,
    pub quality_target: f64,
    pub budget: f64,
    pub deadline: std::time::Duration,
    pub reuse_policy: ReusePolicy,
}

/// Joint (hash, embedding, partition) identity of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content_hash: ContentHash,
    pub embedding: Vec<f32>,
    pub partition_key: String,
}

/// The hash/partition half of a `Fingerprint`, computable without the
/// embedding provider. Used when the embedding provider is unavailable and
/// C³ must fall back to exact-match-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFingerprint {
    pub content_hash: ContentHash,
    pub partition_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Number(_) | FieldValue::Bool(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldResult {
    pub value: FieldValue,
    pub field_confidence: f64,
}

/// Immutable once written. Unknown/extra fields a model produced that are
/// not part of the declared schema go in `extensions`, bounded by
/// `ValidatorConfig::max_extensions`, rather than an unrestricted dynamic map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: HashMap<String, FieldResult>,
    pub overall_confidence: f64,
    pub source_model_tier: ModelTierKind,
    pub extensions: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub completeness: f64,
    pub consistency: f64,
    pub confidence: f64,
    pub flags: HashSet<String>,
}

impl QualityReport {
    pub fn overall_quality(&self) -> f64 {
        self.completeness.min(self.consistency).min(self.confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Reuse,
    Rebuild,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TierUsed {
    Cached,
    Tier(ModelTierKind),
}

/// Per-request record of the reuse/rebuild decision and its justification.
/// Emitted once per request, immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub decision: Decision,
    pub neighbor_fingerprint: Option<ContentHash>,
    pub similarity: f64,
    pub nonconformity: f64,
    pub risk_bound: f64,
    pub calibration_n: usize,
    pub tier_used: TierUsed,
    pub shared: bool,
    pub degraded: Vec<String>,
}

/// `(fingerprint, result, created_at, last_verified_at, validator_version,
/// certificate_history, revocation_bit)` plus the canonical text needed to
/// compute `edit_distance_ratio` against future neighbors — spec.md §4.5's
/// nonconformity formula references `neighbor.canonical_text` directly, so
/// the entry must retain it alongside the fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub canonical_text: String,
    pub result: ExtractionResult,
    pub required_fields: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_verified_at: chrono::DateTime<chrono::Utc>,
    pub validator_version: u32,
    pub certificate_history: VecDeque<Certificate>,
    pub revocation_bit: bool,
    /// Set by `ExtractionPipeline::refresh`; forces the next matching
    /// `process()` call through rebuild with a counterfactual calibration
    /// sample, regardless of what the conformal decision would otherwise
    /// have been (spec.md §4.5, §6). Cleared once honored.
    pub force_refresh: bool,
}

pub const CERTIFICATE_HISTORY_CAPACITY: usize = 16;

impl CacheEntry {
    pub fn push_certificate(&mut self, certificate: Certificate) {
        self.certificate_history.push_back(certificate);
        while self.certificate_history.len() > CERTIFICATE_HISTORY_CAPACITY {
            self.certificate_history.pop_front();
        }
    }

    pub fn covers(&self, required_fields: &[String]) -> bool {
        required_fields
            .iter()
            .all(|f| self.required_fields.iter().any(|g| g == f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub nonconformity_score: f64,
    pub label: Label,
    pub partition_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Per-request remaining effort, decremented by each model invocation's cost.
/// Never shared across requests.
#[derive(Debug, Clone, Copy)]
pub struct BudgetLedger {
    remaining: f64,
}

impl BudgetLedger {
    pub fn new(budget: f64) -> Self {
        Self {
            remaining: budget.max(0.0),
        }
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    pub fn can_afford(&self, cost: f64) -> bool {
        cost <= self.remaining
    }

    pub fn charge(&mut self, cost: f64) {
        self.remaining = (self.remaining - cost).max(0.0);
    }
}
