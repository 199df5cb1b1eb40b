//! Pure `(request, result) -> QualityReport` evaluation (spec.md §4.7).
//! Predicates and penalties are configuration, following the reference
//! validation module's pattern of pulling limits and patterns out of code
//! and into named constants/config rather than inlining magic numbers.

use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::models::{ExtractionRequest, ExtractionResult, QualityReport};

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// A cross-field consistency check. `predicate` returns `true` when the
/// result satisfies the rule; a violation multiplies consistency by
/// `penalty`, which must be in `(0, 1)`.
pub struct ConsistencyPredicate {
    pub name: String,
    pub penalty: f64,
    pub predicate: Box<dyn Fn(&ExtractionResult) -> bool + Send + Sync>,
}

pub struct ValidatorConfig {
    pub schema_fields: HashSet<String>,
    pub predicates: Vec<ConsistencyPredicate>,
    pub validator_version: u32,
}

impl ValidatorConfig {
    pub fn new(schema_fields: HashSet<String>, validator_version: u32) -> Self {
        Self {
            schema_fields,
            predicates: Vec::new(),
            validator_version,
        }
    }

    pub fn with_predicate(mut self, predicate: ConsistencyPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn version(&self) -> u32 {
        self.config.validator_version
    }

    /// Returns `ValidatorVersionMismatch` when a cache entry's stamped
    /// version no longer matches this validator's version; callers use
    /// this before trusting an exact-match cache hit.
    pub fn check_version(&self, entry_version: u32) -> Result<()> {
        if entry_version != self.config.validator_version {
            return Err(CoreError::ValidatorVersionMismatch {
                expected: self.config.validator_version,
                found: entry_version,
            });
        }
        Ok(())
    }

    pub fn evaluate(&self, request: &ExtractionRequest, result: &ExtractionResult) -> QualityReport {
        let completeness = self.completeness(request, result);
        let consistency = self.consistency(result);
        let confidence = self.confidence(request, result);
        let mut flags = HashSet::new();

        if result.fields.is_empty() {
            flags.insert("empty_result".to_string());
        }

        for name in result.fields.keys() {
            if !self.config.schema_fields.contains(name) {
                flags.insert("schema_drift".to_string());
                break;
            }
        }

        for name in &request.required_fields {
            if let Some(field) = result.fields.get(name) {
                if field.field_confidence < LOW_CONFIDENCE_THRESHOLD {
                    flags.insert(format!("low_confidence_field:{name}"));
                }
            }
        }

        QualityReport {
            completeness,
            consistency,
            confidence,
            flags,
        }
    }

    fn completeness(&self, request: &ExtractionRequest, result: &ExtractionResult) -> f64 {
        if request.required_fields.is_empty() {
            return 1.0;
        }
        let present = request
            .required_fields
            .iter()
            .filter(|name| {
                result
                    .fields
                    .get(name.as_str())
                    .map(|f| !f.value.is_empty())
                    .unwrap_or(false)
            })
            .count();
        present as f64 / request.required_fields.len() as f64
    }

    fn consistency(&self, result: &ExtractionResult) -> f64 {
        let mut score = 1.0;
        for predicate in &self.config.predicates {
            if !(predicate.predicate)(result) {
                score *= predicate.penalty;
            }
        }
        score
    }

    fn confidence(&self, request: &ExtractionRequest, result: &ExtractionResult) -> f64 {
        let confidences: Vec<f64> = request
            .required_fields
            .iter()
            .filter_map(|name| result.fields.get(name).map(|f| f.field_confidence))
            .collect();
        if confidences.is_empty() {
            return 0.0;
        }
        confidences
            .into_iter()
            .fold(f64::INFINITY, f64::min)
            .min(1.0)
            .max(0.0)
    }
}
