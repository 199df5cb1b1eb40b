//! Budget- and value-aware model tier selection (spec.md §4.6). The
//! escalate-on-shortfall, retry-once-then-fall-through shape is grounded on
//! `claude_code/circuit_breaker.rs`'s state machine: both track a rolling
//! count of outcomes per key (there, the API; here, a partition+tier) under
//! a short-lived lock and make the next decision from that state, never
//! from a single observation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::VoitConfig;
use crate::error::{CoreError, Result};
use crate::model_tier::{ModelTier, TierStats};
use crate::models::{BudgetLedger, ExtractionRequest, ExtractionResult, ModelTierKind, QualityReport};
use crate::validator::Validator;

/// One tier's contribution to the final result, kept so the ensemble rule
/// can combine the last two attempts.
struct Attempt {
    tier: ModelTierKind,
    result: ExtractionResult,
    report: QualityReport,
    cost: f64,
}

pub struct VoitOutcome {
    pub result: ExtractionResult,
    pub report: QualityReport,
    pub tier_used: ModelTierKind,
    pub cost_actual: f64,
    pub flags: Vec<String>,
}

pub struct VoITController {
    config: VoitConfig,
    tiers: Vec<Arc<dyn ModelTier>>,
    validator: Arc<Validator>,
    /// partition -> tier -> stats
    stats: Mutex<HashMap<String, HashMap<ModelTierKind, TierStats>>>,
}

impl VoITController {
    pub fn new(config: VoitConfig, tiers: Vec<Arc<dyn ModelTier>>, validator: Arc<Validator>) -> Self {
        Self {
            config,
            tiers,
            validator,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn prior_quality(&self, kind: ModelTierKind) -> f64 {
        self.config
            .tiers
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.prior_quality)
            .unwrap_or(0.5)
    }

    fn expected_quality(&self, partition: &str, tier: &Arc<dyn ModelTier>) -> f64 {
        let stats = self.stats.lock();
        stats
            .get(partition)
            .and_then(|by_tier| by_tier.get(&tier.kind()))
            .filter(|s| s.samples > 0)
            .map(|s| s.ewma_quality)
            .unwrap_or_else(|| self.prior_quality(tier.kind()))
    }

    fn record(&self, partition: &str, kind: ModelTierKind, quality: f64, cost: f64) {
        let mut stats = self.stats.lock();
        let by_tier = stats.entry(partition.to_string()).or_default();
        let entry = by_tier
            .entry(kind)
            .or_insert_with(|| TierStats::new(self.prior_quality(kind), cost));
        entry.update(self.config.ewma_alpha, quality, cost);
    }

    fn tiers_sorted_by_cost(&self) -> Vec<Arc<dyn ModelTier>> {
        let mut tiers = self.tiers.clone();
        tiers.sort_by(|a, b| a.expected_cost().partial_cmp(&b.expected_cost()).unwrap());
        tiers
    }

    fn pick_initial(
        &self,
        partition: &str,
        quality_target: f64,
        budget: f64,
    ) -> Option<Arc<dyn ModelTier>> {
        let tiers = self.tiers_sorted_by_cost();

        if let Some(tier) = tiers.iter().find(|t| {
            self.expected_quality(partition, t) >= quality_target && t.expected_cost() <= budget
        }) {
            return Some(tier.clone());
        }

        tiers
            .into_iter()
            .max_by(|a, b| {
                let score_a = self.expected_quality(partition, a) * (1.0_f64).min(budget / a.expected_cost().max(f64::EPSILON));
                let score_b = self.expected_quality(partition, b) * (1.0_f64).min(budget / b.expected_cost().max(f64::EPSILON));
                score_a.partial_cmp(&score_b).unwrap()
            })
    }

    fn next_higher_tier_within_budget(
        &self,
        current: ModelTierKind,
        remaining_budget: f64,
    ) -> Option<Arc<dyn ModelTier>> {
        let tiers = self.tiers_sorted_by_cost();
        let current_cost = tiers
            .iter()
            .find(|t| t.kind() == current)
            .map(|t| t.expected_cost())
            .unwrap_or(0.0);

        tiers
            .into_iter()
            .filter(|t| t.expected_cost() > current_cost && t.expected_cost() <= remaining_budget)
            .min_by(|a, b| a.expected_cost().partial_cmp(&b.expected_cost()).unwrap())
    }

    async fn invoke_with_retry(
        &self,
        tier: &Arc<dyn ModelTier>,
        request: &ExtractionRequest,
        deadline: Duration,
    ) -> Result<(ExtractionResult, f64)> {
        let attempt = tokio::time::timeout(deadline, tier.extract(request)).await;
        let first = match attempt {
            Ok(result) => result,
            Err(_) => return Err(CoreError::DeadlineExceeded),
        };

        match first {
            Ok(result) => Ok((result, tier.expected_cost())),
            Err(CoreError::ModelFailure { retryable: true, .. }) => {
                let jitter = Duration::from_millis(20 + (rand::random::<u64>() % 60));
                tokio::time::sleep(jitter.min(deadline)).await;
                let retry = tokio::time::timeout(deadline, tier.extract(request)).await;
                match retry {
                    Ok(Ok(result)) => Ok((result, tier.expected_cost())),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(CoreError::DeadlineExceeded),
                }
            }
            Ok(_) => unreachable!(),
            Err(err) => Err(err),
        }
    }

    pub async fn run(&self, request: &ExtractionRequest, partition: &str) -> Result<VoitOutcome> {
        if self.tiers.is_empty() {
            return Err(CoreError::Configuration("no model tiers configured".into()));
        }

        let mut ledger = BudgetLedger::new(request.budget);
        let mut flags: Vec<String> = Vec::new();
        let mut attempts: Vec<Attempt> = Vec::new();

        let Some(mut tier) = self.pick_initial(partition, request.quality_target, ledger.remaining())
        else {
            return Err(CoreError::BudgetExhausted);
        };

        loop {
            if !ledger.can_afford(tier.expected_cost()) {
                if attempts.is_empty() {
                    return Err(CoreError::BudgetExhausted);
                }
                break;
            }

            let invocation = self.invoke_with_retry(&tier, request, request.deadline).await;

            match invocation {
                Ok((result, actual_cost)) => {
                    ledger.charge(actual_cost);
                    let report = self.validator.evaluate(request, &result);
                    self.record(partition, tier.kind(), report.overall_quality(), actual_cost);
                    attempts.push(Attempt {
                        tier: tier.kind(),
                        result,
                        report: report.clone(),
                        cost: actual_cost,
                    });

                    if report.overall_quality() >= request.quality_target {
                        break;
                    }
                }
                Err(CoreError::DeadlineExceeded) => {
                    flags.push("deadline_exceeded".to_string());
                    break;
                }
                Err(_) => {
                    self.record(partition, tier.kind(), 0.0, tier.expected_cost());
                    ledger.charge(tier.expected_cost());
                }
            }

            let current_kind = tier.kind();
            match self.next_higher_tier_within_budget(current_kind, ledger.remaining()) {
                Some(next) => tier = next,
                None => break,
            }
        }

        if attempts.is_empty() {
            return Err(CoreError::BudgetExhausted);
        }

        let best_quality = attempts
            .iter()
            .map(|a| a.report.overall_quality())
            .fold(f64::NEG_INFINITY, f64::max);

        if best_quality < request.quality_target {
            if self.config.ensemble_enabled && attempts.len() >= 2 {
                if let Some(ensemble_tier) = self.tiers.iter().find(|t| t.kind() == ModelTierKind::Ensemble) {
                    if ledger.can_afford(ensemble_tier.expected_cost()) {
                        if let Ok((result, cost)) = self
                            .invoke_with_retry(ensemble_tier, request, request.deadline)
                            .await
                        {
                            ledger.charge(cost);
                            let report = self.validator.evaluate(request, &result);
                            self.record(partition, ModelTierKind::Ensemble, report.overall_quality(), cost);
                            let quality = report.overall_quality();
                            attempts.push(Attempt {
                                tier: ModelTierKind::Ensemble,
                                result,
                                report,
                                cost,
                            });
                            if quality < request.quality_target {
                                flags.push("quality_shortfall".to_string());
                            }
                        }
                    } else {
                        flags.push("quality_shortfall".to_string());
                    }
                } else {
                    flags.push("quality_shortfall".to_string());
                }
            } else {
                flags.push("quality_shortfall".to_string());
            }
        }

        let best = attempts
            .into_iter()
            .max_by(|a, b| a.report.overall_quality().partial_cmp(&b.report.overall_quality()).unwrap())
            .expect("attempts is non-empty");

        let mut all_flags = best.report.flags.iter().cloned().collect::<Vec<_>>();
        all_flags.extend(flags);

        Ok(VoitOutcome {
            result: best.result,
            report: best.report,
            tier_used: best.tier,
            cost_actual: best.cost,
            flags: all_flags,
        })
    }
}
