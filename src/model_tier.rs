//! Pluggable model tiers (nano/mini/full/ensemble), the trait boundary VoIT
//! escalates and degrades across (spec.md §4.6). Shape mirrors the
//! reference orchestrator's `Agent` trait — a capability descriptor plus a
//! single fallible async entry point — generalized from "can this agent
//! handle this task" to "what does this tier cost and how good is it."

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ExtractionRequest, ExtractionResult, ModelTierKind};

#[async_trait]
pub trait ModelTier: Send + Sync {
    fn kind(&self) -> ModelTierKind;

    /// Expected per-call cost in the pipeline's budget unit. A static
    /// estimate, not a measurement of the specific request.
    fn expected_cost(&self) -> f64;

    /// Prior belief about this tier's output quality, before any
    /// partition-specific EWMA adjustment is applied by VoIT.
    fn expected_quality(&self) -> f64;

    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResult>;
}

/// Running per-partition, per-tier statistics VoIT uses to adjust its
/// priors over time (spec.md §4.6 EWMA updates). Held behind a lock by the
/// caller; this struct itself carries no synchronization.
#[derive(Debug, Clone, Copy)]
pub struct TierStats {
    pub ewma_quality: f64,
    pub ewma_cost: f64,
    pub samples: u64,
}

impl TierStats {
    pub fn new(initial_quality: f64, initial_cost: f64) -> Self {
        Self {
            ewma_quality: initial_quality,
            ewma_cost: initial_cost,
            samples: 0,
        }
    }

    pub fn update(&mut self, alpha: f64, observed_quality: f64, observed_cost: f64) {
        self.ewma_quality = alpha * observed_quality + (1.0 - alpha) * self.ewma_quality;
        self.ewma_cost = alpha * observed_cost + (1.0 - alpha) * self.ewma_cost;
        self.samples += 1;
    }
}
