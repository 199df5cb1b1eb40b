//! Structured telemetry emission. Mirrors the reference orchestrator's
//! monitoring module (typed event structs, `Arc<RwLock<...>>` aggregation)
//! but scoped to the pipeline's own decision/cost/quality events rather than
//! host resource metrics.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{Decision, ModelTierKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub partition_key: String,
    pub decision: Decision,
    pub similarity: Option<f64>,
    pub nonconformity: Option<f64>,
    pub risk_bound: f64,
    pub tier_used: Option<ModelTierKind>,
    pub cost_actual: f64,
    pub cost_saved: Option<f64>,
    pub quality: Option<f64>,
    pub flags: Vec<String>,
}

/// Non-blocking, at-least-once sink for telemetry events (spec.md §6).
/// Implementations must not block the caller on slow downstream delivery —
/// the default sink below just logs and buffers in memory.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn emit(&self, event: TelemetryEvent);
}

/// Default sink: logs every event through `tracing` and keeps a bounded
/// ring of recent events for inspection/testing, the way the reference
/// monitoring module keeps a bounded `Vec<SystemMetrics>` history.
pub struct TracingTelemetrySink {
    history: RwLock<VecDeque<TelemetryEvent>>,
    capacity: usize,
}

impl TracingTelemetrySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn recent(&self) -> Vec<TelemetryEvent> {
        self.history.read().iter().cloned().collect()
    }
}

impl Default for TracingTelemetrySink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl TelemetrySink for TracingTelemetrySink {
    async fn emit(&self, event: TelemetryEvent) {
        tracing::info!(
            partition = %event.partition_key,
            decision = ?event.decision,
            tier_used = ?event.tier_used,
            cost_actual = event.cost_actual,
            quality = ?event.quality,
            flags = ?event.flags,
            "extraction pipeline event"
        );

        let mut history = self.history.write();
        history.push_back(event);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }
}

/// Sink that drops every event. Useful for callers who only want `tracing`
/// output, or for tests that don't care about telemetry history.
pub struct NullTelemetrySink;

#[async_trait]
impl TelemetrySink for NullTelemetrySink {
    async fn emit(&self, _event: TelemetryEvent) {}
}

pub fn default_sink() -> Arc<dyn TelemetrySink> {
    Arc::new(TracingTelemetrySink::default())
}
