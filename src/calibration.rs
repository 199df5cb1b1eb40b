//! Rolling log of nonconformity scores per partition, used to derive the
//! empirical (1−δ)-quantile threshold τ that C³ compares against (spec.md
//! §4.4). Grounded on the same bounded-window-behind-a-lock shape as
//! `telemetry.rs`'s history ring, scoped per partition via `DashMap`.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::CalibrationSample;

#[async_trait]
pub trait CalibrationLog: Send + Sync {
    /// Appends a sample to the partition's rolling window, evicting the
    /// oldest sample if the window is at capacity.
    async fn append(&self, partition: &str, sample: CalibrationSample) -> Result<()>;

    /// Finite-sample-corrected (1−δ)-quantile of the nonconformity scores
    /// currently in the partition's window. Returns `f64::NEG_INFINITY`
    /// when the window holds fewer than `n_min` samples — conformal
    /// guarantees don't hold below that size, so C³ must never reuse on an
    /// unconditional threshold.
    async fn quantile(&self, partition: &str, delta: f64, n_min: usize) -> Result<f64>;

    async fn window_size(&self, partition: &str) -> Result<usize>;
}

pub struct InMemoryCalibrationLog {
    windows: DashMap<String, Mutex<VecDeque<f64>>>,
    capacity: usize,
}

impl InMemoryCalibrationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            capacity,
        }
    }
}

#[async_trait]
impl CalibrationLog for InMemoryCalibrationLog {
    async fn append(&self, partition: &str, sample: CalibrationSample) -> Result<()> {
        let window = self
            .windows
            .entry(partition.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.capacity)));
        let mut guard = window.lock();
        guard.push_back(sample.nonconformity_score);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        Ok(())
    }

    async fn quantile(&self, partition: &str, delta: f64, n_min: usize) -> Result<f64> {
        let Some(window) = self.windows.get(partition) else {
            return Ok(f64::NEG_INFINITY);
        };
        let guard = window.lock();
        let n = guard.len();
        if n < n_min {
            return Ok(f64::NEG_INFINITY);
        }

        let mut scores: Vec<f64> = guard.iter().copied().collect();
        drop(guard);
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let rank = (((n + 1) as f64) * (1.0 - delta)).ceil() as usize;
        let rank = rank.clamp(1, n);
        Ok(scores[rank - 1])
    }

    async fn window_size(&self, partition: &str) -> Result<usize> {
        Ok(self
            .windows
            .get(partition)
            .map(|w| w.lock().len())
            .unwrap_or(0))
    }
}
