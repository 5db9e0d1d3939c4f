//! Time windows and incremental per-window statistics.
//!
//! A `MetricsWindow` accumulates online statistics as events arrive in its
//! time range, then is closed exactly once and handed to detection. Mean
//! and variance come from Welford's single-pass update, so they are
//! available in O(1) at any time without replaying raw values.

pub mod aggregator;
pub mod reservoir;

pub use aggregator::{IngestOutcome, StreamAggregator};
pub use reservoir::{PercentileEstimates, Reservoir};

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling,
    Sliding,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Tumbling => "tumbling",
            WindowKind::Sliding => "sliding",
        }
    }
}

/// One window's accumulated statistics for a single metric key.
///
/// Invariants: `window_start < window_end`; after the first observation
/// `mean == sum / count` within floating-point tolerance; `m2 / count` is
/// the population variance of the folded values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub metric_key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub kind: WindowKind,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    mean: f64,
    /// Welford's sum of squared deviations from the running mean.
    m2: f64,
    pub percentiles: Option<PercentileEstimates>,
    #[serde(skip, default = "Reservoir::disabled")]
    reservoir: Reservoir,
}

impl MetricsWindow {
    pub fn new(
        metric_key: &str,
        window_start: i64,
        window_end: i64,
        kind: WindowKind,
        reservoir_capacity: usize,
    ) -> Self {
        debug_assert!(window_start < window_end);
        let seed = reservoir_seed(metric_key, window_start, kind);
        Self {
            metric_key: metric_key.to_string(),
            window_start,
            window_end,
            kind,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            percentiles: None,
            reservoir: Reservoir::new(reservoir_capacity, seed),
        }
    }

    /// Rebuild a closed window from persisted parts.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        metric_key: String,
        window_start: i64,
        window_end: i64,
        kind: WindowKind,
        count: u64,
        sum: f64,
        mean: f64,
        m2: f64,
        min: f64,
        max: f64,
        percentiles: Option<PercentileEstimates>,
    ) -> Self {
        Self {
            metric_key,
            window_start,
            window_end,
            kind,
            count,
            sum,
            min,
            max,
            mean,
            m2,
            percentiles,
            reservoir: Reservoir::disabled(),
        }
    }

    /// Fold one value into the window (Welford update).
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.reservoir.push(value);
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.window_start && timestamp < self.window_end
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance of the folded values.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn sum_sq(&self) -> f64 {
        self.m2 + self.count as f64 * self.mean * self.mean
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Freeze percentile estimates. Called once when the window closes;
    /// the window is immutable from then on.
    pub fn close(&mut self) {
        if self.percentiles.is_none() {
            self.percentiles = self.reservoir.estimates();
        }
    }
}

/// Deterministic per-window seed so replays reproduce percentile estimates.
fn reservoir_seed(metric_key: &str, window_start: i64, kind: WindowKind) -> u64 {
    let mut hasher = DefaultHasher::new();
    metric_key.hash(&mut hasher);
    window_start.hash(&mut hasher);
    kind.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> MetricsWindow {
        MetricsWindow::new("cpu.load", 0, 60_000, WindowKind::Tumbling, 256)
    }

    #[test]
    fn online_mean_matches_batch_mean() {
        let values: Vec<f64> = (0..500).map(|i| 10.0 + ((i * 7919) % 13) as f64 * 0.1).collect();
        let mut w = window();
        for &v in &values {
            w.observe(v);
        }
        let batch_mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!((w.mean() - batch_mean).abs() < 1e-9);
        assert!((w.sum / w.count as f64 - batch_mean).abs() < 1e-9);
    }

    #[test]
    fn online_variance_matches_two_pass() {
        let values: Vec<f64> = (0..200).map(|i| (i as f64).sin() * 5.0 + 10.0).collect();
        let mut w = window();
        for &v in &values {
            w.observe(v);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let two_pass = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        assert!((w.variance() - two_pass).abs() < 1e-9);
    }

    #[test]
    fn tracks_min_max() {
        let mut w = window();
        for v in [4.0, -2.0, 9.5, 3.0] {
            w.observe(v);
        }
        assert_eq!(w.min, -2.0);
        assert_eq!(w.max, 9.5);
        assert_eq!(w.count, 4);
    }

    #[test]
    fn close_freezes_percentiles() {
        let mut w = window();
        for v in 1..=100 {
            w.observe(v as f64);
        }
        w.close();
        let p = w.percentiles.unwrap();
        assert_eq!(p.p50, 51.0);
        // Closing twice keeps the first estimates.
        w.close();
        assert_eq!(w.percentiles.unwrap(), p);
    }

    #[test]
    fn contains_is_half_open() {
        let w = window();
        assert!(w.contains(0));
        assert!(w.contains(59_999));
        assert!(!w.contains(60_000));
        assert!(!w.contains(-1));
    }
}
