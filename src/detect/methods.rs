//! The individual detection methods.
//!
//! Every method implements [`Detector`]: evaluate one closed window
//! against a bounded trailing history of closed windows for the same key,
//! returning a verdict with a score normalized to [0, 1]. New methods are
//! added by implementing the trait, not by touching the ensemble.
//!
//! A method with insufficient history abstains instead of erroring, so
//! the ensemble stays robust during cold start.

use crate::analysis::describe;
use crate::config::{DetectorConfig, EngineConfig, MethodKind};
use crate::detect::DetectorVerdict;
use crate::window::MetricsWindow;

pub trait Detector: Send + Sync {
    fn method(&self) -> MethodKind;

    /// `history` is ordered oldest first and never contains `window`.
    fn evaluate(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> DetectorVerdict;
}

/// Instantiate the configured ensemble members in configuration order.
pub fn build_detectors(config: &EngineConfig) -> Vec<Box<dyn Detector>> {
    config
        .detectors
        .iter()
        .map(|d| -> Box<dyn Detector> {
            match d.method {
                MethodKind::Zscore => Box::new(ZScoreDetector::new(d, config.min_history)),
                MethodKind::Iqr => Box::new(IqrDetector::new(d, config.min_history)),
                MethodKind::DensityRatio => {
                    Box::new(DensityRatioDetector::new(d, config.min_history))
                }
                MethodKind::Changepoint => {
                    Box::new(ChangepointDetector::new(d, config.min_history))
                }
                MethodKind::Threshold => Box::new(ThresholdDetector::new(d)),
            }
        })
        .collect()
}

fn historical_means(history: &[MetricsWindow]) -> Vec<f64> {
    history.iter().map(MetricsWindow::mean).collect()
}

fn short_history(method: MethodKind, have: usize, need: usize) -> DetectorVerdict {
    DetectorVerdict::abstain(
        method,
        format!("insufficient history: have {have}, need {need}"),
    )
}

// ── Z-score ──────────────────────────────────────────────────────────

/// Flags windows whose mean deviates from the historical mean by more
/// than `z_threshold` standard deviations. A constant baseline (stddev 0)
/// treats any nonzero deviation as maximal rather than dividing by zero.
pub struct ZScoreDetector {
    weight: f64,
    z_threshold: f64,
    min_history: usize,
}

impl ZScoreDetector {
    pub fn new(config: &DetectorConfig, min_history: usize) -> Self {
        Self {
            weight: config.weight,
            z_threshold: config.params.z_threshold,
            min_history,
        }
    }
}

impl Detector for ZScoreDetector {
    fn method(&self) -> MethodKind {
        MethodKind::Zscore
    }

    fn evaluate(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> DetectorVerdict {
        let means = historical_means(history);
        if means.len() < self.min_history {
            return short_history(self.method(), means.len(), self.min_history);
        }
        let stats = describe(&means).expect("history is non-empty");
        let current = window.mean();

        if stats.std_dev <= f64::EPSILON {
            let deviates = (current - stats.mean).abs() > f64::EPSILON;
            return DetectorVerdict {
                method: self.method(),
                is_anomaly: deviates,
                score: if deviates { 1.0 } else { 0.0 },
                weight: self.weight,
                reason: format!(
                    "constant baseline {:.4}; current mean {:.4}",
                    stats.mean, current
                ),
            };
        }

        let z = (current - stats.mean) / stats.std_dev;
        DetectorVerdict {
            method: self.method(),
            is_anomaly: z.abs() > self.z_threshold,
            score: (z.abs() / 5.0).min(1.0),
            weight: self.weight,
            reason: format!(
                "z-score {:.2} vs baseline mean {:.4} (threshold {})",
                z, stats.mean, self.z_threshold
            ),
        }
    }
}

// ── IQR fencing ──────────────────────────────────────────────────────

/// Flags windows whose mean falls outside `[Q1 - k*IQR, Q3 + k*IQR]`
/// computed over the historical window means.
pub struct IqrDetector {
    weight: f64,
    multiplier: f64,
    min_history: usize,
}

impl IqrDetector {
    pub fn new(config: &DetectorConfig, min_history: usize) -> Self {
        Self {
            weight: config.weight,
            multiplier: config.params.iqr_multiplier,
            // Quartiles are meaningless below 4 samples.
            min_history: min_history.max(4),
        }
    }
}

impl Detector for IqrDetector {
    fn method(&self) -> MethodKind {
        MethodKind::Iqr
    }

    fn evaluate(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> DetectorVerdict {
        let means = historical_means(history);
        if means.len() < self.min_history {
            return short_history(self.method(), means.len(), self.min_history);
        }
        let stats = describe(&means).expect("history is non-empty");
        let lower = stats.q1 - self.multiplier * stats.iqr;
        let upper = stats.q3 + self.multiplier * stats.iqr;
        let current = window.mean();

        if current < lower || current > upper {
            let distance = if current < lower {
                lower - current
            } else {
                current - upper
            };
            let score = (distance / stats.iqr.max(0.1) / 5.0).min(1.0);
            DetectorVerdict {
                method: self.method(),
                is_anomaly: true,
                score,
                weight: self.weight,
                reason: format!("mean {current:.4} outside fences [{lower:.4}, {upper:.4}]"),
            }
        } else {
            DetectorVerdict {
                method: self.method(),
                is_anomaly: false,
                score: 0.0,
                weight: self.weight,
                reason: format!("mean {current:.4} within fences [{lower:.4}, {upper:.4}]"),
            }
        }
    }
}

// ── Density ratio ────────────────────────────────────────────────────

/// Lightweight isolation-style method: compares the current window mean's
/// nearest-neighbor distance against the typical nearest-neighbor
/// distance within the history. A point far from everywhere the metric
/// has recently been scores high. No model, no training.
pub struct DensityRatioDetector {
    weight: f64,
    neighbors: usize,
    density_threshold: f64,
    min_history: usize,
}

impl DensityRatioDetector {
    pub fn new(config: &DetectorConfig, min_history: usize) -> Self {
        let neighbors = config.params.neighbors.max(1);
        Self {
            weight: config.weight,
            neighbors,
            density_threshold: config.params.density_threshold,
            min_history: min_history.max(neighbors + 1),
        }
    }

    /// Mean distance from `point` to its k nearest values in `others`.
    fn knn_distance(&self, point: f64, others: &[f64]) -> f64 {
        let mut distances: Vec<f64> = others.iter().map(|v| (point - v).abs()).collect();
        distances.sort_by(|a, b| a.partial_cmp(b).expect("non-finite distance"));
        let k = self.neighbors.min(distances.len());
        distances[..k].iter().sum::<f64>() / k as f64
    }
}

impl Detector for DensityRatioDetector {
    fn method(&self) -> MethodKind {
        MethodKind::DensityRatio
    }

    fn evaluate(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> DetectorVerdict {
        let means = historical_means(history);
        if means.len() < self.min_history {
            return short_history(self.method(), means.len(), self.min_history);
        }
        let current = window.mean();
        let current_distance = self.knn_distance(current, &means);

        // Typical neighborhood size: median of each historical point's
        // own kNN distance to the rest of the history.
        let mut typicals: Vec<f64> = (0..means.len())
            .map(|i| {
                let others: Vec<f64> = means
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, v)| *v)
                    .collect();
                self.knn_distance(means[i], &others)
            })
            .collect();
        typicals.sort_by(|a, b| a.partial_cmp(b).expect("non-finite distance"));
        let typical = typicals[typicals.len() / 2];

        if typical <= f64::EPSILON {
            // Degenerate history: all means identical.
            let isolated = current_distance > f64::EPSILON;
            return DetectorVerdict {
                method: self.method(),
                is_anomaly: isolated,
                score: if isolated { 1.0 } else { 0.0 },
                weight: self.weight,
                reason: format!(
                    "degenerate history; current mean {current:.4} at distance {current_distance:.4}"
                ),
            };
        }

        let ratio = current_distance / typical;
        DetectorVerdict {
            method: self.method(),
            is_anomaly: ratio > self.density_threshold,
            score: (ratio / 5.0).min(1.0),
            weight: self.weight,
            reason: format!(
                "density ratio {:.2} (threshold {})",
                ratio, self.density_threshold
            ),
        }
    }
}

// ── Changepoint ──────────────────────────────────────────────────────

/// Flags level shifts: the current window mean against the average of
/// the trailing `change_window` window means. A shift larger than
/// `change_threshold` relative to that baseline is a changepoint.
/// Abstains when the baseline is zero, where relative change is
/// undefined.
pub struct ChangepointDetector {
    weight: f64,
    change_threshold: f64,
    change_window: usize,
    min_history: usize,
}

impl ChangepointDetector {
    pub fn new(config: &DetectorConfig, min_history: usize) -> Self {
        Self {
            weight: config.weight,
            change_threshold: config.params.change_threshold,
            change_window: config.params.change_window.max(1),
            min_history,
        }
    }
}

impl Detector for ChangepointDetector {
    fn method(&self) -> MethodKind {
        MethodKind::Changepoint
    }

    fn evaluate(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> DetectorVerdict {
        let means = historical_means(history);
        if means.len() < self.min_history {
            return short_history(self.method(), means.len(), self.min_history);
        }
        let tail = &means[means.len().saturating_sub(self.change_window)..];
        let baseline = tail.iter().sum::<f64>() / tail.len() as f64;

        if baseline.abs() <= f64::EPSILON {
            return DetectorVerdict::abstain(self.method(), "zero baseline");
        }

        let current = window.mean();
        let relative_change = ((current - baseline) / baseline).abs();
        DetectorVerdict {
            method: self.method(),
            is_anomaly: relative_change > self.change_threshold,
            score: relative_change.min(1.0),
            weight: self.weight,
            reason: format!(
                "relative change {:.2} from baseline {:.4} (threshold {})",
                relative_change, baseline, self.change_threshold
            ),
        }
    }
}

// ── Absolute thresholds ──────────────────────────────────────────────

/// Flags window means outside configured absolute bounds. Abstains when
/// no bounds are configured; needs no history.
pub struct ThresholdDetector {
    weight: f64,
    min_value: Option<f64>,
    max_value: Option<f64>,
}

impl ThresholdDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            weight: config.weight,
            min_value: config.params.min_value,
            max_value: config.params.max_value,
        }
    }
}

impl Detector for ThresholdDetector {
    fn method(&self) -> MethodKind {
        MethodKind::Threshold
    }

    fn evaluate(&self, window: &MetricsWindow, _history: &[MetricsWindow]) -> DetectorVerdict {
        if self.min_value.is_none() && self.max_value.is_none() {
            return DetectorVerdict::abstain(self.method(), "no bounds configured");
        }
        let current = window.mean();

        if let Some(min) = self.min_value {
            if current < min {
                return DetectorVerdict {
                    method: self.method(),
                    is_anomaly: true,
                    score: 1.0,
                    weight: self.weight,
                    reason: format!("mean {current:.4} below minimum {min}"),
                };
            }
        }
        if let Some(max) = self.max_value {
            if current > max {
                return DetectorVerdict {
                    method: self.method(),
                    is_anomaly: true,
                    score: 1.0,
                    weight: self.weight,
                    reason: format!("mean {current:.4} above maximum {max}"),
                };
            }
        }
        DetectorVerdict {
            method: self.method(),
            is_anomaly: false,
            score: 0.0,
            weight: self.weight,
            reason: "within configured bounds".to_string(),
        }
    }
}
