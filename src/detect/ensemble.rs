//! Weighted-majority ensemble over the configured detection methods.
//!
//! Each enabled method votes with a normalized score; the composite is
//! the weighted mean over the methods that did not abstain, with weights
//! renormalized to sum to 1 over that active subset. Detection is
//! deterministic: identical window + history + config always produce an
//! identical result.

use crate::analysis::detect_trend;
use crate::config::EngineConfig;
use crate::detect::methods::{build_detectors, Detector};
use crate::detect::{AnomalyResult, DetectorVerdict, Severity};
use crate::window::MetricsWindow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

pub struct Ensemble {
    detectors: Vec<Box<dyn Detector>>,
    decision_threshold: f64,
}

impl Ensemble {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            detectors: build_detectors(config),
            decision_threshold: config.decision_threshold,
        }
    }

    /// For tests and custom method sets.
    pub fn new(detectors: Vec<Box<dyn Detector>>, decision_threshold: f64) -> Self {
        Self {
            detectors,
            decision_threshold,
        }
    }

    /// Run every enabled method against a closed window and combine the
    /// verdicts. A panicking method is isolated and treated as an
    /// abstention so one broken detector never suppresses the result.
    pub fn detect(&self, window: &MetricsWindow, history: &[MetricsWindow]) -> AnomalyResult {
        let verdicts: Vec<DetectorVerdict> = self
            .detectors
            .iter()
            .map(|d| {
                catch_unwind(AssertUnwindSafe(|| d.evaluate(window, history))).unwrap_or_else(
                    |_| {
                        warn!(
                            method = %d.method(),
                            metric_key = %window.metric_key,
                            window_start = window.window_start,
                            "detector panicked; treating as abstention"
                        );
                        DetectorVerdict::abstain(d.method(), "method failed")
                    },
                )
            })
            .collect();

        let active_weight: f64 = verdicts.iter().map(|v| v.weight).sum();
        let composite_score = if active_weight > 0.0 {
            verdicts
                .iter()
                .map(|v| v.weight * v.score)
                .sum::<f64>()
                / active_weight
        } else {
            0.0
        };
        let composite_score = composite_score.clamp(0.0, 1.0);

        let means: Vec<f64> = history.iter().map(MetricsWindow::mean).collect();
        let trend = detect_trend(&means);

        AnomalyResult {
            metric_key: window.metric_key.clone(),
            window_start: window.window_start,
            window_end: window.window_end,
            composite_score,
            verdict: composite_score >= self.decision_threshold,
            severity: Severity::from_score(composite_score),
            trend,
            contributing_methods: verdicts,
        }
    }
}
