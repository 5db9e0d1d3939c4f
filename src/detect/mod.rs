//! Anomaly detection -- per-method verdicts and the ensemble result.

pub mod ensemble;
pub mod methods;

pub use ensemble::Ensemble;
pub use methods::{build_detectors, Detector};

use crate::analysis::Trend;
use crate::config::MethodKind;
use serde::{Deserialize, Serialize};

/// Severity bands derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            Severity::High
        } else if score > 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// One method's opinion on a closed window.
///
/// `weight == 0.0` marks an abstention: the method had no opinion (cold
/// start, missing parameters, or an internal failure) and is excluded
/// from the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub method: MethodKind,
    pub is_anomaly: bool,
    /// Normalized to [0, 1] so weights are comparable across methods.
    pub score: f64,
    pub weight: f64,
    pub reason: String,
}

impl DetectorVerdict {
    pub fn abstain(method: MethodKind, reason: impl Into<String>) -> Self {
        Self {
            method,
            is_anomaly: false,
            score: 0.0,
            weight: 0.0,
            reason: reason.into(),
        }
    }

    pub fn is_abstention(&self) -> bool {
        self.weight == 0.0
    }
}

/// The ensemble's decision for one closed window. Created once, then
/// immutable. Deliberately carries no wall-clock field so that identical
/// inputs always produce an identical result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub metric_key: String,
    pub window_start: i64,
    pub window_end: i64,
    /// Weighted mean of non-abstaining scores, in [0, 1].
    pub composite_score: f64,
    /// True iff `composite_score >= decision_threshold`.
    pub verdict: bool,
    pub severity: Severity,
    /// Trend over the historical window means, when enough history exists.
    pub trend: Option<Trend>,
    /// Per-method verdicts in configuration order, abstentions included.
    pub contributing_methods: Vec<DetectorVerdict>,
}
