//! Batch statistics over small slices -- descriptive summaries, linear
//! regression, and trend classification over window-mean history.

use serde::{Deserialize, Serialize};

/// Descriptive statistics for a batch of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptive {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
}

/// Compute descriptive statistics. Returns `None` for an empty slice.
pub fn describe(values: &[f64]) -> Option<Descriptive> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("non-finite value in stats input"));

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    let q1 = sorted[n / 4];
    let q3 = sorted[((3 * n) / 4).min(n - 1)];

    Some(Descriptive {
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median,
        variance,
        std_dev: variance.sqrt(),
        q1,
        q3,
        iqr: q3 - q1,
    })
}

/// p-th percentile (p in [0, 100]) of an already-sorted slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64) as usize;
    Some(sorted[rank.min(sorted.len() - 1)])
}

/// Least-squares fit. Returns (slope, intercept, r_squared); all zero when
/// the fit is degenerate (fewer than 2 points or no x variance).
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> (f64, f64, f64) {
    if xs.len() != ys.len() || xs.len() < 2 {
        return (0.0, 0.0, 0.0);
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let numerator: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let denominator: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if denominator == 0.0 {
        return (0.0, 0.0, 0.0);
    }

    let slope = numerator / denominator;
    let intercept = mean_y - slope * mean_x;

    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let r_squared = if ss_tot != 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    (slope, intercept, r_squared)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendKind {
    Increasing,
    Decreasing,
    Stable,
}

/// Trend over a sequence of window means, ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub kind: TrendKind,
    pub slope: f64,
    pub r_squared: f64,
    /// Absolute slope normalized by the value scale, clamped to [0, 1].
    pub strength: f64,
}

/// Classify the trend of a metric's window means. Needs at least 3 points.
pub fn detect_trend(values: &[f64]) -> Option<Trend> {
    if values.len() < 3 {
        return None;
    }
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let (slope, _, r_squared) = linear_regression(&xs, values);

    let kind = if slope.abs() < 0.01 {
        TrendKind::Stable
    } else if slope > 0.0 {
        TrendKind::Increasing
    } else {
        TrendKind::Decreasing
    };

    let scale = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max).abs().max(1.0);
    let strength = (slope.abs() / scale).min(1.0);

    Some(Trend {
        kind,
        slope,
        r_squared,
        strength,
    })
}
