//! Bounded-memory percentile estimation via uniform reservoir sampling.
//!
//! Algorithm R: the first `capacity` values are kept verbatim; the i-th
//! value thereafter replaces a random slot with probability capacity/i.
//! The reservoir is a uniform sample of everything seen, so the p-th
//! percentile of the sample estimates the true percentile with rank
//! standard error `sqrt(p * (1 - p) / capacity)` -- at the default
//! capacity of 256 that is at most ~3.2 percentage points of rank.
//!
//! The RNG is seeded from the owning window's identity, so replaying the
//! same events yields the same estimates.

use crate::analysis::percentile_sorted;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<f64>,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity.min(1024)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Zero-capacity placeholder for windows rehydrated from storage,
    /// which already carry their final percentile estimates.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn push(&mut self, value: f64) {
        self.seen += 1;
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let j = self.rng.gen_range(0..self.seen);
            if (j as usize) < self.capacity {
                self.samples[j as usize] = value;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Estimate the p-th percentile (p in [0, 100]) from the sample.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("non-finite value in reservoir"));
        percentile_sorted(&sorted, p)
    }

    /// Snapshot the standard estimates for a closing window.
    pub fn estimates(&self) -> Option<PercentileEstimates> {
        Some(PercentileEstimates {
            p50: self.percentile(50.0)?,
            p95: self.percentile(95.0)?,
            p99: self.percentile(99.0)?,
        })
    }
}

/// Percentile estimates frozen at window close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileEstimates {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}
