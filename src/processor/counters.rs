//! Engine-wide monotonic counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, updated lock-free from every lane and the writer.
#[derive(Debug, Default)]
pub struct Counters {
    pub events_ingested: AtomicU64,
    pub events_rejected: AtomicU64,
    pub late_events: AtomicU64,
    pub dropped_events: AtomicU64,
    pub windows_closed: AtomicU64,
    pub abstentions: AtomicU64,
    pub results_emitted: AtomicU64,
    pub storage_retries: AtomicU64,
    pub storage_failures: AtomicU64,
}

/// Point-in-time copy for reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub events_ingested: u64,
    pub events_rejected: u64,
    pub late_events: u64,
    pub dropped_events: u64,
    pub windows_closed: u64,
    pub abstentions: u64,
    pub results_emitted: u64,
    pub storage_retries: u64,
    pub storage_failures: u64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            abstentions: self.abstentions.load(Ordering::Relaxed),
            results_emitted: self.results_emitted.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }
}
