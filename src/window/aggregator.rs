//! Per-key open-window bookkeeping.
//!
//! The aggregator owns every open window for its subset of metric keys.
//! Tumbling windows never overlap for a key; sliding windows overlap by
//! design and are updated independently from the same event. Closure is
//! watermark-based per kind: once a window is closed, later events for
//! its range are late for that kind and never merged back. An event
//! whose tumbling window already closed still folds into any sliding
//! windows covering its timestamp that remain open.

use crate::event::EnrichedEvent;
use crate::window::{MetricsWindow, WindowKind};
use std::collections::{BTreeMap, HashMap};

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// The event's tumbling window was already closed. It is dropped
    /// from the tumbling stream but still counted into any sliding
    /// windows that are open over its timestamp.
    Late,
}

pub struct StreamAggregator {
    window_size_ms: i64,
    slide_interval_ms: i64,
    grace_period_ms: i64,
    reservoir_capacity: usize,
    /// key -> window_start -> open window, per kind.
    tumbling: HashMap<String, BTreeMap<i64, MetricsWindow>>,
    sliding: HashMap<String, BTreeMap<i64, MetricsWindow>>,
    /// Highest closed window_end per key per kind.
    tumbling_watermark: HashMap<String, i64>,
    sliding_watermark: HashMap<String, i64>,
}

impl StreamAggregator {
    pub fn new(
        window_size_ms: i64,
        slide_interval_ms: i64,
        grace_period_ms: i64,
        reservoir_capacity: usize,
    ) -> Self {
        Self {
            window_size_ms,
            slide_interval_ms,
            grace_period_ms,
            reservoir_capacity,
            tumbling: HashMap::new(),
            sliding: HashMap::new(),
            tumbling_watermark: HashMap::new(),
            sliding_watermark: HashMap::new(),
        }
    }

    /// Fold an enriched event into its tumbling window and every sliding
    /// window covering its timestamp.
    pub fn ingest(&mut self, ev: &EnrichedEvent) -> IngestOutcome {
        let late = self
            .tumbling_watermark
            .get(&ev.metric_key)
            .is_some_and(|&wm| ev.timestamp < wm);

        if !late {
            let start = ev.window_bucket_start;
            let end = start + self.window_size_ms;
            self.tumbling
                .entry(ev.metric_key.clone())
                .or_default()
                .entry(start)
                .or_insert_with(|| {
                    MetricsWindow::new(
                        &ev.metric_key,
                        start,
                        end,
                        WindowKind::Tumbling,
                        self.reservoir_capacity,
                    )
                })
                .observe(ev.value);
        }

        // Sliding windows have their own watermark; ingest_sliding skips
        // only the ones already closed.
        if self.slide_interval_ms > 0 {
            self.ingest_sliding(ev);
        }

        if late {
            IngestOutcome::Late
        } else {
            IngestOutcome::Accepted
        }
    }

    fn ingest_sliding(&mut self, ev: &EnrichedEvent) {
        let slide = self.slide_interval_ms;
        let size = self.window_size_ms;
        let wm = self.sliding_watermark.get(&ev.metric_key).copied();

        // All slide-aligned starts s with s <= ts < s + size.
        let first = (ev.timestamp - size).div_euclid(slide) * slide + slide;
        let last = ev.timestamp.div_euclid(slide) * slide;

        let windows = self.sliding.entry(ev.metric_key.clone()).or_default();
        let mut start = first;
        while start <= last {
            let end = start + size;
            // Skip sliding windows that already closed.
            if wm.map_or(true, |wm| end > wm) {
                windows
                    .entry(start)
                    .or_insert_with(|| {
                        MetricsWindow::new(
                            &ev.metric_key,
                            start,
                            end,
                            WindowKind::Sliding,
                            self.reservoir_capacity,
                        )
                    })
                    .observe(ev.value);
            }
            start += slide;
        }
    }

    /// Close and return every window whose end has passed the grace
    /// period, ascending by window_start. Each window is returned once.
    pub fn close_due(&mut self, now_ms: i64) -> Vec<MetricsWindow> {
        self.close_at_cutoff(now_ms.saturating_sub(self.grace_period_ms))
    }

    fn close_at_cutoff(&mut self, cutoff: i64) -> Vec<MetricsWindow> {
        let mut closed = Vec::new();

        Self::drain_due(&mut self.tumbling, &mut self.tumbling_watermark, cutoff, &mut closed);
        Self::drain_due(&mut self.sliding, &mut self.sliding_watermark, cutoff, &mut closed);

        closed.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.metric_key.cmp(&b.metric_key))
        });
        closed
    }

    fn drain_due(
        windows: &mut HashMap<String, BTreeMap<i64, MetricsWindow>>,
        watermarks: &mut HashMap<String, i64>,
        cutoff: i64,
        closed: &mut Vec<MetricsWindow>,
    ) {
        for (key, per_key) in windows.iter_mut() {
            let due: Vec<i64> = per_key
                .iter()
                .take_while(|(_, w)| w.window_end <= cutoff)
                .map(|(&s, _)| s)
                .collect();
            for start in due {
                let mut w = per_key.remove(&start).expect("due window vanished");
                w.close();
                let wm = watermarks.entry(key.clone()).or_insert(i64::MIN);
                if w.window_end > *wm {
                    *wm = w.window_end;
                }
                closed.push(w);
            }
        }
        windows.retain(|_, per_key| !per_key.is_empty());
    }

    /// Drain-time closure: ignores the grace period and returns every
    /// still-open window, ascending by window_start.
    pub fn force_close_all(&mut self) -> Vec<MetricsWindow> {
        self.close_at_cutoff(i64::MAX)
    }

    pub fn open_window_count(&self) -> usize {
        self.tumbling.values().map(BTreeMap::len).sum::<usize>()
            + self.sliding.values().map(BTreeMap::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{enrich, RawEvent};
    use std::collections::BTreeMap as Tags;

    const SIZE: i64 = 60_000;
    const SLIDE: i64 = 20_000;
    const GRACE: i64 = 5_000;

    fn agg() -> StreamAggregator {
        StreamAggregator::new(SIZE, SLIDE, GRACE, 64)
    }

    fn ev(key: &str, ts: i64, value: f64) -> crate::event::EnrichedEvent {
        enrich(
            RawEvent {
                id: None,
                metric_key: key.to_string(),
                timestamp: Some(ts),
                value,
                tags: Tags::new(),
                source: "test".to_string(),
            },
            SIZE,
        )
        .unwrap()
    }

    #[test]
    fn tumbling_windows_never_overlap() {
        let mut a = agg();
        for ts in [0, 30_000, 59_999, 60_000, 90_000, 120_000] {
            assert_eq!(a.ingest(&ev("k", ts, 1.0)), IngestOutcome::Accepted);
        }
        let closed = a.force_close_all();
        let tumbling: Vec<&MetricsWindow> =
            closed.iter().filter(|w| w.kind == WindowKind::Tumbling).collect();
        assert_eq!(tumbling.len(), 3);
        for pair in tumbling.windows(2) {
            assert!(pair[0].window_end <= pair[1].window_start);
        }
    }

    #[test]
    fn sliding_windows_overlap_by_design() {
        let mut a = agg();
        // One event lands in size/slide = 3 sliding windows.
        a.ingest(&ev("k", 65_000, 2.0));
        let closed = a.force_close_all();
        let sliding: Vec<&MetricsWindow> =
            closed.iter().filter(|w| w.kind == WindowKind::Sliding).collect();
        assert_eq!(sliding.len(), 3);
        for w in &sliding {
            assert!(w.contains(65_000));
            assert_eq!(w.count, 1);
        }
    }

    #[test]
    fn close_due_respects_grace_period() {
        let mut a = agg();
        a.ingest(&ev("k", 1_000, 1.0));
        // Window [0, 60_000) is not due until now >= 60_000 + grace.
        assert!(a.close_due(60_000).is_empty());
        assert!(a.close_due(64_999).is_empty());
        let closed = a.close_due(65_000);
        assert!(closed.iter().any(|w| w.kind == WindowKind::Tumbling && w.window_start == 0));
    }

    #[test]
    fn closed_windows_return_once_in_start_order() {
        let mut a = agg();
        a.ingest(&ev("k", 1_000, 1.0));
        a.ingest(&ev("k", 61_000, 1.0));
        let first = a.close_due(200_000);
        let starts: Vec<i64> = first
            .iter()
            .filter(|w| w.kind == WindowKind::Tumbling)
            .map(|w| w.window_start)
            .collect();
        assert_eq!(starts, vec![0, 60_000]);
        assert!(a.close_due(200_000).is_empty());
    }

    #[test]
    fn late_event_is_dropped_not_merged() {
        let mut a = agg();
        a.ingest(&ev("k", 1_000, 10.0));
        a.ingest(&ev("k", 2_000, 10.0));
        let closed = a.close_due(100_000);
        let w = closed.iter().find(|w| w.kind == WindowKind::Tumbling).unwrap();
        assert_eq!(w.count, 2);
        assert_eq!(w.sum, 20.0);

        // A straggler for the closed range is late and changes nothing.
        assert_eq!(a.ingest(&ev("k", 3_000, 99.0)), IngestOutcome::Late);
        assert_eq!(a.open_window_count(), 0);
    }

    #[test]
    fn late_event_still_feeds_open_sliding_windows() {
        let mut a = agg();
        a.ingest(&ev("k", 50_000, 1.0));
        // Closes tumbling [0, 60k) and sliding [0, 60k); sliding
        // [20k, 80k) and [40k, 100k) stay open.
        let closed = a.close_due(70_000);
        assert_eq!(closed.len(), 2);

        // Late for the closed tumbling window, but 55_000 is still
        // covered by the two open sliding windows.
        assert_eq!(a.ingest(&ev("k", 55_000, 3.0)), IngestOutcome::Late);

        let rest = a.force_close_all();
        let sliding: Vec<&MetricsWindow> =
            rest.iter().filter(|w| w.kind == WindowKind::Sliding).collect();
        assert_eq!(sliding.len(), 2);
        for w in &sliding {
            assert_eq!(w.count, 2);
            assert_eq!(w.sum, 4.0);
        }
        // The closed tumbling range was not reopened.
        assert!(rest.iter().all(|w| w.kind == WindowKind::Sliding));
    }

    #[test]
    fn lateness_is_per_key() {
        let mut a = agg();
        a.ingest(&ev("a", 1_000, 1.0));
        a.close_due(100_000);
        // Key "b" has no watermark yet; an old event is still acceptable.
        assert_eq!(a.ingest(&ev("b", 1_000, 1.0)), IngestOutcome::Accepted);
    }

    #[test]
    fn force_close_ignores_grace() {
        let mut a = agg();
        a.ingest(&ev("k", 1_000, 1.0));
        let closed = a.force_close_all();
        assert!(!closed.is_empty());
        assert_eq!(a.open_window_count(), 0);
    }

    #[test]
    fn sliding_disabled_when_slide_is_zero() {
        let mut a = StreamAggregator::new(SIZE, 0, GRACE, 64);
        a.ingest(&ev("k", 1_000, 1.0));
        let closed = a.force_close_all();
        assert!(closed.iter().all(|w| w.kind == WindowKind::Tumbling));
    }

    #[test]
    fn window_boundaries_fixed_at_creation() {
        let mut a = agg();
        a.ingest(&ev("k", 65_000, 1.0));
        a.ingest(&ev("k", 70_000, 1.0));
        let closed = a.force_close_all();
        for w in closed {
            assert_eq!(w.window_end - w.window_start, SIZE);
        }
    }
}
