//! Worker lane: aggregation and detection for a disjoint subset of keys.
//!
//! Each lane owns its aggregator and history outright, so no locks are
//! taken on the hot path. Events are routed to lanes by key hash, which
//! keeps every window for a given metric key on one lane and gives
//! per-key ordering for free.
//!
//! A lane runs until its ingress channel closes. Channel closure is the
//! drain signal: the lane force-closes every open window, runs detection
//! on each, and exits.
//!
//! Window geometry and lane topology are fixed at startup; detection
//! parameters follow the live config. Each batch of closed windows picks
//! up the current snapshot and rebuilds the ensemble when it changed.

use crate::config::{ConfigHandle, EngineConfig};
use crate::detect::Ensemble;
use crate::event::EnrichedEvent;
use crate::processor::counters::Counters;
use crate::processor::writer::{EngineEvent, PersistRequest};
use crate::storage::WindowStore;
use crate::window::{IngestOutcome, MetricsWindow, StreamAggregator, WindowKind};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub struct Lane {
    id: usize,
    config: ConfigHandle,
    /// Config snapshot the ensemble was last built from.
    snapshot: Arc<EngineConfig>,
    aggregator: StreamAggregator,
    ensemble: Ensemble,
    /// Trailing closed windows per (key, kind), newest last.
    history: HashMap<(String, WindowKind), VecDeque<MetricsWindow>>,
    /// Keys whose tumbling history has been seeded from the store.
    seeded: HashSet<String>,
    store: Arc<dyn WindowStore>,
    counters: Arc<Counters>,
    persist_tx: mpsc::Sender<PersistRequest>,
    events: broadcast::Sender<EngineEvent>,
}

impl Lane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        config: ConfigHandle,
        store: Arc<dyn WindowStore>,
        counters: Arc<Counters>,
        persist_tx: mpsc::Sender<PersistRequest>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let snapshot = config.snapshot();
        let aggregator = StreamAggregator::new(
            snapshot.window_size_ms,
            snapshot.slide_interval_ms,
            snapshot.grace_period_ms,
            snapshot.reservoir_capacity,
        );
        let ensemble = Ensemble::from_config(&snapshot);
        Self {
            id,
            config,
            snapshot,
            aggregator,
            ensemble,
            history: HashMap::new(),
            seeded: HashSet::new(),
            store,
            counters,
            persist_tx,
            events,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EnrichedEvent>) {
        info!(lane = self.id, "lane started");
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.snapshot.tick_interval_ms));

        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(ev) => {
                        if self.aggregator.ingest(&ev) == IngestOutcome::Late {
                            Counters::incr(&self.counters.late_events);
                            debug!(
                                lane = self.id,
                                metric_key = %ev.metric_key,
                                timestamp = ev.timestamp,
                                "late event; tumbling window already closed"
                            );
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let closed = self.aggregator.close_due(Utc::now().timestamp_millis());
                    self.process_closed(closed).await;
                }
            }
        }

        // Ingress closed: drain everything still open.
        let closed = self.aggregator.force_close_all();
        info!(lane = self.id, windows = closed.len(), "lane draining");
        self.process_closed(closed).await;
    }

    /// Pick up a reloaded config before detecting. Window geometry stays
    /// as started; detection parameters and weights take effect here.
    fn refresh_config(&mut self) {
        let current = self.config.snapshot();
        if !Arc::ptr_eq(&current, &self.snapshot) {
            self.ensemble = Ensemble::from_config(&current);
            self.snapshot = current;
            info!(lane = self.id, "detection config refreshed");
        }
    }

    async fn process_closed(&mut self, closed: Vec<MetricsWindow>) {
        if closed.is_empty() {
            return;
        }
        self.refresh_config();
        for window in closed {
            Counters::incr(&self.counters.windows_closed);

            if window.kind == WindowKind::Tumbling {
                self.seed_history(&window.metric_key).await;
            }

            let hist_key = (window.metric_key.clone(), window.kind);
            let history = self.history.entry(hist_key.clone()).or_default();
            let result = self.ensemble.detect(&window, history.make_contiguous());

            let abstained = result
                .contributing_methods
                .iter()
                .filter(|v| v.is_abstention())
                .count() as u64;
            Counters::add(&self.counters.abstentions, abstained);

            if result.verdict {
                warn!(
                    lane = self.id,
                    metric_key = %result.metric_key,
                    window_start = result.window_start,
                    score = result.composite_score,
                    severity = ?result.severity,
                    "anomaly detected"
                );
            }

            // Every closed window is persisted; detectors still vote
            // against tumbling history only.
            let req = PersistRequest {
                window: window.clone(),
                result: result.clone(),
            };
            if self.persist_tx.send(req).await.is_err() {
                warn!(lane = self.id, "writer gone; result not persisted");
            }

            Counters::incr(&self.counters.results_emitted);
            let _ = self.events.send(EngineEvent::Anomaly(result));

            let depth = self.snapshot.history_depth;
            let history = self.history.entry(hist_key).or_default();
            history.push_back(window);
            while history.len() > depth {
                history.pop_front();
            }
        }
    }

    /// One-time warm start per key: pull persisted tumbling windows so
    /// detectors have history across restarts.
    async fn seed_history(&mut self, metric_key: &str) {
        if !self.seeded.insert(metric_key.to_string()) {
            return;
        }
        let store = self.store.clone();
        let key = metric_key.to_string();
        let depth = self.snapshot.history_depth;
        let loaded =
            tokio::task::spawn_blocking(move || store.read_history(&key, depth)).await;

        match loaded {
            Ok(Ok(windows)) if !windows.is_empty() => {
                debug!(
                    lane = self.id,
                    metric_key,
                    windows = windows.len(),
                    "seeded history from store"
                );
                self.history
                    .entry((metric_key.to_string(), WindowKind::Tumbling))
                    .or_insert_with(|| windows.into_iter().collect());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(lane = self.id, metric_key, error = %e, "history seed failed; starting cold");
            }
            Err(e) => {
                warn!(lane = self.id, metric_key, error = %e, "history seed task failed");
            }
        }
    }
}
