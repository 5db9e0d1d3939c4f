//! Persistence task with bounded retry.
//!
//! Lanes hand closed windows and their results to a single writer task
//! over a channel; the writer pushes them into the store on the blocking
//! pool so rusqlite never stalls the runtime. A failed write is retried
//! with doubling backoff up to `max_retries` extra attempts, then the
//! result is escalated as a `StorageFailure` event and dropped.

use crate::config::StorageConfig;
use crate::detect::AnomalyResult;
use crate::processor::counters::Counters;
use crate::storage::WindowStore;
use crate::window::MetricsWindow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

/// Events the engine publishes to subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A window finished detection. Emitted for every closed window,
    /// anomalous or not.
    Anomaly(AnomalyResult),
    /// A result could not be persisted after all retries.
    StorageFailure {
        metric_key: String,
        window_start: i64,
        window_end: i64,
        error: String,
    },
}

pub struct PersistRequest {
    pub window: MetricsWindow,
    pub result: AnomalyResult,
}

pub async fn run_writer(
    mut rx: mpsc::Receiver<PersistRequest>,
    store: Arc<dyn WindowStore>,
    storage: StorageConfig,
    counters: Arc<Counters>,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(req) = rx.recv().await {
        let mut backoff = Duration::from_millis(storage.backoff_ms);
        let mut last_error = String::new();
        let mut persisted = false;

        for attempt in 0..=storage.max_retries {
            if attempt > 0 {
                Counters::incr(&counters.storage_retries);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let store = store.clone();
            let window = req.window.clone();
            let result = req.result.clone();
            let outcome =
                tokio::task::spawn_blocking(move || store.write_window(&window, &result)).await;

            match outcome {
                Ok(Ok(())) => {
                    persisted = true;
                    break;
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(
                        metric_key = %req.window.metric_key,
                        window_start = req.window.window_start,
                        attempt,
                        error = %last_error,
                        "window write failed"
                    );
                }
                Err(e) => {
                    last_error = format!("write task failed: {e}");
                    warn!(error = %last_error, "storage write task panicked");
                }
            }
        }

        if persisted {
            debug!(
                metric_key = %req.window.metric_key,
                window_start = req.window.window_start,
                "window persisted"
            );
        } else {
            Counters::incr(&counters.storage_failures);
            error!(
                metric_key = %req.window.metric_key,
                window_start = req.window.window_start,
                error = %last_error,
                "dropping result after exhausting storage retries"
            );
            let _ = events.send(EngineEvent::StorageFailure {
                metric_key: req.window.metric_key.clone(),
                window_start: req.window.window_start,
                window_end: req.window.window_end,
                error: last_error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::storage::{MemoryStore, StorageError};
    use crate::window::WindowKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request(key: &str, start: i64) -> PersistRequest {
        let mut window = MetricsWindow::new(key, start, start + 60_000, WindowKind::Tumbling, 16);
        window.observe(10.0);
        window.close();
        let result = AnomalyResult {
            metric_key: key.to_string(),
            window_start: start,
            window_end: start + 60_000,
            composite_score: 0.0,
            verdict: false,
            severity: Severity::Low,
            trend: None,
            contributing_methods: Vec::new(),
        };
        PersistRequest { window, result }
    }

    /// Fails the first `failures` writes, then delegates to a MemoryStore.
    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                inner: MemoryStore::new(),
            }
        }
    }

    impl WindowStore for FlakyStore {
        fn write_window(
            &self,
            window: &MetricsWindow,
            result: &AnomalyResult,
        ) -> Result<(), StorageError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Unavailable("injected".into()));
            }
            self.inner.write_window(window, result)
        }

        fn read_history(
            &self,
            metric_key: &str,
            count: usize,
        ) -> Result<Vec<MetricsWindow>, StorageError> {
            self.inner.read_history(metric_key, count)
        }

        fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
            self.inner.delete_older_than(cutoff_ms)
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let store = Arc::new(FlakyStore::new(3));
        let counters = Arc::new(Counters::default());
        let (events, _keep) = broadcast::channel(8);
        let (tx, rx) = mpsc::channel(8);

        let storage = StorageConfig {
            max_retries: 3,
            backoff_ms: 1,
            retention_days: 90,
        };
        let writer_store: Arc<dyn WindowStore> = store.clone();
        let writer = tokio::spawn(run_writer(rx, writer_store, storage, counters.clone(), events));

        tx.send(request("k", 0)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(store.inner.window_count(), 1);
        let s = counters.snapshot();
        assert_eq!(s.storage_retries, 3);
        assert_eq!(s.storage_failures, 0);
    }

    #[tokio::test]
    async fn escalates_after_exhausting_retries() {
        let store = Arc::new(FlakyStore::new(100));
        let counters = Arc::new(Counters::default());
        let (events, mut event_rx) = broadcast::channel(8);
        let (tx, rx) = mpsc::channel(8);

        let storage = StorageConfig {
            max_retries: 2,
            backoff_ms: 1,
            retention_days: 90,
        };
        let writer_store: Arc<dyn WindowStore> = store.clone();
        let writer = tokio::spawn(run_writer(rx, writer_store, storage, counters.clone(), events));

        tx.send(request("k", 0)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(store.inner.window_count(), 0);
        assert_eq!(counters.snapshot().storage_failures, 1);
        match event_rx.try_recv().unwrap() {
            EngineEvent::StorageFailure { metric_key, .. } => assert_eq!(metric_key, "k"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
