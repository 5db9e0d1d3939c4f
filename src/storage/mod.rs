//! Persistence behind a storage interface.
//!
//! The engine only ever calls [`WindowStore`]; any backend satisfying the
//! contract works. Ships with an in-memory store (tests, ephemeral runs)
//! and a SQLite store (the appliance default).

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::detect::AnomalyResult;
use crate::window::{MetricsWindow, WindowKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage query failed: {0}")]
    Query(String),

    #[error("failed to encode stored value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contract every persistence backend must satisfy.
///
/// Writes are keyed by `(metric_key, window_start, window_end, kind)`; a
/// repeated write for the same window must overwrite, not duplicate, so
/// that the engine's bounded retries stay idempotent. Sliding and
/// tumbling windows over the same range are distinct records.
pub trait WindowStore: Send + Sync {
    fn write_window(
        &self,
        window: &MetricsWindow,
        result: &AnomalyResult,
    ) -> Result<(), StorageError>;

    /// Most recent `count` closed tumbling windows for a key, ascending
    /// by window_start.
    fn read_history(&self, metric_key: &str, count: usize)
        -> Result<Vec<MetricsWindow>, StorageError>;

    /// Retention sweep. Returns the number of windows deleted.
    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError>;
}

/// In-memory store used by tests and runs without a database path.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, BTreeMap<(i64, i64, WindowKind), (MetricsWindow, AnomalyResult)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_count(&self) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn kind_count(&self, kind: WindowKind) -> usize {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .values()
            .flat_map(|per_key| per_key.keys())
            .filter(|(_, _, k)| *k == kind)
            .count()
    }

    /// The persisted tumbling result for a window, if any.
    pub fn result_for(&self, metric_key: &str, window_start: i64) -> Option<AnomalyResult> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .get(metric_key)?
            .iter()
            .find(|((start, _, kind), _)| *start == window_start && *kind == WindowKind::Tumbling)
            .map(|(_, (_, r))| r.clone())
    }
}

impl WindowStore for MemoryStore {
    fn write_window(
        &self,
        window: &MetricsWindow,
        result: &AnomalyResult,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner
            .entry(window.metric_key.clone())
            .or_default()
            .insert(
                (window.window_start, window.window_end, window.kind),
                (window.clone(), result.clone()),
            );
        Ok(())
    }

    fn read_history(
        &self,
        metric_key: &str,
        count: usize,
    ) -> Result<Vec<MetricsWindow>, StorageError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let Some(per_key) = inner.get(metric_key) else {
            return Ok(Vec::new());
        };
        let mut windows: Vec<MetricsWindow> = per_key
            .values()
            .filter(|(w, _)| w.kind == WindowKind::Tumbling)
            .map(|(w, _)| w.clone())
            .collect();
        // BTreeMap iteration is already ascending; keep the newest `count`.
        if windows.len() > count {
            windows.drain(..windows.len() - count);
        }
        Ok(windows)
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let mut deleted = 0;
        for per_key in inner.values_mut() {
            let before = per_key.len();
            per_key.retain(|(_, end, _), _| *end > cutoff_ms);
            deleted += before - per_key.len();
        }
        Ok(deleted)
    }
}
