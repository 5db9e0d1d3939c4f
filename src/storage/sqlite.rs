//! SQLite-backed [`WindowStore`] over an r2d2 connection pool.

use crate::detect::AnomalyResult;
use crate::storage::{schema, StorageError, WindowStore};
use crate::window::{MetricsWindow, PercentileEstimates, WindowKind};
use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path)?,
        })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

impl WindowStore for SqliteStore {
    fn write_window(
        &self,
        window: &MetricsWindow,
        result: &AnomalyResult,
    ) -> Result<(), StorageError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let percentiles_json = window
            .percentiles
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let verdicts_json = serde_json::to_string(&result.contributing_methods)?;

        conn.execute(
            "INSERT INTO windows
                 (metric_key, window_start, window_end, kind,
                  count, sum, mean, m2, min, max, percentiles_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (metric_key, window_start, window_end, kind) DO UPDATE SET
                 count = excluded.count,
                 sum = excluded.sum,
                 mean = excluded.mean,
                 m2 = excluded.m2,
                 min = excluded.min,
                 max = excluded.max,
                 percentiles_json = excluded.percentiles_json",
            params![
                window.metric_key,
                window.window_start,
                window.window_end,
                window.kind.as_str(),
                window.count,
                window.sum,
                window.mean(),
                window.m2(),
                window.min,
                window.max,
                percentiles_json,
            ],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        conn.execute(
            "INSERT INTO anomaly_results
                 (metric_key, window_start, window_end, kind,
                  composite_score, verdict, severity, verdicts_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (metric_key, window_start, window_end, kind) DO UPDATE SET
                 composite_score = excluded.composite_score,
                 verdict = excluded.verdict,
                 severity = excluded.severity,
                 verdicts_json = excluded.verdicts_json",
            params![
                result.metric_key,
                result.window_start,
                result.window_end,
                window.kind.as_str(),
                result.composite_score,
                result.verdict,
                format!("{:?}", result.severity).to_lowercase(),
                verdicts_json,
            ],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    fn read_history(
        &self,
        metric_key: &str,
        count: usize,
    ) -> Result<Vec<MetricsWindow>, StorageError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT metric_key, window_start, window_end,
                        count, sum, mean, m2, min, max, percentiles_json
                 FROM windows
                 WHERE metric_key = ?1 AND kind = 'tumbling'
                 ORDER BY window_start DESC
                 LIMIT ?2",
            )
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let rows = stmt
            .query_map(params![metric_key, count as i64], |row| {
                let percentiles_json: Option<String> = row.get(9)?;
                let percentiles: Option<PercentileEstimates> = percentiles_json
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok());
                Ok(MetricsWindow::from_parts(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    WindowKind::Tumbling,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    percentiles,
                ))
            })
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut windows = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Query(e.to_string()))?;
        // Newest-first from the query; callers want ascending.
        windows.reverse();
        Ok(windows)
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        conn.execute(
            "DELETE FROM anomaly_results WHERE window_end <= ?1",
            params![cutoff_ms],
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;

        let deleted = conn
            .execute("DELETE FROM windows WHERE window_end <= ?1", params![cutoff_ms])
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn window(key: &str, start: i64, values: &[f64]) -> MetricsWindow {
        let mut w = MetricsWindow::new(key, start, start + 60_000, WindowKind::Tumbling, 64);
        for &v in values {
            w.observe(v);
        }
        w.close();
        w
    }

    fn result(key: &str, start: i64) -> AnomalyResult {
        AnomalyResult {
            metric_key: key.to_string(),
            window_start: start,
            window_end: start + 60_000,
            composite_score: 0.2,
            verdict: false,
            severity: Severity::Low,
            trend: None,
            contributing_methods: Vec::new(),
        }
    }

    #[test]
    fn round_trips_window_statistics() {
        let (_dir, store) = store();
        let w = window("cpu.load", 0, &[1.0, 2.0, 3.0, 4.0]);
        store.write_window(&w, &result("cpu.load", 0)).unwrap();

        let history = store.read_history("cpu.load", 10).unwrap();
        assert_eq!(history.len(), 1);
        let got = &history[0];
        assert_eq!(got.count, 4);
        assert_eq!(got.sum, 10.0);
        assert!((got.mean() - 2.5).abs() < 1e-12);
        assert!((got.variance() - w.variance()).abs() < 1e-12);
        assert_eq!(got.min, 1.0);
        assert_eq!(got.max, 4.0);
        assert!(got.percentiles.is_some());
    }

    #[test]
    fn rewrite_same_window_does_not_duplicate() {
        let (_dir, store) = store();
        let w = window("cpu.load", 0, &[5.0]);
        store.write_window(&w, &result("cpu.load", 0)).unwrap();
        store.write_window(&w, &result("cpu.load", 0)).unwrap();
        assert_eq!(store.read_history("cpu.load", 10).unwrap().len(), 1);
    }

    #[test]
    fn history_ascending_and_bounded() {
        let (_dir, store) = store();
        for start in [0i64, 60_000, 120_000, 180_000] {
            store
                .write_window(&window("k", start, &[1.0]), &result("k", start))
                .unwrap();
        }
        let history = store.read_history("k", 2).unwrap();
        let starts: Vec<i64> = history.iter().map(|w| w.window_start).collect();
        assert_eq!(starts, vec![120_000, 180_000]);
    }

    #[test]
    fn sliding_windows_excluded_from_history() {
        let (_dir, store) = store();
        let mut sliding = MetricsWindow::new("k", 0, 60_000, WindowKind::Sliding, 64);
        sliding.observe(1.0);
        sliding.close();
        store.write_window(&sliding, &result("k", 0)).unwrap();
        assert!(store.read_history("k", 10).unwrap().is_empty());
    }

    #[test]
    fn sliding_and_tumbling_same_range_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();

        let tumbling = window("k", 0, &[10.0]);
        let mut sliding = MetricsWindow::new("k", 0, 60_000, WindowKind::Sliding, 64);
        sliding.observe(10.0);
        sliding.close();
        store.write_window(&tumbling, &result("k", 0)).unwrap();
        store.write_window(&sliding, &result("k", 0)).unwrap();
        // A rewrite overwrites within its kind, never across kinds.
        store.write_window(&sliding, &result("k", 0)).unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        let windows: i64 = conn
            .query_row("SELECT COUNT(*) FROM windows", [], |r| r.get(0))
            .unwrap();
        let results: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomaly_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(windows, 2);
        assert_eq!(results, 2);
    }

    #[test]
    fn retention_sweep_deletes_old_windows() {
        let (_dir, store) = store();
        store.write_window(&window("k", 0, &[1.0]), &result("k", 0)).unwrap();
        store
            .write_window(&window("k", 600_000, &[1.0]), &result("k", 600_000))
            .unwrap();
        let deleted = store.delete_older_than(300_000).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.read_history("k", 10).unwrap().len(), 1);
    }
}
