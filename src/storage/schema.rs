//! SQLite schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations. Idempotent.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS windows (
            id INTEGER PRIMARY KEY,
            metric_key TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            kind TEXT NOT NULL,
            count INTEGER NOT NULL,
            sum REAL NOT NULL,
            mean REAL NOT NULL,
            m2 REAL NOT NULL,
            min REAL NOT NULL,
            max REAL NOT NULL,
            percentiles_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (metric_key, window_start, window_end, kind)
        );

        CREATE TABLE IF NOT EXISTS anomaly_results (
            id INTEGER PRIMARY KEY,
            metric_key TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            kind TEXT NOT NULL,
            composite_score REAL NOT NULL,
            verdict INTEGER NOT NULL,
            severity TEXT NOT NULL,
            verdicts_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (metric_key, window_start, window_end, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_windows_key_start
            ON windows(metric_key, kind, window_start);
        CREATE INDEX IF NOT EXISTS idx_results_key_start
            ON anomaly_results(metric_key, window_start);
        CREATE INDEX IF NOT EXISTS idx_windows_end ON windows(window_end);",
    )?;

    Ok(())
}
