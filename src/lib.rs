//! Signalward -- streaming metric aggregation and ensemble anomaly detection.
//!
//! This crate provides the core library for event enrichment, windowed
//! aggregation, statistical analysis, ensemble anomaly detection, and
//! durable result storage.

pub mod analysis;
pub mod config;
pub mod detect;
pub mod event;
pub mod processor;
pub mod source;
pub mod storage;
pub mod window;

use crate::config::{ConfigHandle, EngineConfig};
use crate::processor::{EngineEvent, StreamProcessor};
use crate::storage::{MemoryStore, SqliteStore, WindowStore};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;

/// Load configuration, or fall back to defaults when no path is given.
/// A file-backed handle can later be reloaded in place.
pub fn load_config(path: Option<&Path>) -> Result<ConfigHandle> {
    match path {
        Some(p) => Ok(ConfigHandle::from_path(p)
            .with_context(|| format!("loading config from {}", p.display()))?),
        None => Ok(ConfigHandle::new(EngineConfig::default())?),
    }
}

fn open_store(db_path: Option<&str>) -> Result<Arc<dyn WindowStore>> {
    match db_path {
        Some(path) => {
            tracing::info!(%path, "opening database");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        None => {
            tracing::info!("running with in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Start the engine, run `feed` against it, then drain and report.
async fn run_pipeline<F, Fut>(config: ConfigHandle, db_path: Option<&str>, feed: F) -> Result<()>
where
    F: FnOnce(Arc<StreamProcessor>) -> Fut,
    Fut: std::future::Future<Output = Result<source::FeedStats>>,
{
    let snapshot = config.snapshot();
    let store = open_store(db_path)?;

    // Retention sweep before new windows arrive.
    let retention_ms = snapshot.storage.retention_days as i64 * 86_400_000;
    let cutoff = Utc::now().timestamp_millis() - retention_ms;
    let sweep_store = store.clone();
    let deleted = tokio::task::spawn_blocking(move || sweep_store.delete_older_than(cutoff))
        .await?
        .context("retention sweep failed")?;
    if deleted > 0 {
        tracing::info!(deleted, retention_days = snapshot.storage.retention_days, "retention sweep");
    }

    // SIGHUP re-reads a file-backed config; running lanes pick up the new
    // detection parameters on their next closed-window batch.
    #[cfg(unix)]
    let _reload_task = config.source().is_some().then(|| {
        let reload = config.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hup.recv().await.is_some() {
                match reload.reload() {
                    Ok(()) => tracing::info!("configuration reloaded"),
                    Err(e) => {
                        tracing::warn!(error = %e, "reload rejected; previous config stays active");
                    }
                }
            }
        })
    });

    let mut processor = StreamProcessor::new(config.clone(), store);
    processor.start()?;

    // Results go to stdout as NDJSON, mirroring the input format.
    let mut events = processor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Anomaly(result)) => {
                    if let Ok(line) = serde_json::to_string(&result) {
                        println!("{line}");
                    }
                }
                Ok(EngineEvent::StorageFailure {
                    metric_key,
                    window_start,
                    error,
                    ..
                }) => {
                    tracing::error!(%metric_key, window_start, %error, "result lost");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscriber lagged; results skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let processor = Arc::new(processor);
    let stats = feed(processor.clone()).await?;

    let mut processor =
        Arc::into_inner(processor).context("processor still shared after feed")?;
    processor.shutdown().await?;
    let counters = processor.counters();

    // Dropping the processor drops the last event sender, which lets the
    // printer drain everything queued and exit.
    drop(processor);
    printer.await?;
    tracing::info!(
        submitted = stats.submitted,
        rejected = stats.rejected,
        ingested = counters.events_ingested,
        late = counters.late_events,
        dropped = counters.dropped_events,
        windows_closed = counters.windows_closed,
        results = counters.results_emitted,
        storage_failures = counters.storage_failures,
        "run complete"
    );
    Ok(())
}

/// Serve mode: consume NDJSON events from stdin until EOF.
pub async fn serve(config: ConfigHandle, db_path: &str) -> Result<()> {
    run_pipeline(config, Some(db_path), |processor| async move {
        let stdin = BufReader::new(tokio::io::stdin());
        source::feed_ndjson(stdin, &processor).await
    })
    .await
}

/// Replay a recorded NDJSON event file.
pub async fn replay(config: ConfigHandle, db_path: Option<&str>, file: &Path) -> Result<()> {
    let path = file.to_path_buf();
    run_pipeline(config, db_path, |processor| async move {
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        source::feed_ndjson(BufReader::new(file), &processor).await
    })
    .await
}

/// Generate synthetic traffic against an ephemeral store.
pub async fn simulate(
    config: ConfigHandle,
    events: u64,
    step_ms: i64,
    spike_chance: f64,
) -> Result<()> {
    run_pipeline(config, None, |processor| async move {
        let start = Utc::now().timestamp_millis() - events as i64 * step_ms;
        source::simulate(&processor, events, start, step_ms, spike_chance).await
    })
    .await
}
