//! Event sources for the CLI: NDJSON streams and synthetic traffic.

use crate::event::RawEvent;
use crate::processor::{EngineError, StreamProcessor};
use anyhow::Result;
use rand::Rng;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

/// Outcome of feeding one source into the processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedStats {
    pub submitted: u64,
    pub rejected: u64,
}

/// Feed newline-delimited JSON events into the processor.
///
/// One `RawEvent` per line. Malformed lines and events the processor
/// rejects are counted and skipped; the stream keeps going.
pub async fn feed_ndjson<R>(reader: R, processor: &StreamProcessor) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = FeedStats::default();
    let mut lines = reader.lines();
    let mut line_no: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw: RawEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                stats.rejected += 1;
                warn!(line = line_no, error = %e, "skipping malformed event line");
                continue;
            }
        };

        match processor.submit(raw).await {
            Ok(()) => stats.submitted += 1,
            Err(EngineError::Invalid(e)) => {
                stats.rejected += 1;
                warn!(line = line_no, error = %e, "event rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        submitted = stats.submitted,
        rejected = stats.rejected,
        "event stream exhausted"
    );
    Ok(stats)
}

/// Generate synthetic traffic: a handful of steady metric keys with
/// gaussian-ish noise and occasional injected spikes.
pub async fn simulate(
    processor: &StreamProcessor,
    events: u64,
    start_ms: i64,
    step_ms: i64,
    spike_chance: f64,
) -> Result<FeedStats> {
    const KEYS: &[(&str, f64)] = &[
        ("cpu.load", 10.0),
        ("mem.used_pct", 60.0),
        ("net.rx_kbps", 900.0),
    ];

    let mut rng = rand::thread_rng();
    let mut stats = FeedStats::default();

    for i in 0..events {
        let (key, base) = KEYS[(i % KEYS.len() as u64) as usize];
        let noise: f64 = rng.gen_range(-0.05..0.05);
        let mut value = base * (1.0 + noise);
        if rng.gen_bool(spike_chance) {
            value *= rng.gen_range(4.0..8.0);
            info!(metric_key = key, value, "injecting spike");
        }

        let raw = RawEvent {
            id: None,
            metric_key: key.to_string(),
            timestamp: Some(start_ms + (i / KEYS.len() as u64) as i64 * step_ms),
            value,
            tags: BTreeMap::new(),
            source: "simulate".to_string(),
        };

        match processor.submit(raw).await {
            Ok(()) => stats.submitted += 1,
            Err(EngineError::Invalid(_)) => stats.rejected += 1,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(stats)
}
