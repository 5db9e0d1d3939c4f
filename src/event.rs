//! Raw event intake and enrichment.
//!
//! A `RawEvent` is whatever the event source hands us, one record at a time.
//! `enrich` validates it and attaches the processing timestamp and the
//! tumbling-window bucket it belongs to. Malformed records are rejected
//! individually; one bad record never interrupts the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("metric_key is empty")]
    EmptyMetricKey,

    #[error("value is not finite")]
    NonFiniteValue,

    #[error("timestamp is missing")]
    MissingTimestamp,
}

/// Ingress contract: one raw event record.
///
/// `timestamp` is epoch milliseconds (event time). Optional so that a
/// record missing it is rejected with a clear error instead of failing
/// deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub metric_key: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub source: String,
}

/// An event that passed validation. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub id: Uuid,
    pub metric_key: String,
    /// Event time, epoch milliseconds.
    pub timestamp: i64,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub source: String,
    /// Processing-time clock at enrichment.
    pub ingest_time: DateTime<Utc>,
    /// Start of the tumbling window bucket covering `timestamp`.
    pub window_bucket_start: i64,
}

/// Validate a raw event and attach derived fields.
///
/// `window_size_ms` comes from the current config snapshot; the bucket is
/// `floor(timestamp / window_size) * window_size` (euclidean, so negative
/// timestamps still bucket correctly).
pub fn enrich(raw: RawEvent, window_size_ms: i64) -> Result<EnrichedEvent, ValidationError> {
    if raw.metric_key.trim().is_empty() {
        return Err(ValidationError::EmptyMetricKey);
    }
    if !raw.value.is_finite() {
        return Err(ValidationError::NonFiniteValue);
    }
    let timestamp = raw.timestamp.ok_or(ValidationError::MissingTimestamp)?;

    let window_bucket_start = timestamp.div_euclid(window_size_ms) * window_size_ms;

    Ok(EnrichedEvent {
        id: raw.id.unwrap_or_else(Uuid::new_v4),
        metric_key: raw.metric_key,
        timestamp,
        value: raw.value,
        tags: raw.tags,
        source: raw.source,
        ingest_time: Utc::now(),
        window_bucket_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(key: &str, ts: Option<i64>, value: f64) -> RawEvent {
        RawEvent {
            id: None,
            metric_key: key.to_string(),
            timestamp: ts,
            value,
            tags: BTreeMap::new(),
            source: "test".to_string(),
        }
    }

    #[test]
    fn computes_bucket_start() {
        let ev = enrich(raw("cpu.load", Some(125_500), 1.0), 60_000).unwrap();
        assert_eq!(ev.window_bucket_start, 120_000);
        assert_eq!(ev.timestamp, 125_500);
    }

    #[test]
    fn bucket_aligned_timestamp_keeps_own_bucket() {
        let ev = enrich(raw("cpu.load", Some(120_000), 1.0), 60_000).unwrap();
        assert_eq!(ev.window_bucket_start, 120_000);
    }

    #[test]
    fn rejects_empty_key() {
        let err = enrich(raw("  ", Some(1), 1.0), 60_000).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyMetricKey));
    }

    #[test]
    fn rejects_nan_and_infinity() {
        assert!(matches!(
            enrich(raw("k", Some(1), f64::NAN), 60_000).unwrap_err(),
            ValidationError::NonFiniteValue
        ));
        assert!(matches!(
            enrich(raw("k", Some(1), f64::INFINITY), 60_000).unwrap_err(),
            ValidationError::NonFiniteValue
        ));
    }

    #[test]
    fn rejects_missing_timestamp() {
        assert!(matches!(
            enrich(raw("k", None, 1.0), 60_000).unwrap_err(),
            ValidationError::MissingTimestamp
        ));
    }

    #[test]
    fn assigns_id_when_absent() {
        let ev = enrich(raw("k", Some(1), 1.0), 60_000).unwrap();
        assert!(!ev.id.is_nil());
    }
}
