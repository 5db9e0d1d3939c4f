//! Engine configuration -- window sizes, detector weights, thresholds.
//!
//! Loaded from TOML at startup and validated before the engine may start.
//! Hot-reload swaps a fully-constructed `Arc<EngineConfig>` behind a lock;
//! readers clone the current snapshot and never observe a partial update.
//! A reload with an invalid file is rejected and the previous snapshot
//! stays active.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Detection methods the ensemble can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Zscore,
    Iqr,
    DensityRatio,
    Changepoint,
    Threshold,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MethodKind::Zscore => "zscore",
            MethodKind::Iqr => "iqr",
            MethodKind::DensityRatio => "density_ratio",
            MethodKind::Changepoint => "changepoint",
            MethodKind::Threshold => "threshold",
        };
        f.write_str(s)
    }
}

/// Per-method tuning parameters. Unused fields are ignored by methods
/// that do not need them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Z-score flag threshold (3.0 = three sigma).
    pub z_threshold: f64,
    /// IQR fence multiplier (1.5 = standard, 3.0 = extreme only).
    pub iqr_multiplier: f64,
    /// Neighbor count for the density-ratio method.
    pub neighbors: usize,
    /// Density ratio above which the window is flagged.
    pub density_threshold: f64,
    /// Relative change from the trailing baseline above which the
    /// changepoint method flags (0.5 = 50% shift).
    pub change_threshold: f64,
    /// Trailing windows averaged into the changepoint baseline.
    pub change_window: usize,
    /// Absolute bounds for the threshold method.
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            iqr_multiplier: 1.5,
            neighbors: 3,
            density_threshold: 3.0,
            change_threshold: 0.5,
            change_window: 10,
            min_value: None,
            max_value: None,
        }
    }
}

/// One enabled detector in the ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub method: MethodKind,
    pub weight: f64,
    #[serde(default)]
    pub params: DetectorParams,
}

/// Persistence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Retries after the first failed write before the result is escalated.
    pub max_retries: u32,
    /// Base backoff between retries; doubled on each attempt.
    pub backoff_ms: u64,
    /// Windows older than this many days are eligible for the retention sweep.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 200,
            retention_days: 90,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tumbling/sliding window length in milliseconds.
    pub window_size_ms: i64,
    /// Slide step for sliding windows. 0 disables sliding windows.
    pub slide_interval_ms: i64,
    /// Lateness tolerance after a window's nominal end.
    pub grace_period_ms: i64,
    /// Composite score at or above which the ensemble verdict is anomalous.
    pub decision_threshold: f64,
    /// Minimum closed windows of history before a method may vote.
    pub min_history: usize,
    /// Trailing closed windows kept per key for detection.
    pub history_depth: usize,
    /// Worker lanes; each owns a disjoint subset of metric keys.
    pub lanes: usize,
    /// Bounded ingress queue depth per lane.
    pub lane_queue_depth: usize,
    /// How long a producer may block on a full lane before the event is
    /// dropped and counted.
    pub send_timeout_ms: u64,
    /// Window-closure check interval.
    pub tick_interval_ms: u64,
    /// Reservoir size for percentile estimates.
    pub reservoir_capacity: usize,
    pub storage: StorageConfig,
    pub detectors: Vec<DetectorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            slide_interval_ms: 10_000,
            grace_period_ms: 5_000,
            decision_threshold: 0.5,
            min_history: 5,
            history_depth: 32,
            lanes: 4,
            lane_queue_depth: 1024,
            send_timeout_ms: 250,
            tick_interval_ms: 1_000,
            reservoir_capacity: 256,
            storage: StorageConfig::default(),
            detectors: vec![
                DetectorConfig {
                    method: MethodKind::Zscore,
                    weight: 0.4,
                    params: DetectorParams::default(),
                },
                DetectorConfig {
                    method: MethodKind::Iqr,
                    weight: 0.3,
                    params: DetectorParams::default(),
                },
                DetectorConfig {
                    method: MethodKind::DensityRatio,
                    weight: 0.3,
                    params: DetectorParams::default(),
                },
            ],
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_ms <= 0 {
            return Err(ConfigError::Invalid("window_size_ms must be positive".into()));
        }
        if self.slide_interval_ms < 0 || self.slide_interval_ms > self.window_size_ms {
            return Err(ConfigError::Invalid(
                "slide_interval_ms must be in [0, window_size_ms]".into(),
            ));
        }
        if self.grace_period_ms < 0 {
            return Err(ConfigError::Invalid("grace_period_ms must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(ConfigError::Invalid(
                "decision_threshold must be in [0.0, 1.0]".into(),
            ));
        }
        if self.min_history < 2 {
            return Err(ConfigError::Invalid("min_history must be at least 2".into()));
        }
        if self.history_depth < self.min_history {
            return Err(ConfigError::Invalid(
                "history_depth must be at least min_history".into(),
            ));
        }
        if self.lanes == 0 {
            return Err(ConfigError::Invalid("lanes must be at least 1".into()));
        }
        if self.lane_queue_depth == 0 {
            return Err(ConfigError::Invalid("lane_queue_depth must be at least 1".into()));
        }
        if self.reservoir_capacity == 0 {
            return Err(ConfigError::Invalid("reservoir_capacity must be at least 1".into()));
        }
        if self.detectors.is_empty() {
            return Err(ConfigError::Invalid("at least one detector must be enabled".into()));
        }
        let mut weight_sum = 0.0;
        for d in &self.detectors {
            if !d.weight.is_finite() || d.weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "detector '{}' has invalid weight {}",
                    d.method, d.weight
                )));
            }
            weight_sum += d.weight;
        }
        if weight_sum <= 0.0 {
            return Err(ConfigError::Invalid("detector weights must sum above zero".into()));
        }
        Ok(())
    }
}

/// Shared handle to the current configuration snapshot.
///
/// Clone freely; all clones see the same snapshot. `snapshot()` is what
/// processing cycles call -- the returned `Arc` is immutable for the
/// duration of the cycle regardless of concurrent reloads.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
    source: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            source: None,
        })
    }

    /// Load from a TOML file, remembering the path for later reloads.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = EngineConfig::from_path(path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            source: Some(path.to_path_buf()),
        })
    }

    /// The file this handle was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the snapshot after validation.
    pub fn swap(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
        Ok(())
    }

    /// Reload from disk. On any error the active snapshot is untouched.
    pub fn reload_from(&self, path: &Path) -> Result<(), ConfigError> {
        let config = EngineConfig::from_path(path)?;
        self.swap(config)
    }

    /// Re-read the file this handle was loaded from.
    pub fn reload(&self) -> Result<(), ConfigError> {
        match &self.source {
            Some(path) => self.reload_from(path),
            None => Err(ConfigError::Invalid(
                "no config file to reload from".into(),
            )),
        }
    }
}
