//! Store configuration.
//!
//! Persisted next to the index document as `store_config.json` so a later
//! read session sees the same capacities and root region.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::model::ElementKind;

pub const CONFIG_FILE_NAME: &str = "store_config.json";

/// Top-level configuration for one index directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Features a leaf may hold (resident + spilled) before it subdivides.
    pub node_capacity: u64,
    /// Deepest level; leaves at this level never subdivide.
    pub max_level: u8,
    /// Root split point (lon, lat).
    pub root_center: (f64, f64),
    /// Root half-extent (lon, lat).
    pub root_half_extent: (f64, f64),
    /// Operation entries after which a shard file rolls over.
    pub rollover_entries: u64,
    /// Operations per encoded frame.
    pub ops_per_frame: usize,
    /// Constrained reads skip files with fewer wanted ids than this.
    pub constrained_min_points: usize,
    pub constrained_min_lines: usize,
    pub constrained_min_relations: usize,
    pub scan: ScanConfig,
    pub spill: SpillConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_capacity: 100_000,
            max_level: 10,
            root_center: (0.0, 0.0),
            root_half_extent: (180.0, 90.0),
            rollover_entries: 500_000,
            ops_per_frame: 100,
            constrained_min_points: 150,
            constrained_min_lines: 50,
            constrained_min_relations: 10,
            scan: ScanConfig::default(),
            spill: SpillConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn constrained_threshold(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Point => self.constrained_min_points,
            ElementKind::Line => self.constrained_min_lines,
            ElementKind::Relation => self.constrained_min_relations,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_capacity == 0 {
            return Err(StoreError::InvalidConfig("node_capacity must be > 0".into()));
        }
        if self.rollover_entries == 0 {
            return Err(StoreError::InvalidConfig("rollover_entries must be > 0".into()));
        }
        if self.ops_per_frame == 0 || self.ops_per_frame > u16::MAX as usize {
            return Err(StoreError::InvalidConfig(format!(
                "ops_per_frame must be in 1..={}",
                u16::MAX
            )));
        }
        if !(self.root_half_extent.0 > 0.0 && self.root_half_extent.1 > 0.0) {
            return Err(StoreError::InvalidConfig("root half-extent must be positive".into()));
        }
        self.scan.validate()?;
        self.spill.validate()
    }

    /// Read config from an index directory. Returns None if absent.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), json)?;
        Ok(())
    }
}

/// Parallel scan tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub offer_retry_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity: 10_000,
            batch_size: 1_000,
            poll_interval_ms: 10,
            offer_retry_ms: 10,
        }
    }
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn offer_retry(&self) -> Duration {
        Duration::from_millis(self.offer_retry_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.queue_capacity == 0 || self.batch_size == 0 {
            return Err(StoreError::InvalidConfig(
                "scan workers, queue_capacity and batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Memory-pressure spill policy.
///
/// The tier schedule and backoff constants are empirical; treat them as
/// knobs rather than fixed behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Memory budget in bytes. None means total system memory.
    pub memory_limit_bytes: Option<u64>,
    /// Usage fraction of the budget above which spilling starts.
    pub ceiling: f64,
    /// (usage fraction upper bound, minimum resident features) ascending.
    /// Usage above every bound uses the last tier.
    pub tiers: Vec<(f64, u64)>,
    /// Pressure events closer together than this grow the backoff.
    pub backoff_window_secs: u64,
    pub backoff_factor: u64,
    pub max_backoff: u64,
    /// Minimum time between memory probes.
    pub check_interval_ms: u64,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: None,
            ceiling: 0.75,
            tiers: vec![(0.80, 50_000), (0.90, 10_000), (0.95, 1_000), (f64::MAX, 1)],
            backoff_window_secs: 30,
            backoff_factor: 2,
            max_backoff: 16,
            check_interval_ms: 1_000,
        }
    }
}

impl SpillConfig {
    pub fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.backoff_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(StoreError::InvalidConfig("spill tiers must not be empty".into()));
        }
        if self.tiers.windows(2).any(|w| w[0].0 >= w[1].0 || w[0].1 < w[1].1) {
            return Err(StoreError::InvalidConfig(
                "spill tiers must have ascending bounds and non-increasing thresholds".into(),
            ));
        }
        if self.backoff_factor == 0 || self.max_backoff == 0 {
            return Err(StoreError::InvalidConfig("backoff values must be > 0".into()));
        }
        Ok(())
    }
}
