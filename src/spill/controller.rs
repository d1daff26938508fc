//! Memory-pressure spill controller.
//!
//! Samples memory usage from the ingestion thread. Once usage exceeds the
//! configured ceiling it picks a minimum resident-feature threshold from a
//! tier schedule, divides it by a backoff multiplier that grows while
//! pressure events recur within a window, and flushes every leaf holding at
//! least that many resident features to its node directory. A flush is
//! skipped unless its threshold is strictly lower than the previous one.
//!
//! The controller is also the tree's [`SpilledFeatureLoader`]: a node that
//! must subdivide gets its spilled features back through a nested parallel
//! scan. Once the tree has reconciled them with the node's count, the
//! node's files are moved aside and deleted after the next index document
//! is durably written.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::index::{node_dir, IndexDocument, Quadtree, SpilledFeatureLoader};
use crate::model::{ElementKind, Feature};
use crate::spill::resource::{MemoryProbe, ResourceManager, SystemMemoryProbe};
use crate::store::{write_features_by_kind, OperationFileManifest, ParallelScan, MANIFEST_FILE_NAME};

/// Holds a node's files after they were reloaded for subdivision.
pub const SUPERSEDED_DIR_NAME: &str = ".superseded";

const SHARD_FILE_PREFIX: &str = "operation_";

/// Minimum resident features for a usage fraction. `tiers` is ascending
/// by bound; usage above every bound falls in the last tier.
pub fn tier_threshold(tiers: &[(f64, u64)], fraction: f64) -> u64 {
    tiers
        .iter()
        .find(|(bound, _)| fraction <= *bound)
        .or(tiers.last())
        .map_or(1, |&(_, threshold)| threshold)
}

/// Outcome of one [`SpillController::maybe_spill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillDecision {
    /// Probed too recently; nothing sampled.
    NotDue,
    BelowCeiling,
    /// Under pressure, but the threshold did not drop below the last one.
    Hysteresis { threshold: u64 },
    Flushed { threshold: u64, nodes: usize, features: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub checks: u64,
    pub pressure_events: u64,
    pub flushes: u64,
    pub skipped_hysteresis: u64,
    pub nodes_spilled: u64,
    pub features_spilled: u64,
    pub reloads: u64,
    pub features_reloaded: u64,
}

pub struct SpillController {
    base: PathBuf,
    config: StoreConfig,
    probe: Box<dyn MemoryProbe>,
    flush_threads: usize,
    last_check: Option<Instant>,
    last_pressure: Option<Instant>,
    backoff: u64,
    last_threshold: Option<u64>,
    superseded: Vec<PathBuf>,
    supersede_seq: u64,
    stats: SpillStats,
}

impl SpillController {
    /// Controller probing this process against `config.spill.memory_limit_bytes`.
    pub fn new(base: &Path, config: &StoreConfig) -> Self {
        let probe = SystemMemoryProbe::new(config.spill.memory_limit_bytes);
        Self::with_probe(base, config, Box::new(probe))
    }

    pub fn with_probe(base: &Path, config: &StoreConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            base: base.to_path_buf(),
            config: config.clone(),
            probe,
            flush_threads: ResourceManager::auto_tune().flush_threads,
            last_check: None,
            last_pressure: None,
            backoff: 1,
            last_threshold: None,
            superseded: Vec::new(),
            supersede_seq: 0,
            stats: SpillStats::default(),
        }
    }

    pub fn with_flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads.max(1);
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn stats(&self) -> &SpillStats {
        &self.stats
    }

    /// Current backoff multiplier.
    pub fn backoff(&self) -> u64 {
        self.backoff
    }

    pub fn maybe_spill(&mut self, tree: &mut Quadtree) -> Result<SpillDecision> {
        self.maybe_spill_at(tree, Instant::now())
    }

    /// [`maybe_spill`](Self::maybe_spill) with an explicit clock reading.
    pub fn maybe_spill_at(&mut self, tree: &mut Quadtree, now: Instant) -> Result<SpillDecision> {
        let spill = &self.config.spill;
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < spill.check_interval() {
                return Ok(SpillDecision::NotDue);
            }
        }
        self.last_check = Some(now);
        self.stats.checks += 1;

        let usage = self.probe.sample();
        let fraction = usage.fraction();
        if fraction <= spill.ceiling {
            self.last_threshold = None;
            return Ok(SpillDecision::BelowCeiling);
        }

        self.stats.pressure_events += 1;
        let recurring = self
            .last_pressure
            .is_some_and(|t| now.saturating_duration_since(t) <= spill.backoff_window());
        if recurring {
            let grown = self.backoff.saturating_mul(spill.backoff_factor).min(spill.max_backoff);
            if grown > self.backoff {
                tracing::warn!(backoff = grown, usage = fraction, "memory pressure recurring; backing off");
            }
            self.backoff = grown;
        } else {
            self.backoff = 1;
            self.last_threshold = None;
        }
        self.last_pressure = Some(now);

        let threshold = (tier_threshold(&spill.tiers, fraction) / self.backoff).max(1);
        if let Some(previous) = self.last_threshold {
            if threshold >= previous {
                self.stats.skipped_hysteresis += 1;
                tracing::debug!(threshold, previous, "spill skipped by hysteresis");
                return Ok(SpillDecision::Hysteresis { threshold });
            }
        }
        self.last_threshold = Some(threshold);

        tracing::info!(
            used_bytes = usage.used_bytes,
            limit_bytes = usage.limit_bytes,
            threshold,
            backoff = self.backoff,
            "memory pressure; spilling leaves"
        );
        let (nodes, features) = self.flush(tree, threshold, false)?;
        Ok(SpillDecision::Flushed {
            threshold,
            nodes,
            features,
        })
    }

    /// Spill every resident feature, internal nodes included, and write
    /// the index document. Leaves the tree with no resident features.
    pub fn checkpoint(&mut self, tree: &mut Quadtree) -> Result<(usize, u64)> {
        let result = self.flush(tree, 0, true)?;
        self.last_threshold = None;
        Ok(result)
    }

    /// Write the current tree structure to the index document.
    pub fn write_index(&self, tree: &Quadtree) -> Result<()> {
        IndexDocument::from_tree(tree).write_to(&self.base)
    }

    /// Delete files superseded by reloads. Only safe once an index
    /// document written after those reloads is on disk.
    pub fn collect_garbage(&mut self) -> Result<usize> {
        let mut removed = 0;
        for dir in self.superseded.drain(..) {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "superseded node files deleted");
        }
        Ok(removed)
    }

    /// Write resident features of qualifying nodes to their directories,
    /// then persist the index document.
    ///
    /// Features whose write failed are put back on their node.
    fn flush(&mut self, tree: &mut Quadtree, threshold: u64, include_internal: bool) -> Result<(usize, u64)> {
        let mut jobs: Vec<(String, Vec<Feature>)> = Vec::new();
        tree.visit_mut(&mut |node| {
            let resident = node.resident_count();
            if (include_internal || node.is_leaf()) && resident > 0 && resident >= threshold {
                jobs.push((node.path().to_string(), std::mem::take(&mut node.resident)));
            }
        });

        let results = self.write_jobs(&jobs);

        let mut nodes = 0;
        let mut features = 0u64;
        let mut first_error = None;
        for ((path, spilled), (committed, result)) in jobs.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    nodes += 1;
                    features += spilled.len() as u64;
                }
                Err(e) => {
                    // Kinds already in the manifest stay spilled; the rest go back.
                    let (on_disk, kept): (Vec<Feature>, Vec<Feature>) =
                        spilled.into_iter().partition(|f| committed.contains(&f.kind()));
                    tracing::error!(
                        path = %path,
                        error = %e,
                        committed = on_disk.len(),
                        kept = kept.len(),
                        "spill write failed; unwritten features kept resident"
                    );
                    features += on_disk.len() as u64;
                    if let Some(node) = tree.node_mut(&path) {
                        node.resident.extend(kept);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.write_index(tree)?;
        self.collect_garbage()?;

        self.stats.flushes += 1;
        self.stats.nodes_spilled += nodes as u64;
        self.stats.features_spilled += features;
        tracing::info!(nodes, features, threshold, resident = tree.resident_count(), "spill flush complete");
        Ok((nodes, features))
    }

    fn write_jobs(&self, jobs: &[(String, Vec<Feature>)]) -> Vec<(Vec<ElementKind>, Result<()>)> {
        let base = self.base.as_path();
        let config = &self.config;
        let write = move |(path, features): &(String, Vec<Feature>)| {
            write_features_by_kind(&node_dir(base, path), features, config)
        };

        if self.flush_threads <= 1 || jobs.len() <= 1 {
            return jobs.iter().map(write).collect();
        }
        match rayon::ThreadPoolBuilder::new().num_threads(self.flush_threads).build() {
            Ok(pool) => pool.install(|| jobs.par_iter().map(write).collect()),
            Err(e) => {
                tracing::warn!("rayon pool: {e}; writing sequentially");
                jobs.iter().map(write).collect()
            }
        }
    }

    /// Move the manifest and shard files of `dir` aside.
    fn supersede(&mut self, dir: &Path) -> Result<()> {
        let holder = dir.join(SUPERSEDED_DIR_NAME);
        let target = holder.join(self.supersede_seq.to_string());
        self.supersede_seq += 1;
        std::fs::create_dir_all(&target)?;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str == MANIFEST_FILE_NAME || name_str.starts_with(SHARD_FILE_PREFIX) {
                std::fs::rename(entry.path(), target.join(&name))?;
            }
        }
        if !self.superseded.contains(&holder) {
            self.superseded.push(holder);
        }
        Ok(())
    }
}

impl SpilledFeatureLoader for SpillController {
    fn reload(&mut self, path: &str) -> Result<Vec<Feature>> {
        let dir = node_dir(&self.base, path);
        if !OperationFileManifest::exists(&dir) {
            tracing::warn!(path, dir = %dir.display(), "node has no spilled data to reload");
            return Ok(Vec::new());
        }
        let features = ParallelScan::start(&dir, None, &self.config)?.collect_all()?;
        tracing::info!(path, features = features.len(), "reloaded spilled features for subdivision");
        self.stats.features_reloaded += features.len() as u64;
        Ok(features)
    }

    fn commit_reload(&mut self, path: &str) -> Result<()> {
        let dir = node_dir(&self.base, path);
        if !OperationFileManifest::exists(&dir) {
            return Ok(());
        }
        self.supersede(&dir)?;
        self.stats.reloads += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpillConfig;
    use crate::error::StoreError;
    use crate::model::{Operation, OperationKind};
    use crate::spill::resource::ManualProbe;
    use crate::store::open_for_read;
    use std::time::Duration;
    use tempfile::TempDir;

    fn point(id: i64, x: f64, y: f64) -> Feature {
        Feature::new(
            id,
            ElementKind::Point,
            vec![Operation::new(id, ElementKind::Point, OperationKind::CreateNode, 1, 1, 1, 1).with_coordinate(x, y)],
        )
    }

    fn config(capacity: u64, tiers: Vec<(f64, u64)>) -> StoreConfig {
        StoreConfig {
            node_capacity: capacity,
            root_half_extent: (16.0, 16.0),
            spill: SpillConfig {
                ceiling: 0.5,
                tiers,
                backoff_factor: 2,
                max_backoff: 4,
                check_interval_ms: 0,
                ..SpillConfig::default()
            },
            ..StoreConfig::default()
        }
    }

    fn controller(base: &Path, config: &StoreConfig, probe: &ManualProbe) -> SpillController {
        SpillController::with_probe(base, config, Box::new(probe.clone())).with_flush_threads(2)
    }

    #[test]
    fn test_tier_threshold_schedule() {
        let tiers = SpillConfig::default().tiers;
        assert_eq!(tier_threshold(&tiers, 0.76), 50_000);
        assert_eq!(tier_threshold(&tiers, 0.85), 10_000);
        assert_eq!(tier_threshold(&tiers, 0.93), 1_000);
        assert_eq!(tier_threshold(&tiers, 3.0), 1);
        assert_eq!(tier_threshold(&[(0.9, 7)], 0.99), 7);
    }

    #[test]
    fn test_backoff_and_hysteresis() {
        let dir = TempDir::new().unwrap();
        let config = config(100, vec![(0.8, 8), (f64::MAX, 2)]);
        let probe = ManualProbe::new(1000);
        let mut spill = controller(dir.path(), &config, &probe);
        let mut tree = Quadtree::new(&config);
        let t0 = Instant::now();

        probe.set_fraction(0.3);
        assert_eq!(spill.maybe_spill_at(&mut tree, t0).unwrap(), SpillDecision::BelowCeiling);

        probe.set_fraction(0.7);
        let threshold_at = |d: SpillDecision| match d {
            SpillDecision::Flushed { threshold, .. } => threshold,
            other => panic!("expected flush, got {other:?}"),
        };
        assert_eq!(threshold_at(spill.maybe_spill_at(&mut tree, t0).unwrap()), 8);
        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(threshold_at(spill.maybe_spill_at(&mut tree, t1).unwrap()), 4);
        let t2 = t1 + Duration::from_secs(1);
        assert_eq!(threshold_at(spill.maybe_spill_at(&mut tree, t2).unwrap()), 2);
        // Backoff capped at 4: same threshold again is skipped.
        let t3 = t2 + Duration::from_secs(1);
        assert_eq!(
            spill.maybe_spill_at(&mut tree, t3).unwrap(),
            SpillDecision::Hysteresis { threshold: 2 }
        );
        assert_eq!(spill.backoff(), 4);

        // A quiet period resets the backoff and the hysteresis.
        let t4 = t3 + Duration::from_secs(120);
        assert_eq!(threshold_at(spill.maybe_spill_at(&mut tree, t4).unwrap()), 8);
        assert_eq!(spill.backoff(), 1);
        assert_eq!(spill.stats().skipped_hysteresis, 1);
    }

    #[test]
    fn test_check_interval_rate_limits_probing() {
        let dir = TempDir::new().unwrap();
        let mut config = config(100, vec![(f64::MAX, 1)]);
        config.spill.check_interval_ms = 1_000;
        let probe = ManualProbe::new(1000);
        let mut spill = controller(dir.path(), &config, &probe);
        let mut tree = Quadtree::new(&config);
        let t0 = Instant::now();
        assert_eq!(spill.maybe_spill_at(&mut tree, t0).unwrap(), SpillDecision::BelowCeiling);
        assert_eq!(
            spill.maybe_spill_at(&mut tree, t0 + Duration::from_millis(10)).unwrap(),
            SpillDecision::NotDue
        );
        assert_eq!(spill.stats().checks, 1);
    }

    #[test]
    fn test_spill_then_subdivide_reloads_and_supersedes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path();
        let config = config(4, vec![(f64::MAX, 1)]);
        let probe = ManualProbe::new(1000);
        let mut spill = controller(base, &config, &probe);
        let mut tree = Quadtree::new(&config);

        for (i, (x, y)) in [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)].into_iter().enumerate() {
            tree.insert(point(i as i64 + 1, x, y), &mut spill).unwrap();
        }
        probe.set_fraction(0.9);
        let decision = spill.maybe_spill_at(&mut tree, Instant::now()).unwrap();
        assert_eq!(decision, SpillDecision::Flushed { threshold: 1, nodes: 1, features: 4 });
        assert_eq!(tree.resident_count(), 0);
        assert_eq!(tree.len(), 4);
        assert!(OperationFileManifest::exists(&base.join("root")));
        assert!(IndexDocument::exists(base));

        tree.insert(point(5, 2.0, 2.0), &mut spill).unwrap();
        assert_eq!(spill.stats().reloads, 1);
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.resident_count(), 5);
        assert!(!OperationFileManifest::exists(&base.join("root")));
        assert!(base.join("root").join(SUPERSEDED_DIR_NAME).exists());
        tree.validate().unwrap();

        spill.checkpoint(&mut tree).unwrap();
        assert!(!base.join("root").join(SUPERSEDED_DIR_NAME).exists());
        assert_eq!(tree.resident_count(), 0);
        let ne: Vec<i64> = open_for_read(&base.join("root/NE"), ElementKind::Point, None, false, &config)
            .unwrap()
            .map(|f| f.unwrap().id())
            .collect();
        assert_eq!(ne, vec![2, 5]);
    }

    #[test]
    fn test_failed_reload_keeps_spilled_files() {
        let dir = TempDir::new().unwrap();
        let base = dir.path();
        let config = config(4, vec![(f64::MAX, 1)]);
        let probe = ManualProbe::new(1000);
        let mut spill = controller(base, &config, &probe);
        let mut tree = Quadtree::new(&config);
        for (i, (x, y)) in [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)].into_iter().enumerate() {
            tree.insert(point(i as i64 + 1, x, y), &mut spill).unwrap();
        }
        probe.set_fraction(0.9);
        spill.maybe_spill_at(&mut tree, Instant::now()).unwrap();
        tree.root.feature_count = 5;

        let err = tree.insert(point(5, 2.0, 2.0), &mut spill).unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent { expected: 5, found: 4, .. }), "got {err:?}");
        assert!(OperationFileManifest::exists(&base.join("root")));
        assert_eq!(spill.stats().reloads, 0);

        // GC after the failure must not touch the node's files.
        spill.checkpoint(&mut tree).unwrap();
        assert!(OperationFileManifest::exists(&base.join("root")));

        tree.root.feature_count = 4;
        tree.insert(point(5, 2.0, 2.0), &mut spill).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(spill.stats().reloads, 1);
        tree.validate().unwrap();
    }

    #[test]
    fn test_partial_flush_keeps_only_unwritten_kinds() {
        let dir = TempDir::new().unwrap();
        let base = dir.path();
        let config = config(100, vec![(f64::MAX, 1)]);
        let probe = ManualProbe::new(1000);
        let mut spill = controller(base, &config, &probe);
        let mut tree = Quadtree::new(&config);
        tree.insert(point(1, 1.0, 1.0), &mut spill).unwrap();
        let way = Feature::new(
            7,
            ElementKind::Line,
            vec![Operation::new(7, ElementKind::Line, OperationKind::CreateWay, 1, 1, 1, 1).with_coordinate(2.0, 2.0)],
        );
        tree.insert(way, &mut spill).unwrap();

        // A manifest naming a line shard that does not exist: points commit,
        // lines fail to open.
        let root_dir = base.join("root");
        let mut broken = crate::store::OperationFile::new(0, ElementKind::Line);
        broken.record_feature(3, 1);
        let mut manifest = OperationFileManifest::default();
        manifest.upsert(broken);
        manifest.write_to(&root_dir).unwrap();

        probe.set_fraction(0.9);
        let err = spill.maybe_spill_at(&mut tree, Instant::now()).unwrap_err();
        assert!(matches!(err, StoreError::MissingShard { .. }), "got {err:?}");

        let resident: Vec<(ElementKind, i64)> = tree.root().resident().iter().map(|f| (f.kind(), f.id())).collect();
        assert_eq!(resident, vec![(ElementKind::Line, 7)]);
        assert_eq!(tree.len(), 2);
        let points: Vec<i64> = open_for_read(&root_dir, ElementKind::Point, None, false, &config)
            .unwrap()
            .map(|f| f.unwrap().id())
            .collect();
        assert_eq!(points, vec![1]);
    }

    #[test]
    fn test_checkpoint_persists_straddlers_on_internal_nodes() {
        let dir = TempDir::new().unwrap();
        let config = config(1, vec![(f64::MAX, 1)]);
        let probe = ManualProbe::new(1000);
        let mut spill = controller(dir.path(), &config, &probe);
        let mut tree = Quadtree::new(&config);
        tree.insert(point(1, 3.0, 3.0), &mut spill).unwrap();
        tree.insert(point(2, 0.0, 0.0), &mut spill).unwrap();
        assert_eq!(tree.root().feature_count(), 1);

        // Regular spills only touch leaves.
        probe.set_fraction(0.9);
        spill.maybe_spill_at(&mut tree, Instant::now()).unwrap();
        assert_eq!(tree.root().resident_count(), 1);

        let (nodes, features) = spill.checkpoint(&mut tree).unwrap();
        assert_eq!((nodes, features), (1, 1));
        let root: Vec<i64> = open_for_read(&dir.path().join("root"), ElementKind::Point, None, false, &config)
            .unwrap()
            .map(|f| f.unwrap().id())
            .collect();
        assert_eq!(root, vec![2]);
    }
}
