//! Index build and read pipelines.
//!
//! `IndexBuilder` drives ingestion: insert features into the quadtree,
//! let the spill controller react to memory pressure after each batch, and
//! checkpoint everything at the end. `IndexReader` reopens a checkpointed
//! index and plans region / id-filtered reads over its node directories.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::index::{node_dir, IndexDocument, Quadtree};
use crate::model::{BBox, ElementKind, Feature, Region};
use crate::spill::{MemoryProbe, SpillController, SpillDecision, SpillStats};
use crate::store::{open_for_read, FeatureReader, IdFilter, OperationFileManifest, ParallelScan, ScanStats};

// ============================================================================
// Write pipeline
// ============================================================================

pub struct IndexBuilder {
    base: PathBuf,
    config: StoreConfig,
    tree: Quadtree,
    spill: SpillController,
}

impl IndexBuilder {
    /// Open `base` for building. An existing index is resumed from its
    /// document and stored config; otherwise `config` starts a new one.
    pub fn open(base: &Path, config: StoreConfig) -> Result<Self> {
        Self::open_with(base, config, None)
    }

    /// Like [`open`](Self::open) with a custom memory probe.
    pub fn open_with_probe(base: &Path, config: StoreConfig, probe: Box<dyn MemoryProbe>) -> Result<Self> {
        Self::open_with(base, config, Some(probe))
    }

    fn open_with(base: &Path, config: StoreConfig, probe: Option<Box<dyn MemoryProbe>>) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let (config, tree) = if IndexDocument::exists(base) {
            let stored = StoreConfig::read_from(base)?.unwrap_or(config);
            let tree = IndexDocument::read_from(base)?.into_tree(base)?;
            tracing::info!(base = %base.display(), features = tree.len(), "resuming index");
            (stored, tree)
        } else {
            config.validate()?;
            let tree = Quadtree::new(&config);
            (config, tree)
        };
        config.write_to(base)?;
        let spill = match probe {
            Some(probe) => SpillController::with_probe(base, &config, probe),
            None => SpillController::new(base, &config),
        };
        Ok(Self {
            base: base.to_path_buf(),
            config,
            tree,
            spill,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn tree(&self) -> &Quadtree {
        &self.tree
    }

    pub fn spill_stats(&self) -> &SpillStats {
        self.spill.stats()
    }

    /// Insert one feature without a memory check.
    pub fn insert(&mut self, feature: Feature) -> Result<String> {
        self.tree.insert(feature, &mut self.spill)
    }

    /// Insert a batch, then give the spill controller a chance to run.
    pub fn insert_batch<I>(&mut self, features: I) -> Result<SpillDecision>
    where
        I: IntoIterator<Item = Feature>,
    {
        for feature in features {
            self.tree.insert(feature, &mut self.spill)?;
        }
        self.spill.maybe_spill(&mut self.tree)
    }

    /// Persist every resident feature and the index document.
    pub fn checkpoint(&mut self) -> Result<()> {
        let (nodes, features) = self.spill.checkpoint(&mut self.tree)?;
        tracing::info!(base = %self.base.display(), nodes, features, total = self.tree.len(), "index checkpoint");
        Ok(())
    }

    /// Checkpoint and hand back the tree skeleton.
    pub fn finish(mut self) -> Result<Quadtree> {
        self.checkpoint()?;
        Ok(self.tree)
    }
}

// ============================================================================
// Read pipeline
// ============================================================================

/// One node directory selected for a read.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePlan {
    pub path: String,
    pub dir: PathBuf,
    pub feature_count: u64,
}

pub struct IndexReader {
    base: PathBuf,
    config: StoreConfig,
    tree: Quadtree,
}

impl IndexReader {
    pub fn open(base: &Path) -> Result<Self> {
        let config = StoreConfig::read_from(base)?.unwrap_or_default();
        let tree = IndexDocument::read_from(base)?.into_tree(base)?;
        Ok(Self {
            base: base.to_path_buf(),
            config,
            tree,
        })
    }

    pub fn tree(&self) -> &Quadtree {
        &self.tree
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Node directories holding features that may intersect `region`;
    /// every non-empty node when `region` is None.
    pub fn plan(&self, region: Option<&Region>) -> Vec<NodePlan> {
        let everything;
        let region = match region {
            Some(r) => r,
            None => {
                everything = Region::BBox(BBox::new(
                    f64::NEG_INFINITY,
                    f64::NEG_INFINITY,
                    f64::INFINITY,
                    f64::INFINITY,
                ));
                &everything
            }
        };
        let nodes = self.tree.nodes_intersecting(region);
        nodes
            .into_iter()
            .filter(|n| n.feature_count() > 0)
            .map(|n| NodePlan {
                path: n.path().to_string(),
                dir: node_dir(&self.base, n.path()),
                feature_count: n.feature_count(),
            })
            .collect()
    }

    /// Every feature stored for one node, read with a parallel scan.
    pub fn load_node(&self, path: &str) -> Result<Vec<Feature>> {
        let node = self
            .tree
            .node(path)
            .ok_or_else(|| StoreError::InvalidFormat(format!("no node at path '{path}'")))?;
        let dir = node_dir(&self.base, path);
        if node.feature_count() == 0 && !OperationFileManifest::exists(&dir) {
            return Ok(Vec::new());
        }
        let features = ParallelScan::start(&dir, None, &self.config)?.collect_all()?;
        if features.len() as u64 != node.feature_count() {
            tracing::warn!(
                path,
                expected = node.feature_count(),
                found = features.len(),
                "node feature count differs from stored features"
            );
        }
        Ok(features)
    }

    /// Stream features whose bbox intersects `region` (all features when
    /// None) and, with a filter, whose id is wanted.
    pub fn features(&self, region: Option<Region>, filter: Option<IdFilter>, constrained: bool) -> RegionQuery {
        let found = filter.as_ref().map_or_else(Vec::new, |f| vec![false; f.len()]);
        let mut pending = VecDeque::new();
        for plan in self.plan(region.as_ref()) {
            for kind in ElementKind::ALL {
                pending.push_back((plan.dir.clone(), kind));
            }
        }
        RegionQuery {
            config: self.config.clone(),
            region,
            filter,
            constrained,
            pending,
            current: None,
            stats: ScanStats::default(),
            found,
        }
    }
}

/// Iterator returned by [`IndexReader::features`].
pub struct RegionQuery {
    config: StoreConfig,
    region: Option<Region>,
    filter: Option<IdFilter>,
    constrained: bool,
    pending: VecDeque<(PathBuf, ElementKind)>,
    current: Option<FeatureReader>,
    stats: ScanStats,
    /// Wanted ids returned so far, across every node and kind.
    found: Vec<bool>,
}

impl RegionQuery {
    /// Counters of readers finished so far. `ids_not_found` is filled in
    /// once the query is exhausted.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    fn matches(&self, feature: &Feature) -> bool {
        match &self.region {
            None => true,
            Some(region) => feature.bbox().is_some_and(|b| region.intersects_bbox(b)),
        }
    }

    fn next_feature(&mut self) -> Result<Option<Feature>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next_feature()? {
                    Some(feature) => {
                        if self.matches(&feature) {
                            if let Some(filter) = &self.filter {
                                if let Ok(i) = filter.ids().binary_search(&feature.id()) {
                                    self.found[i] = true;
                                }
                            }
                            return Ok(Some(feature));
                        }
                        continue;
                    }
                    None => {
                        self.stats.merge(&ScanStats {
                            ids_not_found: 0,
                            ..reader.stats().clone()
                        });
                        self.current = None;
                    }
                }
            }
            let Some((dir, kind)) = self.pending.pop_front() else {
                self.stats.ids_not_found = self.found.iter().filter(|&&f| !f).count() as u64;
                return Ok(None);
            };
            self.current = Some(open_for_read(&dir, kind, self.filter.clone(), self.constrained, &self.config)?);
        }
    }
}

impl Iterator for RegionQuery {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_feature() {
            Ok(Some(f)) => Some(Ok(f)),
            Ok(None) => None,
            Err(e) => {
                self.pending.clear();
                self.current = None;
                Some(Err(e))
            }
        }
    }
}
