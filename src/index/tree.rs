//! Adaptive quadtree over feature bounding boxes.
//!
//! Leaves accept features until they reach capacity, then subdivide into
//! four children. Features straddling a split line stay on the internal
//! node. The tree does no I/O: when a leaf that has spilled features must
//! subdivide, it asks a [`SpilledFeatureLoader`] for them first.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::index::node::{QuadNode, Quadrant};
use crate::model::{Feature, Region};

/// Pulls a node's spilled features back into memory.
///
/// Called synchronously from [`Quadtree::insert`] before a node with
/// spilled features subdivides. Implementations may block on disk reads.
/// `reload` must leave the on-disk copy untouched; the tree calls
/// `commit_reload` once the reloaded features reconcile with the node's
/// count, and only then is the on-disk copy superseded.
pub trait SpilledFeatureLoader {
    fn reload(&mut self, path: &str) -> Result<Vec<Feature>>;

    fn commit_reload(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }
}

/// Loader for trees that never spill.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpill;

impl SpilledFeatureLoader for NoSpill {
    fn reload(&mut self, _path: &str) -> Result<Vec<Feature>> {
        Ok(Vec::new())
    }
}

pub struct Quadtree {
    pub(crate) root: QuadNode,
    capacity: u64,
    max_level: u8,
    subdivisions: u64,
}

impl Quadtree {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_root(
            QuadNode::new_root(config.root_center, config.root_half_extent),
            config.node_capacity,
            config.max_level,
        )
    }

    pub(crate) fn with_root(root: QuadNode, capacity: u64, max_level: u8) -> Self {
        Self {
            root,
            capacity: capacity.max(1),
            max_level,
            subdivisions: 0,
        }
    }

    pub fn root(&self) -> &QuadNode {
        &self.root
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Subdivisions performed by this instance.
    pub fn subdivisions(&self) -> u64 {
        self.subdivisions
    }

    /// Features in the whole tree, resident or spilled.
    pub fn len(&self) -> u64 {
        self.root.subtree_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_count(&self) -> u64 {
        let mut n = 0;
        self.visit(&mut |node| n += node.resident_count());
        n
    }

    /// Insert a feature, returning the path of the node now holding it.
    ///
    /// Features without coordinates stay at the root.
    pub fn insert(&mut self, feature: Feature, loader: &mut dyn SpilledFeatureLoader) -> Result<String> {
        let capacity = self.capacity;
        let max_level = self.max_level;
        let mut subdivisions = 0;
        let result = insert_at(&mut self.root, feature, capacity, max_level, loader, &mut subdivisions);
        self.subdivisions += subdivisions;
        result
    }

    /// Insert many features; stops at the first error.
    pub fn insert_all<I>(&mut self, features: I, loader: &mut dyn SpilledFeatureLoader) -> Result<()>
    where
        I: IntoIterator<Item = Feature>,
    {
        for feature in features {
            self.insert(feature, loader)?;
        }
        Ok(())
    }

    pub fn node(&self, path: &str) -> Option<&QuadNode> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.child(Quadrant::from_name(segment)?)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut QuadNode> {
        let mut node = &mut self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let q = Quadrant::from_name(segment)?;
            node = &mut node.children.as_deref_mut()?[q as usize];
        }
        Some(node)
    }

    /// Leaf whose quadrant contains the point.
    pub fn locate(&self, x: f64, y: f64) -> &QuadNode {
        let mut node = &self.root;
        while let Some(children) = node.children() {
            node = &children[Quadrant::of_point(node.center, x, y) as usize];
        }
        node
    }

    /// Nodes whose area intersects `region`, pre-order. Internal nodes are
    /// included since they may hold straddling features. The root is
    /// always included: it also holds features without coordinates.
    pub fn nodes_intersecting(&self, region: &Region) -> Vec<&QuadNode> {
        let mut out = vec![&self.root];
        let mut stack: Vec<&QuadNode> = Vec::new();
        if let Some(children) = self.root.children() {
            stack.extend(children.iter().rev());
        }
        while let Some(node) = stack.pop() {
            if !region.intersects_bbox(&node.bounds()) {
                continue;
            }
            out.push(node);
            if let Some(children) = node.children() {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// Resident features whose bbox intersects `region`.
    pub fn features_in(&self, region: &Region) -> Vec<&Feature> {
        self.nodes_intersecting(region)
            .into_iter()
            .flat_map(|node| node.resident())
            .filter(|f| f.bbox().is_some_and(|b| region.intersects_bbox(b)))
            .collect()
    }

    /// Pre-order traversal.
    pub fn visit(&self, f: &mut dyn FnMut(&QuadNode)) {
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            f(node);
            if let Some(children) = node.children() {
                stack.extend(children.iter().rev());
            }
        }
    }

    /// Pre-order traversal with mutable access.
    pub fn visit_mut(&mut self, f: &mut dyn FnMut(&mut QuadNode)) {
        fn walk(node: &mut QuadNode, f: &mut dyn FnMut(&mut QuadNode)) {
            f(node);
            if let Some(children) = node.children.as_deref_mut() {
                for child in children.iter_mut() {
                    walk(child, f);
                }
            }
        }
        walk(&mut self.root, f);
    }

    /// Check structural invariants: every resident feature sits on the
    /// deepest node able to hold it, counts cover residents, and children
    /// tile their parent.
    pub fn validate(&self) -> Result<()> {
        let mut problem: Option<StoreError> = None;
        self.visit(&mut |node| {
            if problem.is_some() {
                return;
            }
            if node.resident_count() > node.feature_count {
                problem = Some(StoreError::Inconsistent {
                    path: node.path.clone(),
                    expected: node.feature_count,
                    found: node.resident_count(),
                });
                return;
            }
            if let Some(children) = node.children() {
                for f in node.resident() {
                    let fits = f.bbox().and_then(|b| Quadrant::strictly_containing(node.center, b));
                    if fits.is_some() {
                        problem = Some(StoreError::InvalidFormat(format!(
                            "feature {} on internal node '{}' fits a child",
                            f.id(),
                            node.path
                        )));
                        return;
                    }
                }
                for (q, child) in Quadrant::ALL.iter().zip(children.iter()) {
                    if child.level != node.level + 1 || child.path != node.child_path(*q) {
                        problem = Some(StoreError::InvalidFormat(format!(
                            "child '{}' of '{}' has wrong level or path",
                            child.path, node.path
                        )));
                        return;
                    }
                }
            }
            for f in node.resident() {
                if f.index_path() != Some(node.path.as_str()) {
                    problem = Some(StoreError::InvalidFormat(format!(
                        "feature {} records path {:?}, held by '{}'",
                        f.id(),
                        f.index_path(),
                        node.path
                    )));
                    return;
                }
            }
        });
        match problem {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn insert_at(
    node: &mut QuadNode,
    feature: Feature,
    capacity: u64,
    max_level: u8,
    loader: &mut dyn SpilledFeatureLoader,
    subdivisions: &mut u64,
) -> Result<String> {
    if node.is_leaf() {
        if node.feature_count < capacity || node.level >= max_level {
            node.push(feature);
            return Ok(node.path.clone());
        }
        subdivide(node, loader)?;
        *subdivisions += 1;
    }
    let target = feature
        .bbox()
        .and_then(|b| Quadrant::strictly_containing(node.center, b));
    if let (Some(q), Some(children)) = (target, node.children.as_deref_mut()) {
        return insert_at(&mut children[q as usize], feature, capacity, max_level, loader, subdivisions);
    }
    node.push(feature);
    Ok(node.path.clone())
}

/// Turn a full leaf into an internal node, reloading spilled features
/// first so nothing is left behind in the node's directory.
fn subdivide(node: &mut QuadNode, loader: &mut dyn SpilledFeatureLoader) -> Result<()> {
    let resident = node.resident_count();
    let mut features = std::mem::take(&mut node.resident);
    if resident < node.feature_count {
        let reloaded = match loader.reload(&node.path) {
            Ok(r) => r,
            Err(e) => {
                node.resident = features;
                return Err(e);
            }
        };
        let found = resident + reloaded.len() as u64;
        if found != node.feature_count {
            tracing::error!(
                path = %node.path,
                expected = node.feature_count,
                found,
                "reloaded features do not reconcile with node count"
            );
            node.resident = features;
            return Err(StoreError::Inconsistent {
                path: node.path.clone(),
                expected: node.feature_count,
                found,
            });
        }
        if let Err(e) = loader.commit_reload(&node.path) {
            node.resident = features;
            return Err(e);
        }
        features.extend(reloaded);
    }

    let mut children = node.make_children();
    node.feature_count = 0;
    for feature in features {
        match feature.bbox().and_then(|b| Quadrant::strictly_containing(node.center, b)) {
            Some(q) => children[q as usize].push(feature),
            None => node.push(feature),
        }
    }
    tracing::info!(
        path = %node.path,
        level = node.level,
        straddling = node.feature_count,
        children = ?children.iter().map(|c| c.feature_count).collect::<Vec<_>>(),
        "node subdivided"
    );
    node.children = Some(children);
    Ok(())
}
