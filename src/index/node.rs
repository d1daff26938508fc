//! Quadtree nodes and quadrant geometry.

use std::path::{Path, PathBuf};

use crate::model::{BBox, Feature};

/// Directory under the index base holding the root node.
pub const ROOT_DIR_NAME: &str = "root";

/// Child slot of an internal node. Array order is NW, NE, SE, SW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    NW = 0,
    NE = 1,
    SE = 2,
    SW = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [Quadrant::NW, Quadrant::NE, Quadrant::SE, Quadrant::SW];

    pub fn name(self) -> &'static str {
        match self {
            Quadrant::NW => "NW",
            Quadrant::NE => "NE",
            Quadrant::SE => "SE",
            Quadrant::SW => "SW",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.name() == name)
    }

    /// Unit direction of the child centre from the parent centre.
    fn sign(self) -> (f64, f64) {
        match self {
            Quadrant::NW => (-1.0, 1.0),
            Quadrant::NE => (1.0, 1.0),
            Quadrant::SE => (1.0, -1.0),
            Quadrant::SW => (-1.0, -1.0),
        }
    }

    /// Standard comparison against a split point. Points on a split line
    /// go east / north.
    pub fn of_point(center: (f64, f64), x: f64, y: f64) -> Self {
        match (x >= center.0, y >= center.1) {
            (false, true) => Quadrant::NW,
            (true, true) => Quadrant::NE,
            (true, false) => Quadrant::SE,
            (false, false) => Quadrant::SW,
        }
    }

    /// Quadrant containing `bbox` strictly, None if it touches or crosses
    /// either split line.
    pub fn strictly_containing(center: (f64, f64), bbox: &BBox) -> Option<Self> {
        let west = bbox.max_x < center.0;
        let east = bbox.min_x > center.0;
        let south = bbox.max_y < center.1;
        let north = bbox.min_y > center.1;
        match (west, east, north, south) {
            (true, _, true, _) => Some(Quadrant::NW),
            (_, true, true, _) => Some(Quadrant::NE),
            (_, true, _, true) => Some(Quadrant::SE),
            (true, _, _, true) => Some(Quadrant::SW),
            _ => None,
        }
    }
}

/// One node of the adaptive quadtree.
///
/// `feature_count` is authoritative: it counts every feature held directly
/// by this node, resident in memory or spilled to its directory. For a
/// leaf that is everything in its quadrant; for an internal node it is the
/// features straddling its split lines.
#[derive(Debug, Clone)]
pub struct QuadNode {
    pub(crate) center: (f64, f64),
    pub(crate) half_extent: (f64, f64),
    pub(crate) level: u8,
    pub(crate) path: String,
    pub(crate) feature_count: u64,
    pub(crate) resident: Vec<Feature>,
    pub(crate) children: Option<Box<[QuadNode; 4]>>,
}

impl QuadNode {
    pub fn new_root(center: (f64, f64), half_extent: (f64, f64)) -> Self {
        Self::new(center, half_extent, 0, String::new())
    }

    pub(crate) fn new(center: (f64, f64), half_extent: (f64, f64), level: u8, path: String) -> Self {
        Self {
            center,
            half_extent,
            level,
            path,
            feature_count: 0,
            resident: Vec::new(),
            children: None,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        self.center
    }

    pub fn half_extent(&self) -> (f64, f64) {
        self.half_extent
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Slash-separated quadrant names from the root; "" for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn feature_count(&self) -> u64 {
        self.feature_count
    }

    pub fn resident(&self) -> &[Feature] {
        &self.resident
    }

    pub fn resident_count(&self) -> u64 {
        self.resident.len() as u64
    }

    pub fn spilled_count(&self) -> u64 {
        self.feature_count.saturating_sub(self.resident_count())
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn children(&self) -> Option<&[QuadNode; 4]> {
        self.children.as_deref()
    }

    pub fn child(&self, q: Quadrant) -> Option<&QuadNode> {
        self.children.as_ref().map(|c| &c[q as usize])
    }

    /// Area covered by this node.
    pub fn bounds(&self) -> BBox {
        BBox::new(
            self.center.0 - self.half_extent.0,
            self.center.1 - self.half_extent.1,
            self.center.0 + self.half_extent.0,
            self.center.1 + self.half_extent.1,
        )
    }

    /// Features in the subtree rooted here, resident or spilled.
    pub fn subtree_count(&self) -> u64 {
        let below: u64 = self
            .children()
            .map(|c| c.iter().map(QuadNode::subtree_count).sum())
            .unwrap_or(0);
        self.feature_count + below
    }

    pub(crate) fn child_path(&self, q: Quadrant) -> String {
        if self.path.is_empty() {
            q.name().to_string()
        } else {
            format!("{}/{}", self.path, q.name())
        }
    }

    /// Four empty children, half the extent, offset by half the extent.
    pub(crate) fn make_children(&self) -> Box<[QuadNode; 4]> {
        let half = (self.half_extent.0 / 2.0, self.half_extent.1 / 2.0);
        let child = |q: Quadrant| {
            let (sx, sy) = q.sign();
            QuadNode::new(
                (self.center.0 + sx * half.0, self.center.1 + sy * half.1),
                half,
                self.level + 1,
                self.child_path(q),
            )
        };
        Box::new(Quadrant::ALL.map(child))
    }

    /// Hold `feature` directly on this node.
    pub(crate) fn push(&mut self, mut feature: Feature) {
        feature.set_index_path(&self.path);
        self.resident.push(feature);
        self.feature_count += 1;
    }
}

/// Directory of the node at `path` under the index base directory.
pub fn node_dir(base: &Path, path: &str) -> PathBuf {
    let mut dir = base.join(ROOT_DIR_NAME);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        dir.push(segment);
    }
    dir
}
