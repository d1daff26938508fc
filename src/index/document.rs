//! Persisted index document.
//!
//! A single `index` file at the base directory stores the recursive node
//! metadata: split point, half-extent, level, path, `featureCount` and, for
//! internal nodes, the four children in NW, NE, SE, SW order. Resident
//! features are never part of the document; a reloaded tree starts with
//! every feature spilled.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::index::node::{QuadNode, Quadrant};
use crate::index::tree::Quadtree;

pub const INDEX_FILE_NAME: &str = "index";

pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDocument {
    pub center: (f64, f64),
    pub half_extent: (f64, f64),
    pub level: u8,
    pub path: String,
    pub feature_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<NodeDocument>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub version: u32,
    pub node_capacity: u64,
    pub max_level: u8,
    pub root: NodeDocument,
}

impl NodeDocument {
    fn from_node(node: &QuadNode) -> Self {
        Self {
            center: node.center,
            half_extent: node.half_extent,
            level: node.level,
            path: node.path.clone(),
            feature_count: node.feature_count,
            children: node
                .children()
                .map(|c| c.iter().map(NodeDocument::from_node).collect()),
        }
    }

    fn into_node(self, path: &Path, expected_path: &str, expected_level: u8) -> Result<QuadNode> {
        let invalid = |reason: String| StoreError::InvalidFormat(format!("{}: {reason}", path.display()));
        if self.path != expected_path || self.level != expected_level {
            return Err(invalid(format!(
                "node '{}' at level {} found where '{expected_path}' at level {expected_level} belongs",
                self.path, self.level
            )));
        }
        let mut node = QuadNode::new(self.center, self.half_extent, self.level, self.path);
        node.feature_count = self.feature_count;
        if let Some(children) = self.children {
            let children: [NodeDocument; 4] = children
                .try_into()
                .map_err(|v: Vec<NodeDocument>| invalid(format!("internal node '{}' has {} children", node.path, v.len())))?;
            let mut built = Vec::with_capacity(4);
            for (q, child) in Quadrant::ALL.into_iter().zip(children) {
                built.push(child.into_node(path, &node.child_path(q), node.level + 1)?);
            }
            let built: [QuadNode; 4] = built
                .try_into()
                .map_err(|_| invalid("child count changed while rebuilding".into()))?;
            node.children = Some(Box::new(built));
        }
        Ok(node)
    }
}

impl IndexDocument {
    pub fn from_tree(tree: &Quadtree) -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            node_capacity: tree.capacity(),
            max_level: tree.max_level(),
            root: NodeDocument::from_node(tree.root()),
        }
    }

    pub fn path(base: &Path) -> PathBuf {
        base.join(INDEX_FILE_NAME)
    }

    pub fn exists(base: &Path) -> bool {
        Self::path(base).exists()
    }

    /// Rebuild the tree skeleton: structure and counts, no resident features.
    pub fn into_tree(self, base: &Path) -> Result<Quadtree> {
        let path = Self::path(base);
        let root = self.root.into_node(&path, "", 0)?;
        Ok(Quadtree::with_root(root, self.node_capacity, self.max_level))
    }

    pub fn read_from(base: &Path) -> Result<Self> {
        let path = Self::path(base);
        let contents = std::fs::read_to_string(&path)?;
        let doc: Self = serde_json::from_str(&contents)
            .map_err(|e| StoreError::InvalidFormat(format!("{}: {e}", path.display())))?;
        if doc.version != INDEX_FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "{}: unsupported index version {}",
                path.display(),
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Atomic write: temp file + rename.
    pub fn write_to(&self, base: &Path) -> Result<()> {
        std::fs::create_dir_all(base)?;
        let tmp = base.join(format!("{INDEX_FILE_NAME}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, Self::path(base))?;
        Ok(())
    }
}
