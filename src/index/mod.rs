//! Adaptive quadtree spatial index.

pub mod document;
pub mod node;
pub mod tree;

pub use document::{IndexDocument, NodeDocument, INDEX_FILE_NAME};
pub use node::{node_dir, QuadNode, Quadrant, ROOT_DIR_NAME};
pub use tree::{NoSpill, Quadtree, SpilledFeatureLoader};
