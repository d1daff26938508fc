//! histdb: disk-backed spatial index for map feature edit histories.
//!
//! Operations are grouped into features, delta-encoded into framed shard
//! files (one directory per quadtree node) and indexed by an adaptive
//! quadtree that spills cold leaves to disk under memory pressure.

pub mod builder;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod spill;
pub mod store;

pub use builder::{IndexBuilder, IndexReader, NodePlan, RegionQuery};
pub use config::{ScanConfig, SpillConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use index::{Quadtree, SpilledFeatureLoader};
pub use model::{BBox, Coordinate, ElementKind, Feature, Operation, OperationKind, Polygon, Region};
pub use spill::{SpillController, SpillDecision};
pub use store::{open_for_read, IdFilter, OperationFileWriter, ParallelScan, ScanStats};
