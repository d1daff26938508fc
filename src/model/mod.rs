//! Data model: operations, features and the geometry used to index them.

pub mod feature;
pub mod geometry;
pub mod operation;

pub use feature::Feature;
pub use geometry::{BBox, Polygon, Region};
pub use operation::{Coordinate, ElementKind, Operation, OperationKind, COORDINATE_SCALE};
