//! Feature: the ordered edit history of one map entity.

use super::geometry::BBox;
use super::operation::{ElementKind, Operation};

/// All operations sharing one (entity id, element kind) pair.
///
/// Assembled transiently on read and write; never mutated in place once
/// built. The bbox is derived from every coordinate in the history.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    id: i64,
    kind: ElementKind,
    operations: Vec<Operation>,
    bbox: Option<BBox>,
    /// Quadtree path of the node holding this feature, once indexed.
    index_path: Option<String>,
}

impl Feature {
    /// Build a feature, ordering operations by their history key.
    ///
    /// Operations belonging to another entity are a caller bug.
    pub fn new(id: i64, kind: ElementKind, mut operations: Vec<Operation>) -> Self {
        debug_assert!(
            operations.iter().all(|op| op.entity_id == id && op.element == kind),
            "feature operations must share (entity_id, element)"
        );
        operations.sort_by(|a, b| a.history_cmp(b));
        Self::from_sorted(id, kind, operations)
    }

    /// Build from operations already in history order (decoded streams).
    pub fn from_sorted(id: i64, kind: ElementKind, operations: Vec<Operation>) -> Self {
        let bbox = BBox::from_coordinates(operations.iter().filter_map(|op| op.coordinate.as_ref()));
        Self {
            id,
            kind,
            operations,
            bbox,
            index_path: None,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// None when no operation carries a coordinate; such features stay
    /// at the index root.
    pub fn bbox(&self) -> Option<&BBox> {
        self.bbox.as_ref()
    }

    pub fn index_path(&self) -> Option<&str> {
        self.index_path.as_deref()
    }

    pub(crate) fn set_index_path(&mut self, path: &str) {
        self.index_path = Some(path.to_string());
    }
}
