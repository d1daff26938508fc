//! Edit operations: the atomic records of a feature's history.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

// ── Element Kind ───────────────────────────────────────────────────

/// Geometry kind of the entity an operation belongs to.
///
/// Each kind gets its own shard files, so the kind is carried by the file
/// (and frame header), not by every encoded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementKind {
    Point = 0,
    Line = 1,
    Relation = 2,
}

impl ElementKind {
    pub const ALL: [ElementKind; 3] = [ElementKind::Point, ElementKind::Line, ElementKind::Relation];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Point),
            1 => Some(Self::Line),
            2 => Some(Self::Relation),
            _ => None,
        }
    }

    /// Single-letter prefix used in shard file names (`operation_n_3`).
    pub fn file_prefix(self) -> char {
        match self {
            ElementKind::Point => 'n',
            ElementKind::Line => 'w',
            ElementKind::Relation => 'r',
        }
    }
}

// ── Operation Kind ─────────────────────────────────────────────────

/// Kind of edit. The wire id is fixed; the hierarchy level is only used
/// for ordering ties and is never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    CreateNode,
    DeleteNode,
    RestoreNode,
    MoveNode,
    AddTag,
    RemoveTag,
    ChangeTagValue,
    CreateWay,
    DeleteWay,
    RestoreWay,
    AddWayNode,
    RemoveWayNode,
    ReorderWayNode,
    MoveWayNode,
    CreateRelation,
    DeleteRelation,
    RestoreRelation,
    AddMember,
    RemoveMember,
    ChangeMemberRole,
    ReorderMember,
    MemberGeometryChange,
    CloseWay,
    OpenWay,
    RenameTagKey,
    ReplaceWayNode,
    ReplaceMember,
    Touch,
}

const KINDS_BY_WIRE_ID: [OperationKind; 28] = [
    OperationKind::CreateNode,
    OperationKind::DeleteNode,
    OperationKind::RestoreNode,
    OperationKind::MoveNode,
    OperationKind::AddTag,
    OperationKind::RemoveTag,
    OperationKind::ChangeTagValue,
    OperationKind::CreateWay,
    OperationKind::DeleteWay,
    OperationKind::RestoreWay,
    OperationKind::AddWayNode,
    OperationKind::RemoveWayNode,
    OperationKind::ReorderWayNode,
    OperationKind::MoveWayNode,
    OperationKind::CreateRelation,
    OperationKind::DeleteRelation,
    OperationKind::RestoreRelation,
    OperationKind::AddMember,
    OperationKind::RemoveMember,
    OperationKind::ChangeMemberRole,
    OperationKind::ReorderMember,
    OperationKind::MemberGeometryChange,
    OperationKind::CloseWay,
    OperationKind::OpenWay,
    OperationKind::RenameTagKey,
    OperationKind::ReplaceWayNode,
    OperationKind::ReplaceMember,
    OperationKind::Touch,
];

impl OperationKind {
    pub const COUNT: usize = KINDS_BY_WIRE_ID.len();

    /// Fixed on-disk identifier.
    pub fn wire_id(self) -> u8 {
        // Position in KINDS_BY_WIRE_ID; the table and the enum share order.
        self as u8
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        KINDS_BY_WIRE_ID.get(id as usize).copied()
    }

    /// Tie-break rank: higher levels sort first among operations with the
    /// same version and timestamp (a creation precedes its tags).
    pub fn hierarchy_level(self) -> u8 {
        use OperationKind::*;
        match self {
            CreateNode | DeleteNode | RestoreNode | CreateWay | DeleteWay | RestoreWay
            | CreateRelation | DeleteRelation | RestoreRelation => 4,
            AddWayNode | RemoveWayNode | ReorderWayNode | ReplaceWayNode | CloseWay | OpenWay
            | AddMember | RemoveMember | ChangeMemberRole | ReorderMember | ReplaceMember => 3,
            MoveNode | MoveWayNode | MemberGeometryChange => 2,
            AddTag | RemoveTag | ChangeTagValue | RenameTagKey => 1,
            Touch => 0,
        }
    }
}

// ── Coordinate ─────────────────────────────────────────────────────

/// Scale of the fixed-point coordinate representation (1e-7 degrees).
pub const COORDINATE_SCALE: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinate {
    /// Snapped to the 1e-7 degree grid, so a coordinate built in memory
    /// equals the one decoded from disk.
    pub fn new(lon: f64, lat: f64) -> Self {
        Self::from_fixed(to_fixed(lon), to_fixed(lat))
    }

    /// Round to the 1e-7 degree grid the wire format stores.
    pub fn to_fixed(self) -> (i64, i64) {
        (to_fixed(self.lon), to_fixed(self.lat))
    }

    pub fn from_fixed(lon: i64, lat: i64) -> Self {
        Self {
            lon: lon as f64 / COORDINATE_SCALE,
            lat: lat as f64 / COORDINATE_SCALE,
        }
    }
}

#[inline]
fn to_fixed(v: f64) -> i64 {
    (v * COORDINATE_SCALE).round() as i64
}

// ── Operation ──────────────────────────────────────────────────────

/// One atomic edit. Write-once: later edits append new operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub entity_id: i64,
    pub element: ElementKind,
    pub kind: OperationKind,
    pub contributor: i64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub changeset: i64,
    pub version: i32,
    pub coordinate: Option<Coordinate>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub reference_id: Option<i64>,
    pub position: Option<u32>,
}

impl Operation {
    /// Operation with every optional field unset.
    pub fn new(
        entity_id: i64,
        element: ElementKind,
        kind: OperationKind,
        contributor: i64,
        timestamp: i64,
        changeset: i64,
        version: i32,
    ) -> Self {
        Self {
            entity_id,
            element,
            kind,
            contributor,
            timestamp,
            changeset,
            version,
            coordinate: None,
            key: None,
            value: None,
            reference_id: None,
            position: None,
        }
    }

    pub fn with_coordinate(mut self, lon: f64, lat: f64) -> Self {
        self.coordinate = Some(Coordinate::new(lon, lat));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self.value = Some(value.into());
        self
    }

    pub fn with_reference(mut self, reference_id: i64, position: Option<u32>) -> Self {
        self.reference_id = Some(reference_id);
        self.position = position;
        self
    }

    /// (version asc, timestamp asc, hierarchy level desc).
    pub fn ordering_key(&self) -> (i32, i64, std::cmp::Reverse<u8>) {
        (
            self.version,
            self.timestamp,
            std::cmp::Reverse(self.kind.hierarchy_level()),
        )
    }

    pub fn history_cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}
