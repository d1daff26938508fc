//! Sparse delta coding of individual operations.
//!
//! Every field is compared with the value last emitted on the same stream.
//! Unchanged fields are omitted entirely; a per-operation flag word says
//! which fields follow. Numeric fields that drift slowly (entity id,
//! timestamp, changeset, reference id, fixed-point lon/lat) are written as
//! zigzag deltas against the last emitted value; the rest are written raw.
//!
//! ## Operation layout
//!
//! ```text
//! [flags: varint]
//! [entity_id delta]        if F_ENTITY
//! [kind wire id: u8]       if F_KIND
//! [contributor: zigzag]    if F_CONTRIBUTOR
//! [timestamp delta]        if F_TIMESTAMP
//! [changeset delta]        if F_CHANGESET
//! [version: zigzag]        if F_VERSION
//! [lon delta]              if F_LON      (requires F_COORD)
//! [lat delta]              if F_LAT      (requires F_COORD)
//! [key: len + utf8]        if F_KEY
//! [value: len + utf8]      if F_VALUE
//! [reference delta]        if F_REF_DELTA (requires F_REF)
//! [position: varint]       if F_POSITION
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::varint::*;
use crate::error::FrameError;
use crate::model::{Coordinate, ElementKind, Operation, OperationKind};

const F_ENTITY: u64 = 1 << 0;
const F_KIND: u64 = 1 << 1;
const F_CONTRIBUTOR: u64 = 1 << 2;
const F_TIMESTAMP: u64 = 1 << 3;
const F_CHANGESET: u64 = 1 << 4;
const F_VERSION: u64 = 1 << 5;
const F_COORD: u64 = 1 << 6;
const F_LON: u64 = 1 << 7;
const F_LAT: u64 = 1 << 8;
const F_KEY: u64 = 1 << 9;
const F_VALUE: u64 = 1 << 10;
const F_REF: u64 = 1 << 11;
const F_REF_DELTA: u64 = 1 << 12;
const F_POSITION: u64 = 1 << 13;
const F_ALL: u64 = (1 << 14) - 1;

/// Last emitted absolute value of every delta-coded field.
///
/// Starts zeroed for a fresh file. When a file is reopened for appending,
/// the state saved in its manifest entry is restored instead, so the
/// continuation decodes identically to an uninterrupted stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaState {
    pub entity_id: i64,
    /// None until the first operation of the stream.
    pub kind: Option<u8>,
    pub contributor: i64,
    pub timestamp: i64,
    pub changeset: i64,
    pub version: i32,
    pub reference_id: i64,
    pub lon: i64,
    pub lat: i64,
}

impl DeltaState {
    pub fn reset() -> Self {
        Self::default()
    }

    /// Append one operation to `buf`, advancing the stream state.
    pub fn encode_op(&mut self, op: &Operation, buf: &mut Vec<u8>) {
        let kind_id = op.kind.wire_id();
        let fixed = op.coordinate.map(Coordinate::to_fixed);

        let mut flags = 0u64;
        if op.entity_id != self.entity_id {
            flags |= F_ENTITY;
        }
        if self.kind != Some(kind_id) {
            flags |= F_KIND;
        }
        if op.contributor != self.contributor {
            flags |= F_CONTRIBUTOR;
        }
        if op.timestamp != self.timestamp {
            flags |= F_TIMESTAMP;
        }
        if op.changeset != self.changeset {
            flags |= F_CHANGESET;
        }
        if op.version != self.version {
            flags |= F_VERSION;
        }
        if let Some((lon, lat)) = fixed {
            flags |= F_COORD;
            if lon != self.lon {
                flags |= F_LON;
            }
            if lat != self.lat {
                flags |= F_LAT;
            }
        }
        if op.key.is_some() {
            flags |= F_KEY;
        }
        if op.value.is_some() {
            flags |= F_VALUE;
        }
        if let Some(r) = op.reference_id {
            flags |= F_REF;
            if r != self.reference_id {
                flags |= F_REF_DELTA;
            }
        }
        if op.position.is_some() {
            flags |= F_POSITION;
        }

        encode_varint(flags, buf);

        if flags & F_ENTITY != 0 {
            encode_delta(op.entity_id, self.entity_id, buf);
            self.entity_id = op.entity_id;
        }
        if flags & F_KIND != 0 {
            buf.push(kind_id);
            self.kind = Some(kind_id);
        }
        if flags & F_CONTRIBUTOR != 0 {
            encode_varint(zigzag_encode(op.contributor), buf);
            self.contributor = op.contributor;
        }
        if flags & F_TIMESTAMP != 0 {
            encode_delta(op.timestamp, self.timestamp, buf);
            self.timestamp = op.timestamp;
        }
        if flags & F_CHANGESET != 0 {
            encode_delta(op.changeset, self.changeset, buf);
            self.changeset = op.changeset;
        }
        if flags & F_VERSION != 0 {
            encode_varint(zigzag_encode(op.version as i64), buf);
            self.version = op.version;
        }
        if let Some((lon, lat)) = fixed {
            if flags & F_LON != 0 {
                encode_delta(lon, self.lon, buf);
                self.lon = lon;
            }
            if flags & F_LAT != 0 {
                encode_delta(lat, self.lat, buf);
                self.lat = lat;
            }
        }
        if let Some(key) = &op.key {
            encode_str(key, buf);
        }
        if let Some(value) = &op.value {
            encode_str(value, buf);
        }
        if let Some(r) = op.reference_id {
            if flags & F_REF_DELTA != 0 {
                encode_delta(r, self.reference_id, buf);
                self.reference_id = r;
            }
        }
        if let Some(p) = op.position {
            encode_varint(p as u64, buf);
        }
    }

    /// Decode one operation at `*pos`, advancing the stream state.
    pub fn decode_op(
        &mut self,
        element: ElementKind,
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Operation, FrameError> {
        let start = *pos;
        let flags = decode_varint(buf, pos)?;
        if flags & !F_ALL != 0 {
            return Err(FrameError::new(start, format!("unknown field flags {flags:#x}")));
        }
        if flags & (F_LON | F_LAT) != 0 && flags & F_COORD == 0 {
            return Err(FrameError::new(start, "coordinate delta without coordinate"));
        }
        if flags & F_REF_DELTA != 0 && flags & F_REF == 0 {
            return Err(FrameError::new(start, "reference delta without reference"));
        }

        if flags & F_ENTITY != 0 {
            self.entity_id = decode_delta(self.entity_id, buf, pos)?;
        }
        if flags & F_KIND != 0 {
            let Some(&id) = buf.get(*pos) else {
                return Err(FrameError::new(*pos, "truncated operation kind"));
            };
            *pos += 1;
            self.kind = Some(id);
        }
        let kind = self
            .kind
            .ok_or_else(|| FrameError::new(start, "operation kind never set on stream"))
            .and_then(|id| {
                OperationKind::from_wire_id(id)
                    .ok_or_else(|| FrameError::new(start, format!("unknown operation kind {id}")))
            })?;
        if flags & F_CONTRIBUTOR != 0 {
            self.contributor = zigzag_decode(decode_varint(buf, pos)?);
        }
        if flags & F_TIMESTAMP != 0 {
            self.timestamp = decode_delta(self.timestamp, buf, pos)?;
        }
        if flags & F_CHANGESET != 0 {
            self.changeset = decode_delta(self.changeset, buf, pos)?;
        }
        if flags & F_VERSION != 0 {
            let at = *pos;
            let v = zigzag_decode(decode_varint(buf, pos)?);
            self.version =
                i32::try_from(v).map_err(|_| FrameError::new(at, "version out of range"))?;
        }
        let coordinate = if flags & F_COORD != 0 {
            if flags & F_LON != 0 {
                self.lon = decode_delta(self.lon, buf, pos)?;
            }
            if flags & F_LAT != 0 {
                self.lat = decode_delta(self.lat, buf, pos)?;
            }
            Some(Coordinate::from_fixed(self.lon, self.lat))
        } else {
            None
        };
        let key = if flags & F_KEY != 0 {
            Some(decode_str(buf, pos)?)
        } else {
            None
        };
        let value = if flags & F_VALUE != 0 {
            Some(decode_str(buf, pos)?)
        } else {
            None
        };
        let reference_id = if flags & F_REF != 0 {
            if flags & F_REF_DELTA != 0 {
                self.reference_id = decode_delta(self.reference_id, buf, pos)?;
            }
            Some(self.reference_id)
        } else {
            None
        };
        let position = if flags & F_POSITION != 0 {
            let at = *pos;
            let p = decode_varint(buf, pos)?;
            Some(u32::try_from(p).map_err(|_| FrameError::new(at, "position out of range"))?)
        } else {
            None
        };

        Ok(Operation {
            entity_id: self.entity_id,
            element,
            kind,
            contributor: self.contributor,
            timestamp: self.timestamp,
            changeset: self.changeset,
            version: self.version,
            coordinate,
            key,
            value,
            reference_id,
            position,
        })
    }
}
