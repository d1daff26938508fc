//! Self-delimiting frames around batches of delta-coded operations.
//!
//! A shard file is a plain concatenation of frames, readable as a pure
//! stream. Delta state carries across frame boundaries within one file.
//!
//! ## Frame layout
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic: b"HQ"
//! 2       1     version: u8 = 1
//! 3       1     element kind: u8
//! 4       2     op_count: u16 LE
//! 6       4     payload_len: u32 LE
//! 10      4     checksum: first 4 bytes of blake3(payload)
//! 14      N     payload
//! ```

use crate::codec::delta::DeltaState;
use crate::error::FrameError;
use crate::model::{ElementKind, Operation};

pub const FRAME_MAGIC: [u8; 2] = *b"HQ";

pub const FRAME_VERSION: u8 = 1;

pub const FRAME_HEADER_SIZE: usize = 14;

/// Upper bound on operations in one frame.
pub const MAX_OPS_PER_FRAME: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: ElementKind,
    pub op_count: u16,
    pub payload_len: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parse the header at `offset` within `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, FrameError> {
        let Some(bytes) = data.get(offset..offset + FRAME_HEADER_SIZE) else {
            return Err(FrameError::new(offset, "truncated frame header"));
        };
        if bytes[0..2] != FRAME_MAGIC {
            return Err(FrameError::new(
                offset,
                format!("bad frame magic {:02x}{:02x}", bytes[0], bytes[1]),
            ));
        }
        if bytes[2] != FRAME_VERSION {
            return Err(FrameError::new(
                offset,
                format!("unsupported frame version {}", bytes[2]),
            ));
        }
        let kind = ElementKind::from_u8(bytes[3])
            .ok_or_else(|| FrameError::new(offset, format!("unknown element kind {}", bytes[3])))?;
        let op_count = u16::from_le_bytes([bytes[4], bytes[5]]);
        let payload_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let checksum = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        Ok(Self {
            kind,
            op_count,
            payload_len,
            checksum,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&FRAME_MAGIC);
        out.push(FRAME_VERSION);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.op_count.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Encode `ops` (all of element `kind`) as one frame appended to `out`.
///
/// # Panics
///
/// Panics if `ops` holds more than `u16::MAX` operations.
pub fn encode_frame(kind: ElementKind, ops: &[Operation], state: &mut DeltaState, out: &mut Vec<u8>) {
    assert!(ops.len() <= u16::MAX as usize, "frame op count exceeds u16");
    let mut payload = Vec::with_capacity(ops.len() * 16);
    for op in ops {
        debug_assert_eq!(op.element, kind);
        state.encode_op(op, &mut payload);
    }
    let header = FrameHeader {
        kind,
        op_count: ops.len() as u16,
        payload_len: payload.len() as u32,
        checksum: checksum(&payload),
    };
    header.write_to(out);
    out.extend_from_slice(&payload);
}

/// A frame located inside a buffer; payload not yet decoded.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub offset: usize,
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Decode every operation, continuing from `state`.
    pub fn decode(&self, state: &mut DeltaState) -> Result<Vec<Operation>, FrameError> {
        let base = self.offset + FRAME_HEADER_SIZE;
        let mut ops = Vec::with_capacity(self.header.op_count as usize);
        let mut pos = 0;
        for _ in 0..self.header.op_count {
            let op = state
                .decode_op(self.header.kind, self.payload, &mut pos)
                .map_err(|e| FrameError::new(base + e.offset as usize, e.reason))?;
            ops.push(op);
        }
        if pos != self.payload.len() {
            return Err(FrameError::new(
                base + pos,
                format!("{} trailing payload bytes", self.payload.len() - pos),
            ));
        }
        Ok(ops)
    }
}

/// Sequential frame iterator over a byte buffer.
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    /// Start at a known frame boundary `pos`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos,
            failed: false,
        }
    }

    /// Byte offset of the next frame.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let offset = self.pos;
        let result = FrameHeader::parse(self.data, offset).and_then(|header| {
            let start = offset + FRAME_HEADER_SIZE;
            let end = start + header.payload_len as usize;
            let payload = self
                .data
                .get(start..end)
                .ok_or_else(|| FrameError::new(offset, "truncated frame payload"))?;
            if checksum(payload) != header.checksum {
                return Err(FrameError::new(offset, "frame checksum mismatch"));
            }
            Ok(Frame {
                offset,
                header,
                payload,
            })
        });
        match &result {
            Ok(frame) => self.pos = offset + FRAME_HEADER_SIZE + frame.payload.len(),
            // Never resynchronise past a corrupt frame.
            Err(_) => self.failed = true,
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationKind;

    fn ops(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| {
                Operation::new(i as i64, ElementKind::Line, OperationKind::AddWayNode, 3, 1000, 1, 1)
                    .with_reference(10 + i as i64, Some(i as u32))
            })
            .collect()
    }

    fn encoded(n: usize) -> Vec<u8> {
        let mut state = DeltaState::reset();
        let mut out = Vec::new();
        encode_frame(ElementKind::Line, &ops(n), &mut state, &mut out);
        out
    }

    #[test]
    fn test_frame_header_layout() {
        let out = encoded(3);
        assert_eq!(&out[0..2], b"HQ");
        assert_eq!(out[2], FRAME_VERSION);
        assert_eq!(out[3], ElementKind::Line as u8);
        assert_eq!(u16::from_le_bytes([out[4], out[5]]), 3);
        let len = u32::from_le_bytes([out[6], out[7], out[8], out[9]]) as usize;
        assert_eq!(out.len(), FRAME_HEADER_SIZE + len);
    }

    #[test]
    fn test_truncated_frame_reports_offset() {
        let mut data = encoded(5);
        let first_len = data.len();
        data.extend(encoded(5));
        data.truncate(first_len + 20);

        let mut reader = FrameReader::new(&data);
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert_eq!(err.offset, first_len as u64);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_corrupt_payload_detected_by_checksum() {
        let mut data = encoded(5);
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let err = FrameReader::new(&data).next().unwrap().unwrap_err();
        assert!(err.reason.contains("checksum"));
    }

    #[test]
    fn test_bad_magic() {
        let mut data = encoded(1);
        data[0] = b'X';
        let err = FrameReader::new(&data).next().unwrap().unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.reason.contains("magic"));
    }
}
