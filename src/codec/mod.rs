//! Delta codec for batches of operations.
//!
//! `encode` / `decode` work on a standalone stream starting from a reset
//! [`DeltaState`]; the file store drives [`encode_frame`] and
//! [`FrameReader`] directly so it can resume a saved state.

pub mod delta;
pub mod frame;
pub mod varint;

pub use delta::DeltaState;
pub use frame::{encode_frame, Frame, FrameHeader, FrameReader, FRAME_HEADER_SIZE, MAX_OPS_PER_FRAME};

use crate::error::FrameError;
use crate::model::Operation;

/// Encode a batch as consecutive frames of at most [`MAX_OPS_PER_FRAME`]
/// operations. A new frame also starts whenever the element kind changes.
pub fn encode(batch: &[Operation]) -> Vec<u8> {
    let mut state = DeltaState::reset();
    let mut out = Vec::new();
    encode_with(batch, &mut state, MAX_OPS_PER_FRAME, &mut out);
    out
}

/// Encode continuing from `state`, appending to `out`.
pub fn encode_with(batch: &[Operation], state: &mut DeltaState, ops_per_frame: usize, out: &mut Vec<u8>) {
    let ops_per_frame = ops_per_frame.clamp(1, u16::MAX as usize);
    let mut start = 0;
    while start < batch.len() {
        let kind = batch[start].element;
        let mut end = start + 1;
        while end < batch.len() && end - start < ops_per_frame && batch[end].element == kind {
            end += 1;
        }
        encode_frame(kind, &batch[start..end], state, out);
        start = end;
    }
}

/// Decode every frame in `bytes` from a reset state.
pub fn decode(bytes: &[u8]) -> Result<Vec<Operation>, FrameError> {
    let mut state = DeltaState::reset();
    let mut ops = Vec::new();
    for frame in FrameReader::new(bytes) {
        ops.extend(frame?.decode(&mut state)?);
    }
    Ok(ops)
}
