//! LEB128 variable-length integers and zigzag signed encoding.

use crate::error::FrameError;

/// Append `value` as LEB128.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 value starting at `*pos`, advancing past it.
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64, FrameError> {
    let start = *pos;
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let Some(&byte) = buf.get(*pos) else {
            return Err(FrameError::new(start, "truncated varint"));
        };
        *pos += 1;

        let payload = (byte & 0x7F) as u64;
        // The tenth byte carries bit 63 only and must end the value.
        if shift >= 63 && (payload > 1 || byte & 0x80 != 0) {
            return Err(FrameError::new(start, "varint overflow"));
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Maps 0 -> 0, -1 -> 1, 1 -> 2, -2 -> 3, ...
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}

/// Signed delta `new - prev` as a zigzag varint. Wrapping keeps extreme
/// jumps (e.g. i64::MIN to i64::MAX) lossless.
pub fn encode_delta(new: i64, prev: i64, buf: &mut Vec<u8>) {
    encode_varint(zigzag_encode(new.wrapping_sub(prev)), buf);
}

pub fn decode_delta(prev: i64, buf: &[u8], pos: &mut usize) -> Result<i64, FrameError> {
    let delta = zigzag_decode(decode_varint(buf, pos)?);
    Ok(prev.wrapping_add(delta))
}

/// Length-prefixed UTF-8 string.
pub fn encode_str(s: &str, buf: &mut Vec<u8>) {
    encode_varint(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

pub fn decode_str(buf: &[u8], pos: &mut usize) -> Result<String, FrameError> {
    let start = *pos;
    let len = decode_varint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| FrameError::new(start, "truncated string"))?;
    let s = std::str::from_utf8(&buf[*pos..end])
        .map_err(|_| FrameError::new(start, "invalid utf-8 in string"))?;
    *pos = end;
    Ok(s.to_string())
}
