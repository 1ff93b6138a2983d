//! Unsigned LEB128 varints: seven payload bits per byte, high bit set on every
//! byte except the last.

use super::{CodecError, CodecResult};

const MAX_VARINT_BYTES: usize = 10;

/// Append `value` to `buf` as a varint.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint, returning (value, bytes_consumed).
#[inline]
pub fn decode_varint(buf: &[u8]) -> CodecResult<(u64, usize)> {
    let mut result: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_BYTES) {
        let payload = u64::from(byte & 0x7F);
        // The tenth byte may only contribute the single top bit.
        if i == MAX_VARINT_BYTES - 1 && payload > 1 {
            return Err(CodecError::VarintOverflow);
        }
        result |= payload << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        Err(CodecError::VarintOverflow)
    } else {
        Err(CodecError::IncompleteVarint)
    }
}

/// Encoded size of `value` without encoding it.
#[inline]
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
