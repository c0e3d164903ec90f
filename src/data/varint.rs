//! Unsigned LEB128 varints
//!
//! Seven value bits per byte, high bit set on every byte except the last.
//! Used for key/value lengths in record headers, batch sequence prefixes,
//! and encoded record positions.

use bytes::BufMut;

/// Maximum encoded length of a u32
pub const MAX_VARINT_LEN32: usize = 5;

/// Maximum encoded length of a u64
pub const MAX_VARINT_LEN64: usize = 10;

/// Why a varint could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Buffer ended before the terminating byte
    Truncated,
    /// More continuation bytes than the target width allows
    Overflow,
}

/// Number of bytes `value` occupies once encoded
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` to `buf`
pub fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a u64, returning the value and the number of bytes read
pub fn decode_uvarint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN64 || (i == MAX_VARINT_LEN64 - 1 && byte > 1) {
            return Err(VarintError::Overflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }

    Err(VarintError::Truncated)
}

/// Decode a u32, rejecting encodings wider than five bytes
pub fn decode_uvarint32(buf: &[u8]) -> Result<(u32, usize), VarintError> {
    let limit = buf.len().min(MAX_VARINT_LEN32);
    match decode_uvarint(&buf[..limit]) {
        Ok((value, read)) => u32::try_from(value)
            .map(|v| (v, read))
            .map_err(|_| VarintError::Overflow),
        Err(VarintError::Truncated) if limit == MAX_VARINT_LEN32 => Err(VarintError::Overflow),
        Err(e) => Err(e),
    }
}
