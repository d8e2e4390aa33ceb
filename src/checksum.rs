//! XXH3-64 region hashing and base-128 VarInt encoding.
//!
//! XXH3-64 backs every integrity check in this crate: shard header, shard
//! regions, WAL block bodies, and the manifest. VarInt backs WAL length
//! prefixes for inlined long strings.

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarIntError {
    #[error("varint exceeds 10 bytes without a terminating byte")]
    Malformed,
    #[error("unexpected end of input while decoding varint")]
    Truncated,
}

/// Hashes `bytes` with XXH3-64.
pub fn xxh3_of(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Encodes `value` as a base-128 VarInt with MSB continuation, appending to `out`.
pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
            out.push(byte);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Decodes a VarInt from the front of `input`, returning the value and the
/// number of bytes consumed.
pub fn read_varint(input: &[u8]) -> Result<(u64, usize), VarIntError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in input.iter().enumerate() {
        if shift >= 63 && byte > 1 {
            return Err(VarIntError::Malformed);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(VarIntError::Malformed);
        }
    }
    Err(VarIntError::Truncated)
}
