//! Low-level string helpers shared by the record decoders.
//!
//! TDS strings are UTF-16LE with either a one-byte (`B_VARCHAR`) or two-byte
//! (`US_VARCHAR`) character-count prefix.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Read a UTF-16LE string with a 1-byte character count.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string with a 2-byte character count.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read `char_count` UTF-16LE code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    let byte_count = char_count * 2;
    if src.remaining() < byte_count {
        return Err(ProtocolError::IncompletePacket {
            expected: byte_count,
            actual: src.remaining(),
        });
    }

    let units: Vec<u16> = (0..char_count).map(|_| src.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Decode a byte slice holding UTF-16LE code units with no length prefix.
///
/// An odd byte count cannot be UTF-16 and is rejected.
pub fn utf16_from_bytes(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding(format!(
            "odd UTF-16 byte count {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Write a UTF-16LE string with a 1-byte character count (truncated to 255).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(u8::MAX as usize).collect();
    dst.put_u8(units.len() as u8);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

/// Write a UTF-16LE string with a 2-byte character count (truncated to 65535).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(u16::MAX as usize).collect();
    dst.put_u16_le(units.len() as u16);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

/// Byte length of `s` once encoded as UTF-16.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}
