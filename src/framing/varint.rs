//! Variable-length integers: 7-bit groups, least significant first, 0x80 continuation bit.

use bytes::BufMut;

use crate::error::ProtocolError;

/// Maximum number of bytes in an encoded var-int.
pub const MAX_VARINT_LEN: usize = 5;

/// Resumable var-int decoder; feed it slices until [`VarIntDecoder::is_complete`].
#[derive(Debug, Clone, Default)]
pub struct VarIntDecoder {
    value: u32,
    index: usize,
    complete: bool,
}

impl VarIntDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes until the value is complete. Returns the number of bytes consumed.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        if self.complete {
            return Err(ProtocolError::DecodePastEnd);
        }
        let mut consumed = 0;
        for &next in bytes {
            consumed += 1;
            if self.index == MAX_VARINT_LEN - 1 && next & 0xF0 != 0 {
                return Err(ProtocolError::SizeTooLarge);
            }
            self.value |= u32::from(next & 0x7F) << (self.index * 7);
            self.index += 1;
            if next & 0x80 == 0 {
                self.complete = true;
                break;
            }
        }
        Ok(consumed)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Decoded value; only meaningful once complete.
    pub fn value(&self) -> u32 {
        debug_assert!(self.complete, "var-int read before completion");
        self.value
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append the var-int encoding of `value`.
pub fn encode(mut value: u32, out: &mut impl BufMut) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}
