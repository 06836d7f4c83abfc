//! Length-prefixed UTF-8 strings: a var-int byte count followed by the bytes.

use std::fmt;

use bytes::BufMut;

use super::consts::FaultKind;
use super::varint::{self, VarIntDecoder};
use crate::error::ProtocolError;

/// Which string a decoder carries; selects the fault reported when its quota is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    Via,
    ContentType,
    Upgrade,
    Fault,
}

impl StringKind {
    /// Named fault sent to the peer when this string is over quota.
    pub fn quota_fault(self) -> Option<FaultKind> {
        match self {
            StringKind::Via => Some(FaultKind::ViaTooLong),
            StringKind::ContentType => Some(FaultKind::ContentTypeTooLong),
            StringKind::Upgrade => Some(FaultKind::UpgradeInvalid),
            StringKind::Fault => None,
        }
    }
}

impl fmt::Display for StringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StringKind::Via => "via",
            StringKind::ContentType => "content type",
            StringKind::Upgrade => "upgrade content type",
            StringKind::Fault => "fault string",
        })
    }
}

/// Resumable decoder for one length-prefixed string bounded by a byte quota.
#[derive(Debug, Clone)]
pub struct LengthPrefixedStringDecoder {
    kind: StringKind,
    quota: u32,
    size: VarIntDecoder,
    encoded: Vec<u8>,
    bytes_needed: usize,
    // Kept across resets so an identical re-decode skips UTF-8 validation and allocation.
    value: String,
    complete: bool,
}

impl LengthPrefixedStringDecoder {
    pub fn new(kind: StringKind, quota: u32) -> Self {
        Self {
            kind,
            quota,
            size: VarIntDecoder::new(),
            encoded: Vec::new(),
            bytes_needed: 0,
            value: String::new(),
            complete: false,
        }
    }

    pub fn via(quota: u32) -> Self {
        Self::new(StringKind::Via, quota)
    }

    pub fn content_type(quota: u32) -> Self {
        Self::new(StringKind::ContentType, quota)
    }

    pub fn upgrade(quota: u32) -> Self {
        Self::new(StringKind::Upgrade, quota)
    }

    pub fn fault(quota: u32) -> Self {
        Self::new(StringKind::Fault, quota)
    }

    pub fn kind(&self) -> StringKind {
        self.kind
    }

    /// Consume bytes toward the string. Returns the number of bytes consumed.
    ///
    /// The declared length is checked against the quota before any payload byte is copied.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        if self.complete {
            return Err(ProtocolError::DecodePastEnd);
        }
        let mut consumed = 0;
        if !self.size.is_complete() {
            consumed = self.size.decode(bytes)?;
            if !self.size.is_complete() {
                return Ok(consumed);
            }
            let size = self.size.value();
            if size > self.quota {
                return Err(ProtocolError::QuotaExceeded {
                    kind: self.kind,
                    size,
                    quota: self.quota,
                });
            }
            self.bytes_needed = size as usize;
            self.encoded.clear();
            self.encoded.reserve(self.bytes_needed);
        }

        let take = self.bytes_needed.min(bytes.len() - consumed);
        self.encoded
            .extend_from_slice(&bytes[consumed..consumed + take]);
        self.bytes_needed -= take;
        consumed += take;

        if self.bytes_needed == 0 {
            self.finish()?;
        }
        Ok(consumed)
    }

    fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.encoded != self.value.as_bytes() {
            let s = std::str::from_utf8(&self.encoded)
                .map_err(|_| ProtocolError::InvalidUtf8(self.kind))?;
            self.value.clear();
            self.value.push_str(s);
        }
        self.complete = true;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Decoded string; only meaningful once complete.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn reset(&mut self) {
        self.size.reset();
        self.encoded.clear();
        self.bytes_needed = 0;
        self.complete = false;
    }
}

/// Append `s` as a length-prefixed string.
pub fn encode(s: &str, out: &mut impl BufMut) {
    let bytes = s.as_bytes();
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    varint::encode(len, out);
    out.put_slice(bytes);
}
