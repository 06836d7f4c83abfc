//! Encoders for the records each side writes.

use bytes::{BufMut, Bytes, BytesMut};

use super::{string, varint, FramingMode, KnownEncoding, RecordType};
use super::{FRAMING_MAJOR_VERSION, FRAMING_MINOR_VERSION};

pub const PREAMBLE_END: [u8; 1] = [RecordType::PreambleEnd as u8];
pub const PREAMBLE_ACK: [u8; 1] = [RecordType::PreambleAck as u8];
pub const UPGRADE_RESPONSE: [u8; 1] = [RecordType::UpgradeResponse as u8];
pub const END: [u8; 1] = [RecordType::End as u8];
pub const UNSIZED_ENVELOPE: [u8; 1] = [RecordType::UnsizedEnvelope as u8];
/// Zero-size chunk terminating an unsized envelope, followed by End.
pub const ENVELOPE_END_FRAMING_END: [u8; 2] = [0x00, RecordType::End as u8];

/// Version, mode, via and content type records. PreambleEnd is written separately, after
/// any upgrades.
pub fn encode_preamble(mode: FramingMode, via: &str, content_type: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(16 + via.len() + content_type.len());
    out.put_u8(RecordType::Version.as_u8());
    out.put_u8(FRAMING_MAJOR_VERSION);
    out.put_u8(FRAMING_MINOR_VERSION);
    out.put_u8(RecordType::Mode.as_u8());
    out.put_u8(mode.as_u8());
    out.put_u8(RecordType::Via.as_u8());
    string::encode(via, &mut out);
    match KnownEncoding::from_content_type(content_type) {
        Some(known) => {
            out.put_u8(RecordType::KnownEncoding.as_u8());
            out.put_u8(known.as_u8());
        }
        None => {
            out.put_u8(RecordType::ExtensibleEncoding.as_u8());
            string::encode(content_type, &mut out);
        }
    }
    out.freeze()
}

pub fn encode_upgrade_request(upgrade: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + varint::MAX_VARINT_LEN + upgrade.len());
    out.put_u8(RecordType::UpgradeRequest.as_u8());
    string::encode(upgrade, &mut out);
    out.freeze()
}

pub fn encode_fault(fault: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + varint::MAX_VARINT_LEN + fault.len());
    out.put_u8(RecordType::Fault.as_u8());
    string::encode(fault, &mut out);
    out.freeze()
}

/// SizedEnvelope record and var-int size; the payload follows.
pub fn encode_sized_envelope_header(size: u32, out: &mut impl BufMut) {
    out.put_u8(RecordType::SizedEnvelope.as_u8());
    varint::encode(size, out);
}

/// A complete sized envelope, or `None` when `payload` does not fit the 32-bit size field.
pub fn encode_sized_envelope(payload: &[u8]) -> Option<Bytes> {
    let size = u32::try_from(payload.len()).ok()?;
    let mut out = BytesMut::with_capacity(1 + varint::encoded_len(size) + payload.len());
    encode_sized_envelope_header(size, &mut out);
    out.put_slice(payload);
    Some(out.freeze())
}

/// Writes an unsized envelope as a sequence of chunks.
#[derive(Debug, Default)]
pub struct SingletonChunkWriter {
    started: bool,
}

impl SingletonChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one non-empty chunk, preceded by the UnsizedEnvelope record on first use.
    /// Payloads over `u32::MAX` are split across chunks.
    pub fn chunk(&mut self, payload: &[u8], out: &mut impl BufMut) {
        if !self.started {
            out.put_slice(&UNSIZED_ENVELOPE);
            self.started = true;
        }
        for part in payload.chunks(u32::MAX as usize) {
            // chunks() bounds each part to u32::MAX
            varint::encode(part.len() as u32, out);
            out.put_slice(part);
        }
    }

    /// Terminate the envelope and the session.
    pub fn finish(self, out: &mut impl BufMut) {
        if !self.started {
            out.put_slice(&UNSIZED_ENVELOPE);
        }
        out.put_slice(&ENVELOPE_END_FRAMING_END);
    }
}
