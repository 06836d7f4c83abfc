//! Wire format of the framing protocol: tokens, primitives, resumable decoders and encoders.
//!
//! Every decoder is a state machine driven by repeated `decode` calls. A call advances at
//! most one state and returns how many bytes it consumed; pseudo-states (record starts and
//! ends, upgrade hand-offs) consume nothing, so callers loop until they observe the state
//! they care about or [`SessionDecoder::needs_bytes`] tells them to read.

pub mod client;
pub mod consts;
pub mod encoder;
pub mod mode;
pub mod server;
pub mod singleton;
pub mod string;
pub mod token;
pub mod varint;

pub use client::{ClientDecoder, ClientDuplexDecoder, ClientSingletonDecoder};
pub use consts::{
    FaultKind, FAULT_NAMESPACE, FRAMING_MAJOR_VERSION, FRAMING_MINOR_VERSION, MAX_FAULT_SIZE,
    TLS_UPGRADE,
};
pub use encoder::{
    encode_fault, encode_preamble, encode_sized_envelope, encode_sized_envelope_header,
    encode_upgrade_request, SingletonChunkWriter,
};
pub use mode::HandshakeModeDecoder;
pub use server::{
    DuplexSessionDecoder, PreambleState, ServerDecoder, SingletonSessionDecoder,
    SingletonSizedSessionDecoder,
};
pub use singleton::SingletonMessageDecoder;
pub use string::{LengthPrefixedStringDecoder, StringKind};
pub use token::{FramingMode, KnownEncoding, RecordType};
pub use varint::VarIntDecoder;

use crate::error::{DecoderError, Expected, ProtocolError};

/// Where a session decoder stands relative to envelope boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Inside the preamble or between records.
    Pending,
    /// An envelope begins. Sized envelopes carry their length; unsized ones hand off to
    /// [`SingletonMessageDecoder`].
    EnvelopeStart { size: Option<u32> },
    /// The last `decode` call consumed envelope payload.
    EnvelopeBytes,
    EnvelopeEnd,
    /// The peer ended the session cleanly.
    End,
    /// The peer sent a fault; see [`SessionDecoder::fault`].
    Fault,
}

/// Common surface of the session decoders used by the envelope readers.
pub trait SessionDecoder: Send {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError>;

    /// Whether the current state can only advance with more input.
    fn needs_bytes(&self) -> bool;

    fn progress(&self) -> Progress;

    /// Whether the current state holds envelope payload, so the next consumed bytes belong
    /// to the envelope body.
    fn in_envelope_bytes(&self) -> bool;

    /// Fault string received from the peer, once the decoder is in its fault state.
    fn fault(&self) -> Option<&str> {
        None
    }

    fn stream_position(&self) -> u64;

    /// Error describing an end of stream in the current state.
    fn premature_eof(&self) -> DecoderError;
}

/// First byte of `bytes` as a record tag, or `None` when more input is needed.
pub(crate) fn peek(bytes: &[u8]) -> Option<u8> {
    bytes.first().copied()
}

pub(crate) fn expect_record(found: u8, expected: RecordType) -> Result<(), ProtocolError> {
    if found == expected.as_u8() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidRecordType {
            expected: Expected::Record(expected),
            found,
        })
    }
}

pub(crate) fn invalid_record(found: u8, expected: &'static [RecordType]) -> ProtocolError {
    ProtocolError::InvalidRecordType {
        expected: Expected::OneOf(expected),
        found,
    }
}

/// Consume up to `*needed` payload bytes from `bytes`.
pub(crate) fn take_payload(needed: &mut u32, bytes: &[u8]) -> usize {
    let take = (*needed as usize).min(bytes.len());
    // take <= *needed, so this cannot truncate
    *needed -= take as u32;
    take
}
