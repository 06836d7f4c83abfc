//! Server-side session decoders, one per mode, sharing a common preamble core.

use super::string::LengthPrefixedStringDecoder;
use super::{
    expect_record, invalid_record, peek, take_payload, FramingMode, KnownEncoding, Progress,
    RecordType, SessionDecoder, VarIntDecoder,
};
use crate::config::FramingSettings;
use crate::error::{DecoderError, ProtocolError};

/// Preamble states shared by every server session decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleState {
    ReadingViaRecord,
    ReadingViaString,
    ReadingContentTypeRecord,
    ReadingContentTypeString,
    ReadingContentTypeByte,
    PreUpgradeStart,
    ReadingUpgradeRecord,
    ReadingUpgradeString,
    /// An upgrade request is complete; the stream must be upgraded before decoding resumes.
    UpgradeRequest,
    ReadingPreambleEndRecord,
    /// PreambleEnd was read; the session may be acknowledged.
    Start,
}

impl PreambleState {
    fn needs_bytes(self) -> bool {
        !matches!(
            self,
            PreambleState::PreUpgradeStart | PreambleState::UpgradeRequest | PreambleState::Start
        )
    }
}

const AFTER_UPGRADE: &[RecordType] = &[RecordType::UpgradeRequest, RecordType::PreambleEnd];
const CONTENT_TYPE_RECORDS: &[RecordType] =
    &[RecordType::KnownEncoding, RecordType::ExtensibleEncoding];

#[derive(Debug, Clone)]
struct ServerPreamble {
    state: PreambleState,
    via: LengthPrefixedStringDecoder,
    content_type: LengthPrefixedStringDecoder,
    upgrade: LengthPrefixedStringDecoder,
    known: Option<KnownEncoding>,
}

impl ServerPreamble {
    fn new(settings: &FramingSettings) -> Self {
        Self {
            state: PreambleState::ReadingViaRecord,
            via: LengthPrefixedStringDecoder::via(settings.max_via_size),
            content_type: LengthPrefixedStringDecoder::content_type(
                settings.max_content_type_size,
            ),
            upgrade: LengthPrefixedStringDecoder::upgrade(settings.max_upgrade_size),
            known: None,
        }
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        use PreambleState::*;

        let (consumed, next) = match self.state {
            ReadingViaRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) => {
                    expect_record(b, RecordType::Via)?;
                    self.via.reset();
                    (1, ReadingViaString)
                }
            },
            ReadingViaString => {
                let n = self.via.decode(bytes)?;
                let next = if self.via.is_complete() {
                    ReadingContentTypeRecord
                } else {
                    ReadingViaString
                };
                (n, next)
            }
            ReadingContentTypeRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) if b == RecordType::KnownEncoding.as_u8() => (1, ReadingContentTypeByte),
                Some(b) if b == RecordType::ExtensibleEncoding.as_u8() => {
                    self.content_type.reset();
                    self.known = None;
                    (1, ReadingContentTypeString)
                }
                Some(b) => return Err(invalid_record(b, CONTENT_TYPE_RECORDS)),
            },
            ReadingContentTypeByte => match peek(bytes) {
                None => return Ok(0),
                Some(b) => {
                    let known =
                        KnownEncoding::from_u8(b).ok_or(ProtocolError::InvalidKnownEncoding(b))?;
                    self.known = Some(known);
                    (1, PreUpgradeStart)
                }
            },
            ReadingContentTypeString => {
                let n = self.content_type.decode(bytes)?;
                let next = if self.content_type.is_complete() {
                    PreUpgradeStart
                } else {
                    ReadingContentTypeString
                };
                (n, next)
            }
            PreUpgradeStart => (0, ReadingUpgradeRecord),
            ReadingUpgradeRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) if b == RecordType::UpgradeRequest.as_u8() => {
                    self.upgrade.reset();
                    (1, ReadingUpgradeString)
                }
                Some(_) => (0, ReadingPreambleEndRecord),
            },
            ReadingUpgradeString => {
                let n = self.upgrade.decode(bytes)?;
                let next = if self.upgrade.is_complete() {
                    UpgradeRequest
                } else {
                    ReadingUpgradeString
                };
                (n, next)
            }
            UpgradeRequest => (0, ReadingUpgradeRecord),
            ReadingPreambleEndRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) if b == RecordType::PreambleEnd.as_u8() => (1, Start),
                Some(b) => return Err(invalid_record(b, AFTER_UPGRADE)),
            },
            Start => return Err(ProtocolError::DecodePastEnd),
        };
        self.state = next;
        Ok(consumed)
    }

    fn content_type(&self) -> &str {
        match self.known {
            Some(known) => known.content_type(),
            None => self.content_type.value(),
        }
    }

    fn reset(&mut self) {
        self.state = PreambleState::ReadingViaRecord;
        self.via.reset();
        self.content_type.reset();
        self.upgrade.reset();
        self.known = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexState {
    Preamble(PreambleState),
    ReadingEnvelopeRecord,
    ReadingEnvelopeSize,
    EnvelopeStart,
    ReadingEnvelopeBytes,
    EnvelopeEnd,
    End,
}

const DUPLEX_RECORDS: &[RecordType] = &[RecordType::SizedEnvelope, RecordType::End];

/// Server decoder for duplex and simplex sessions: preamble, then sized envelopes until End.
#[derive(Debug, Clone)]
pub struct DuplexSessionDecoder {
    state: DuplexState,
    preamble: ServerPreamble,
    size: VarIntDecoder,
    envelope_size: u32,
    bytes_needed: u32,
    start_position: u64,
    position: u64,
}

impl DuplexSessionDecoder {
    /// `stream_position` is the number of bytes already consumed by the mode decoder.
    pub fn new(settings: &FramingSettings, stream_position: u64) -> Self {
        Self {
            state: DuplexState::Preamble(PreambleState::ReadingViaRecord),
            preamble: ServerPreamble::new(settings),
            size: VarIntDecoder::new(),
            envelope_size: 0,
            bytes_needed: 0,
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn state(&self) -> DuplexState {
        self.state
    }

    /// Size of the current envelope, valid from `EnvelopeStart`.
    pub fn envelope_size(&self) -> u32 {
        self.envelope_size
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        match self.state {
            DuplexState::Preamble(PreambleState::Start) => {
                self.state = DuplexState::ReadingEnvelopeRecord;
                Ok(0)
            }
            DuplexState::Preamble(_) => {
                let n = self.preamble.step(bytes)?;
                self.state = DuplexState::Preamble(self.preamble.state);
                Ok(n)
            }
            DuplexState::ReadingEnvelopeRecord => {
                let Some(b) = peek(bytes) else {
                    return Ok(0);
                };
                self.state = if b == RecordType::SizedEnvelope.as_u8() {
                    self.size.reset();
                    DuplexState::ReadingEnvelopeSize
                } else if b == RecordType::End.as_u8() {
                    DuplexState::End
                } else {
                    return Err(invalid_record(b, DUPLEX_RECORDS));
                };
                Ok(1)
            }
            DuplexState::ReadingEnvelopeSize => {
                let n = self.size.decode(bytes)?;
                if self.size.is_complete() {
                    self.envelope_size = self.size.value();
                    self.bytes_needed = self.envelope_size;
                    self.state = DuplexState::EnvelopeStart;
                }
                Ok(n)
            }
            DuplexState::EnvelopeStart => {
                self.state = if self.bytes_needed == 0 {
                    DuplexState::EnvelopeEnd
                } else {
                    DuplexState::ReadingEnvelopeBytes
                };
                Ok(0)
            }
            DuplexState::ReadingEnvelopeBytes => {
                let n = take_payload(&mut self.bytes_needed, bytes);
                if self.bytes_needed == 0 {
                    self.state = DuplexState::EnvelopeEnd;
                }
                Ok(n)
            }
            DuplexState::EnvelopeEnd => {
                self.state = DuplexState::ReadingEnvelopeRecord;
                Ok(0)
            }
            DuplexState::End => Err(ProtocolError::DecodePastEnd),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonState {
    Preamble(PreambleState),
    ReadingEnvelopeRecord,
    /// The unsized envelope begins; its body belongs to a [`super::SingletonMessageDecoder`].
    EnvelopeStart,
    End,
}

const SINGLETON_RECORDS: &[RecordType] = &[RecordType::UnsizedEnvelope, RecordType::End];

/// Server decoder for singleton sessions: preamble, then one unsized envelope or End.
#[derive(Debug, Clone)]
pub struct SingletonSessionDecoder {
    state: SingletonState,
    preamble: ServerPreamble,
    start_position: u64,
    position: u64,
}

impl SingletonSessionDecoder {
    pub fn new(settings: &FramingSettings, stream_position: u64) -> Self {
        Self {
            state: SingletonState::Preamble(PreambleState::ReadingViaRecord),
            preamble: ServerPreamble::new(settings),
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn state(&self) -> SingletonState {
        self.state
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        match self.state {
            SingletonState::Preamble(PreambleState::Start) => {
                self.state = SingletonState::ReadingEnvelopeRecord;
                Ok(0)
            }
            SingletonState::Preamble(_) => {
                let n = self.preamble.step(bytes)?;
                self.state = SingletonState::Preamble(self.preamble.state);
                Ok(n)
            }
            SingletonState::ReadingEnvelopeRecord => {
                let Some(b) = peek(bytes) else {
                    return Ok(0);
                };
                self.state = if b == RecordType::UnsizedEnvelope.as_u8() {
                    SingletonState::EnvelopeStart
                } else if b == RecordType::End.as_u8() {
                    SingletonState::End
                } else {
                    return Err(invalid_record(b, SINGLETON_RECORDS));
                };
                Ok(1)
            }
            SingletonState::EnvelopeStart | SingletonState::End => {
                Err(ProtocolError::DecodePastEnd)
            }
        }
    }
}

/// Server decoder for sized singleton sessions. The envelope length is carried out of band,
/// so decoding stops once the preamble reaches `Start`.
#[derive(Debug, Clone)]
pub struct SingletonSizedSessionDecoder {
    preamble: ServerPreamble,
    start_position: u64,
    position: u64,
}

impl SingletonSizedSessionDecoder {
    pub fn new(settings: &FramingSettings, stream_position: u64) -> Self {
        Self {
            preamble: ServerPreamble::new(settings),
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn state(&self) -> PreambleState {
        self.preamble.state
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        self.preamble.step(bytes)
    }
}

macro_rules! server_decoder_common {
    ($ty:ty) => {
        impl $ty {
            pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
                match self.step(bytes) {
                    Ok(n) => {
                        self.position += n as u64;
                        Ok(n)
                    }
                    Err(e) => Err(DecoderError::new(self.state(), self.position, e)),
                }
            }

            pub fn via(&self) -> &str {
                self.preamble.via.value()
            }

            pub fn content_type(&self) -> &str {
                self.preamble.content_type()
            }

            /// Upgrade content type of the most recent upgrade request.
            pub fn upgrade(&self) -> &str {
                self.preamble.upgrade.value()
            }

            pub fn stream_position(&self) -> u64 {
                self.position
            }

            /// Return to the initial state, keeping the decoded string buffers for reuse.
            pub fn reset(&mut self) {
                self.preamble.reset();
                self.reset_session();
                self.position = self.start_position;
            }

            pub fn premature_eof(&self) -> DecoderError {
                DecoderError::new(self.state(), self.position, ProtocolError::PrematureEof)
            }
        }
    };
}

server_decoder_common!(DuplexSessionDecoder);
server_decoder_common!(SingletonSessionDecoder);
server_decoder_common!(SingletonSizedSessionDecoder);

impl DuplexSessionDecoder {
    /// Preamble progress; `Start` once the preamble is behind the decoder.
    pub fn preamble_state(&self) -> PreambleState {
        match self.state {
            DuplexState::Preamble(p) => p,
            _ => PreambleState::Start,
        }
    }

    fn reset_session(&mut self) {
        self.state = DuplexState::Preamble(PreambleState::ReadingViaRecord);
        self.size.reset();
        self.envelope_size = 0;
        self.bytes_needed = 0;
    }
}

impl SingletonSessionDecoder {
    pub fn preamble_state(&self) -> PreambleState {
        match self.state {
            SingletonState::Preamble(p) => p,
            _ => PreambleState::Start,
        }
    }

    fn reset_session(&mut self) {
        self.state = SingletonState::Preamble(PreambleState::ReadingViaRecord);
    }
}

impl SingletonSizedSessionDecoder {
    pub fn preamble_state(&self) -> PreambleState {
        self.preamble.state
    }

    fn reset_session(&mut self) {}
}

impl SessionDecoder for DuplexSessionDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        DuplexSessionDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        match self.state {
            DuplexState::Preamble(p) => p.needs_bytes(),
            DuplexState::EnvelopeStart | DuplexState::EnvelopeEnd | DuplexState::End => false,
            _ => true,
        }
    }

    fn progress(&self) -> Progress {
        match self.state {
            DuplexState::EnvelopeStart => Progress::EnvelopeStart {
                size: Some(self.envelope_size),
            },
            DuplexState::ReadingEnvelopeBytes => Progress::EnvelopeBytes,
            DuplexState::EnvelopeEnd => Progress::EnvelopeEnd,
            DuplexState::End => Progress::End,
            _ => Progress::Pending,
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        self.state == DuplexState::ReadingEnvelopeBytes
    }

    fn stream_position(&self) -> u64 {
        self.position
    }

    fn premature_eof(&self) -> DecoderError {
        DuplexSessionDecoder::premature_eof(self)
    }
}

impl SessionDecoder for SingletonSessionDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        SingletonSessionDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        match self.state {
            SingletonState::Preamble(p) => p.needs_bytes(),
            SingletonState::ReadingEnvelopeRecord => true,
            SingletonState::EnvelopeStart | SingletonState::End => false,
        }
    }

    fn progress(&self) -> Progress {
        match self.state {
            SingletonState::EnvelopeStart => Progress::EnvelopeStart { size: None },
            SingletonState::End => Progress::End,
            _ => Progress::Pending,
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        false
    }

    fn stream_position(&self) -> u64 {
        self.position
    }

    fn premature_eof(&self) -> DecoderError {
        SingletonSessionDecoder::premature_eof(self)
    }
}

/// Server session decoder selected by the negotiated mode.
#[derive(Debug, Clone)]
pub enum ServerDecoder {
    Duplex(DuplexSessionDecoder),
    Singleton(SingletonSessionDecoder),
    SingletonSized(SingletonSizedSessionDecoder),
}

macro_rules! dispatch {
    ($self:expr, $d:ident => $body:expr) => {
        match $self {
            ServerDecoder::Duplex($d) => $body,
            ServerDecoder::Singleton($d) => $body,
            ServerDecoder::SingletonSized($d) => $body,
        }
    };
}

impl ServerDecoder {
    /// Decoder for the session framing of `mode`. Simplex uses the duplex framing.
    pub fn for_mode(mode: FramingMode, settings: &FramingSettings, stream_position: u64) -> Self {
        match mode {
            FramingMode::Duplex | FramingMode::Simplex => {
                ServerDecoder::Duplex(DuplexSessionDecoder::new(settings, stream_position))
            }
            FramingMode::Singleton => {
                ServerDecoder::Singleton(SingletonSessionDecoder::new(settings, stream_position))
            }
            FramingMode::SingletonSized => ServerDecoder::SingletonSized(
                SingletonSizedSessionDecoder::new(settings, stream_position),
            ),
        }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        dispatch!(self, d => d.decode(bytes))
    }

    pub fn preamble_state(&self) -> PreambleState {
        dispatch!(self, d => d.preamble_state())
    }

    pub fn via(&self) -> &str {
        dispatch!(self, d => d.via())
    }

    pub fn content_type(&self) -> &str {
        dispatch!(self, d => d.content_type())
    }

    pub fn upgrade(&self) -> &str {
        dispatch!(self, d => d.upgrade())
    }

    pub fn stream_position(&self) -> u64 {
        dispatch!(self, d => d.stream_position())
    }

    pub fn reset(&mut self) {
        dispatch!(self, d => d.reset())
    }

    pub fn premature_eof(&self) -> DecoderError {
        dispatch!(self, d => d.premature_eof())
    }
}

impl SessionDecoder for ServerDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        ServerDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        match self {
            ServerDecoder::Duplex(d) => d.needs_bytes(),
            ServerDecoder::Singleton(d) => d.needs_bytes(),
            ServerDecoder::SingletonSized(d) => d.state().needs_bytes(),
        }
    }

    fn progress(&self) -> Progress {
        match self {
            ServerDecoder::Duplex(d) => d.progress(),
            ServerDecoder::Singleton(d) => d.progress(),
            ServerDecoder::SingletonSized(_) => Progress::Pending,
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        match self {
            ServerDecoder::Duplex(d) => d.in_envelope_bytes(),
            _ => false,
        }
    }

    fn stream_position(&self) -> u64 {
        ServerDecoder::stream_position(self)
    }

    fn premature_eof(&self) -> DecoderError {
        ServerDecoder::premature_eof(self)
    }
}
