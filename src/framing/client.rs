//! Client-side decoders for the server's replies: upgrade responses, the preamble ack,
//! faults and envelopes.

use super::string::LengthPrefixedStringDecoder;
use super::{
    invalid_record, peek, take_payload, FramingMode, Progress, RecordType, SessionDecoder,
    VarIntDecoder,
};
use crate::error::{DecoderError, ProtocolError};

/// Reply states before the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPreambleState {
    ReadingUpgradeRecord,
    /// The server accepted an upgrade; the stream must be upgraded before decoding resumes.
    UpgradeResponse,
    ReadingAckRecord,
    /// PreambleAck was read.
    Start,
}

enum PreambleNext {
    Preamble(ClientPreambleState),
    FaultString,
}

fn preamble_step(
    state: ClientPreambleState,
    bytes: &[u8],
) -> Result<(usize, PreambleNext), ProtocolError> {
    use ClientPreambleState::*;

    match state {
        ReadingUpgradeRecord => match peek(bytes) {
            None => Ok((0, PreambleNext::Preamble(state))),
            Some(b) if b == RecordType::UpgradeResponse.as_u8() => {
                Ok((1, PreambleNext::Preamble(UpgradeResponse)))
            }
            Some(_) => Ok((0, PreambleNext::Preamble(ReadingAckRecord))),
        },
        UpgradeResponse => Ok((0, PreambleNext::Preamble(ReadingUpgradeRecord))),
        ReadingAckRecord => match peek(bytes) {
            None => Ok((0, PreambleNext::Preamble(state))),
            Some(b) if b == RecordType::PreambleAck.as_u8() => {
                Ok((1, PreambleNext::Preamble(Start)))
            }
            Some(b) if b == RecordType::Fault.as_u8() => Ok((1, PreambleNext::FaultString)),
            Some(found) => Err(ProtocolError::UnexpectedAck { found }),
        },
        Start => Err(ProtocolError::DecodePastEnd),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDuplexState {
    Preamble(ClientPreambleState),
    ReadingEnvelopeRecord,
    ReadingEnvelopeSize,
    EnvelopeStart,
    ReadingEnvelopeBytes,
    EnvelopeEnd,
    ReadingFaultString,
    Fault,
    End,
}

const CLIENT_DUPLEX_RECORDS: &[RecordType] =
    &[RecordType::SizedEnvelope, RecordType::Fault, RecordType::End];

/// Client decoder for duplex and simplex sessions.
#[derive(Debug, Clone)]
pub struct ClientDuplexDecoder {
    state: ClientDuplexState,
    fault: LengthPrefixedStringDecoder,
    size: VarIntDecoder,
    envelope_size: u32,
    bytes_needed: u32,
    start_position: u64,
    position: u64,
}

impl ClientDuplexDecoder {
    pub fn new(max_fault_size: u32, stream_position: u64) -> Self {
        Self {
            state: ClientDuplexState::Preamble(ClientPreambleState::ReadingUpgradeRecord),
            fault: LengthPrefixedStringDecoder::fault(max_fault_size),
            size: VarIntDecoder::new(),
            envelope_size: 0,
            bytes_needed: 0,
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn state(&self) -> ClientDuplexState {
        self.state
    }

    pub fn envelope_size(&self) -> u32 {
        self.envelope_size
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        use ClientDuplexState::*;

        let (consumed, next) = match self.state {
            Preamble(ClientPreambleState::Start) => (0, ReadingEnvelopeRecord),
            Preamble(p) => match preamble_step(p, bytes)? {
                (n, PreambleNext::Preamble(p)) => (n, Preamble(p)),
                (n, PreambleNext::FaultString) => {
                    self.fault.reset();
                    (n, ReadingFaultString)
                }
            },
            ReadingEnvelopeRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) if b == RecordType::SizedEnvelope.as_u8() => {
                    self.size.reset();
                    (1, ReadingEnvelopeSize)
                }
                Some(b) if b == RecordType::Fault.as_u8() => {
                    self.fault.reset();
                    (1, ReadingFaultString)
                }
                Some(b) if b == RecordType::End.as_u8() => (1, End),
                Some(b) => return Err(invalid_record(b, CLIENT_DUPLEX_RECORDS)),
            },
            ReadingEnvelopeSize => {
                let n = self.size.decode(bytes)?;
                if !self.size.is_complete() {
                    return Ok(n);
                }
                self.envelope_size = self.size.value();
                self.bytes_needed = self.envelope_size;
                (n, EnvelopeStart)
            }
            EnvelopeStart if self.bytes_needed == 0 => (0, EnvelopeEnd),
            EnvelopeStart => (0, ReadingEnvelopeBytes),
            ReadingEnvelopeBytes => {
                let n = take_payload(&mut self.bytes_needed, bytes);
                if self.bytes_needed == 0 {
                    (n, EnvelopeEnd)
                } else {
                    (n, ReadingEnvelopeBytes)
                }
            }
            EnvelopeEnd => (0, ReadingEnvelopeRecord),
            ReadingFaultString => {
                let n = self.fault.decode(bytes)?;
                if self.fault.is_complete() {
                    (n, Fault)
                } else {
                    (n, ReadingFaultString)
                }
            }
            Fault | End => return Err(ProtocolError::DecodePastEnd),
        };
        self.state = next;
        Ok(consumed)
    }

    pub fn preamble_state(&self) -> Option<ClientPreambleState> {
        match self.state {
            ClientDuplexState::Preamble(p) => Some(p),
            _ => None,
        }
    }

    fn reset_session(&mut self) {
        self.state = ClientDuplexState::Preamble(ClientPreambleState::ReadingUpgradeRecord);
        self.size.reset();
        self.envelope_size = 0;
        self.bytes_needed = 0;
    }

    fn is_fault(&self) -> bool {
        self.state == ClientDuplexState::Fault
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSingletonState {
    Preamble(ClientPreambleState),
    ReadingEnvelopeRecord,
    /// The unsized reply envelope begins; its body belongs to a
    /// [`super::SingletonMessageDecoder`].
    EnvelopeStart,
    ReadingFaultString,
    Fault,
    End,
}

const CLIENT_SINGLETON_RECORDS: &[RecordType] =
    &[RecordType::UnsizedEnvelope, RecordType::Fault, RecordType::End];

/// Client decoder for singleton sessions.
#[derive(Debug, Clone)]
pub struct ClientSingletonDecoder {
    state: ClientSingletonState,
    fault: LengthPrefixedStringDecoder,
    start_position: u64,
    position: u64,
}

impl ClientSingletonDecoder {
    pub fn new(max_fault_size: u32, stream_position: u64) -> Self {
        Self {
            state: ClientSingletonState::Preamble(ClientPreambleState::ReadingUpgradeRecord),
            fault: LengthPrefixedStringDecoder::fault(max_fault_size),
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn state(&self) -> ClientSingletonState {
        self.state
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        use ClientSingletonState::*;

        let (consumed, next) = match self.state {
            Preamble(ClientPreambleState::Start) => (0, ReadingEnvelopeRecord),
            Preamble(p) => match preamble_step(p, bytes)? {
                (n, PreambleNext::Preamble(p)) => (n, Preamble(p)),
                (n, PreambleNext::FaultString) => {
                    self.fault.reset();
                    (n, ReadingFaultString)
                }
            },
            ReadingEnvelopeRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) if b == RecordType::UnsizedEnvelope.as_u8() => (1, EnvelopeStart),
                Some(b) if b == RecordType::Fault.as_u8() => {
                    self.fault.reset();
                    (1, ReadingFaultString)
                }
                Some(b) if b == RecordType::End.as_u8() => (1, End),
                Some(b) => return Err(invalid_record(b, CLIENT_SINGLETON_RECORDS)),
            },
            ReadingFaultString => {
                let n = self.fault.decode(bytes)?;
                if self.fault.is_complete() {
                    (n, Fault)
                } else {
                    (n, ReadingFaultString)
                }
            }
            EnvelopeStart | Fault | End => return Err(ProtocolError::DecodePastEnd),
        };
        self.state = next;
        Ok(consumed)
    }

    pub fn preamble_state(&self) -> Option<ClientPreambleState> {
        match self.state {
            ClientSingletonState::Preamble(p) => Some(p),
            _ => None,
        }
    }

    fn reset_session(&mut self) {
        self.state = ClientSingletonState::Preamble(ClientPreambleState::ReadingUpgradeRecord);
    }

    fn is_fault(&self) -> bool {
        self.state == ClientSingletonState::Fault
    }
}

macro_rules! client_decoder_common {
    ($ty:ty) => {
        impl $ty {
            pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
                match self.step(bytes) {
                    Ok(n) => {
                        self.position += n as u64;
                        Ok(n)
                    }
                    Err(e) => Err(DecoderError::new(self.state, self.position, e)),
                }
            }

            /// Fault string sent by the server, once the decoder is in its fault state.
            pub fn fault(&self) -> Option<&str> {
                self.is_fault().then(|| self.fault.value())
            }

            pub fn stream_position(&self) -> u64 {
                self.position
            }

            pub fn reset(&mut self) {
                self.fault.reset();
                self.reset_session();
                self.position = self.start_position;
            }

            pub fn premature_eof(&self) -> DecoderError {
                DecoderError::new(self.state, self.position, ProtocolError::PrematureEof)
            }
        }
    };
}

client_decoder_common!(ClientDuplexDecoder);
client_decoder_common!(ClientSingletonDecoder);

impl SessionDecoder for ClientDuplexDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        ClientDuplexDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        use ClientDuplexState::*;
        match self.state {
            Preamble(ClientPreambleState::UpgradeResponse | ClientPreambleState::Start) => false,
            EnvelopeStart | EnvelopeEnd | Fault | End => false,
            _ => true,
        }
    }

    fn progress(&self) -> Progress {
        match self.state {
            ClientDuplexState::EnvelopeStart => Progress::EnvelopeStart {
                size: Some(self.envelope_size),
            },
            ClientDuplexState::ReadingEnvelopeBytes => Progress::EnvelopeBytes,
            ClientDuplexState::EnvelopeEnd => Progress::EnvelopeEnd,
            ClientDuplexState::Fault => Progress::Fault,
            ClientDuplexState::End => Progress::End,
            _ => Progress::Pending,
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        self.state == ClientDuplexState::ReadingEnvelopeBytes
    }

    fn fault(&self) -> Option<&str> {
        ClientDuplexDecoder::fault(self)
    }

    fn stream_position(&self) -> u64 {
        self.position
    }

    fn premature_eof(&self) -> DecoderError {
        ClientDuplexDecoder::premature_eof(self)
    }
}

impl SessionDecoder for ClientSingletonDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        ClientSingletonDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        use ClientSingletonState::*;
        match self.state {
            Preamble(ClientPreambleState::UpgradeResponse | ClientPreambleState::Start) => false,
            EnvelopeStart | Fault | End => false,
            _ => true,
        }
    }

    fn progress(&self) -> Progress {
        match self.state {
            ClientSingletonState::EnvelopeStart => Progress::EnvelopeStart { size: None },
            ClientSingletonState::Fault => Progress::Fault,
            ClientSingletonState::End => Progress::End,
            _ => Progress::Pending,
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        false
    }

    fn fault(&self) -> Option<&str> {
        ClientSingletonDecoder::fault(self)
    }

    fn stream_position(&self) -> u64 {
        self.position
    }

    fn premature_eof(&self) -> DecoderError {
        ClientSingletonDecoder::premature_eof(self)
    }
}

/// Client reply decoder selected by the session mode.
#[derive(Debug, Clone)]
pub enum ClientDecoder {
    Duplex(ClientDuplexDecoder),
    Singleton(ClientSingletonDecoder),
}

impl ClientDecoder {
    /// Decoder for replies in `mode`. Simplex and sized singleton replies share the duplex
    /// framing.
    pub fn for_mode(mode: FramingMode, max_fault_size: u32, stream_position: u64) -> Self {
        match mode {
            FramingMode::Singleton => {
                ClientDecoder::Singleton(ClientSingletonDecoder::new(max_fault_size, stream_position))
            }
            _ => ClientDecoder::Duplex(ClientDuplexDecoder::new(max_fault_size, stream_position)),
        }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        match self {
            ClientDecoder::Duplex(d) => d.decode(bytes),
            ClientDecoder::Singleton(d) => d.decode(bytes),
        }
    }

    /// Preamble state, or `None` once the session has started or faulted.
    pub fn preamble_state(&self) -> Option<ClientPreambleState> {
        match self {
            ClientDecoder::Duplex(d) => d.preamble_state(),
            ClientDecoder::Singleton(d) => d.preamble_state(),
        }
    }

    pub fn fault(&self) -> Option<&str> {
        match self {
            ClientDecoder::Duplex(d) => d.fault(),
            ClientDecoder::Singleton(d) => d.fault(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            ClientDecoder::Duplex(d) => d.reset(),
            ClientDecoder::Singleton(d) => d.reset(),
        }
    }
}

impl SessionDecoder for ClientDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        ClientDecoder::decode(self, bytes)
    }

    fn needs_bytes(&self) -> bool {
        match self {
            ClientDecoder::Duplex(d) => d.needs_bytes(),
            ClientDecoder::Singleton(d) => d.needs_bytes(),
        }
    }

    fn progress(&self) -> Progress {
        match self {
            ClientDecoder::Duplex(d) => d.progress(),
            ClientDecoder::Singleton(d) => d.progress(),
        }
    }

    fn in_envelope_bytes(&self) -> bool {
        match self {
            ClientDecoder::Duplex(d) => d.in_envelope_bytes(),
            ClientDecoder::Singleton(_) => false,
        }
    }

    fn fault(&self) -> Option<&str> {
        ClientDecoder::fault(self)
    }

    fn stream_position(&self) -> u64 {
        match self {
            ClientDecoder::Duplex(d) => d.stream_position(),
            ClientDecoder::Singleton(d) => d.stream_position(),
        }
    }

    fn premature_eof(&self) -> DecoderError {
        match self {
            ClientDecoder::Duplex(d) => d.premature_eof(),
            ClientDecoder::Singleton(d) => d.premature_eof(),
        }
    }
}
