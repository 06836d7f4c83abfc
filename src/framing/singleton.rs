//! Body of an unsized envelope: var-int sized chunks, a zero-size terminator, then End.

use super::{expect_record, peek, take_payload, RecordType, VarIntDecoder};
use crate::error::{DecoderError, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonMessageState {
    ReadingEnvelopeChunkSize,
    ChunkStart,
    ReadingEnvelopeBytes,
    ChunkEnd,
    EnvelopeEnd,
    ReadingEndRecord,
    End,
}

/// Decodes the chunked body that follows an UnsizedEnvelope record.
#[derive(Debug, Clone)]
pub struct SingletonMessageDecoder {
    state: SingletonMessageState,
    size: VarIntDecoder,
    chunk_size: u32,
    bytes_needed: u32,
    start_position: u64,
    position: u64,
}

impl SingletonMessageDecoder {
    pub fn new(stream_position: u64) -> Self {
        Self {
            state: SingletonMessageState::ReadingEnvelopeChunkSize,
            size: VarIntDecoder::new(),
            chunk_size: 0,
            bytes_needed: 0,
            start_position: stream_position,
            position: stream_position,
        }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecoderError> {
        match self.step(bytes) {
            Ok(n) => {
                self.position += n as u64;
                Ok(n)
            }
            Err(e) => Err(DecoderError::new(self.state, self.position, e)),
        }
    }

    fn step(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        use SingletonMessageState::*;

        let (consumed, next) = match self.state {
            ReadingEnvelopeChunkSize => {
                let n = self.size.decode(bytes)?;
                if !self.size.is_complete() {
                    return Ok(n);
                }
                self.chunk_size = self.size.value();
                let next = if self.chunk_size == 0 {
                    EnvelopeEnd
                } else {
                    ChunkStart
                };
                (n, next)
            }
            ChunkStart => {
                self.bytes_needed = self.chunk_size;
                (0, ReadingEnvelopeBytes)
            }
            ReadingEnvelopeBytes => {
                let n = take_payload(&mut self.bytes_needed, bytes);
                let next = if self.bytes_needed == 0 {
                    ChunkEnd
                } else {
                    ReadingEnvelopeBytes
                };
                (n, next)
            }
            ChunkEnd => {
                self.size.reset();
                (0, ReadingEnvelopeChunkSize)
            }
            EnvelopeEnd => (0, ReadingEndRecord),
            ReadingEndRecord => match peek(bytes) {
                None => return Ok(0),
                Some(b) => {
                    expect_record(b, RecordType::End)?;
                    (1, End)
                }
            },
            End => return Err(ProtocolError::DecodePastEnd),
        };
        self.state = next;
        Ok(consumed)
    }

    pub fn state(&self) -> SingletonMessageState {
        self.state
    }

    /// Size of the current chunk, valid from `ChunkStart`.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn needs_bytes(&self) -> bool {
        matches!(
            self.state,
            SingletonMessageState::ReadingEnvelopeChunkSize
                | SingletonMessageState::ReadingEnvelopeBytes
                | SingletonMessageState::ReadingEndRecord
        )
    }

    pub fn stream_position(&self) -> u64 {
        self.position
    }

    pub fn reset(&mut self) {
        self.state = SingletonMessageState::ReadingEnvelopeChunkSize;
        self.size.reset();
        self.chunk_size = 0;
        self.bytes_needed = 0;
        self.position = self.start_position;
    }

    pub fn premature_eof(&self) -> DecoderError {
        DecoderError::new(self.state, self.position, ProtocolError::PrematureEof)
    }
}
