//! Decoder for the Version and Mode records that open every connection.

use super::{expect_record, peek, FramingMode, RecordType, FRAMING_MAJOR_VERSION};
use crate::error::{DecoderError, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    ReadingVersionRecord,
    ReadingMajorVersion,
    ReadingMinorVersion,
    ReadingModeRecord,
    ReadingModeValue,
    Done,
}

/// Reads `00 major minor 01 mode`, rejecting unsupported versions and modes.
#[derive(Debug, Clone)]
pub struct HandshakeModeDecoder {
    state: ModeState,
    position: u64,
    major: u8,
    minor: u8,
    mode: Option<FramingMode>,
}

impl Default for HandshakeModeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeModeDecoder {
    pub fn new() -> Self {
        Self {
            state: ModeState::ReadingVersionRecord,
            position: 0,
            major: 0,
            minor: 0,
            mode: None,
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
        if self.state == ModeState::Done {
            return Err(ProtocolError::DecodePastEnd);
        }
        let Some(b) = peek(bytes) else {
            return Ok(0);
        };
        self.state = match self.state {
            ModeState::ReadingVersionRecord => {
                expect_record(b, RecordType::Version)?;
                ModeState::ReadingMajorVersion
            }
            ModeState::ReadingMajorVersion => {
                self.major = b;
                ModeState::ReadingMinorVersion
            }
            ModeState::ReadingMinorVersion => {
                self.minor = b;
                if self.major != FRAMING_MAJOR_VERSION {
                    return Err(ProtocolError::UnsupportedVersion {
                        major: self.major,
                        minor: self.minor,
                    });
                }
                ModeState::ReadingModeRecord
            }
            ModeState::ReadingModeRecord => {
                expect_record(b, RecordType::Mode)?;
                ModeState::ReadingModeValue
            }
            ModeState::ReadingModeValue => {
                let mode = FramingMode::from_u8(b).ok_or(ProtocolError::UnsupportedMode(b))?;
                self.mode = Some(mode);
                ModeState::Done
            }
            ModeState::Done => return Err(ProtocolError::DecodePastEnd),
        };
        Ok(1)
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ModeState::Done
    }

    /// Negotiated mode, available once done.
    pub fn mode(&self) -> Option<FramingMode> {
        self.mode
    }

    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn stream_position(&self) -> u64 {
        self.position
    }

    pub fn premature_eof(&self) -> DecoderError {
        DecoderError::new(self.state, self.position, ProtocolError::PrematureEof)
    }
}
