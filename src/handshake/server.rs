//! Server handshake state machine after the mode is known.

use bytes::Bytes;

use super::{Endpoint, Feed, ViaValidation};
use crate::config::FramingSettings;
use crate::error::{DecoderError, Error, ProtocolError};
use crate::framing::encoder::{PREAMBLE_ACK, UPGRADE_RESPONSE};
use crate::framing::{FaultKind, FramingMode, PreambleState, ServerDecoder, SessionDecoder};
use crate::Result;

/// Next action a server driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStep {
    /// Read and pass the buffered bytes to [`ServerHandshake::on_read`].
    Read,
    /// Validate the via with the connection and report through
    /// [`ServerHandshake::on_validated`].
    Validate(String),
    /// Ask the upgrade acceptor and report through [`ServerHandshake::on_upgrade_checked`].
    CheckUpgrade(String),
    /// Write and flush these bytes.
    Write(Bytes),
    /// Upgrade the current connection, then call [`ServerHandshake::on_upgraded`].
    Upgrade(String),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitVia,
    Validate,
    AwaitUpgradeOrEnd,
    CheckUpgrade(String),
    SendUpgradeResponse(String),
    Upgrade(String),
    SendAck,
    Done,
}

/// Server side of the preamble, from the via record through the ack.
///
/// Every failure is returned as an [`Error`]; when [`Error::fault_to_send`] names a fault the
/// driver writes it back before closing.
#[derive(Debug)]
pub struct ServerHandshake {
    phase: Phase,
    decoder: ServerDecoder,
    endpoint: Endpoint,
    upgrades: Vec<String>,
    max_upgrades: usize,
}

impl ServerHandshake {
    /// `stream_position` is the number of bytes the mode decoder consumed.
    pub fn new(
        mode: FramingMode,
        stream_position: u64,
        settings: &FramingSettings,
        endpoint: &Endpoint,
    ) -> Self {
        Self {
            phase: Phase::AwaitVia,
            decoder: ServerDecoder::for_mode(mode, settings, stream_position),
            endpoint: endpoint.clone(),
            upgrades: Vec::new(),
            max_upgrades: settings.max_upgrades,
        }
    }

    pub fn next_step(&mut self) -> ServerStep {
        match self.phase.clone() {
            Phase::AwaitVia | Phase::AwaitUpgradeOrEnd => ServerStep::Read,
            Phase::Validate => ServerStep::Validate(self.decoder.via().to_string()),
            Phase::CheckUpgrade(upgrade) => ServerStep::CheckUpgrade(upgrade),
            Phase::SendUpgradeResponse(upgrade) => {
                self.phase = Phase::Upgrade(upgrade);
                ServerStep::Write(Bytes::from_static(&UPGRADE_RESPONSE))
            }
            Phase::Upgrade(upgrade) => ServerStep::Upgrade(upgrade),
            Phase::SendAck => {
                self.phase = Phase::Done;
                ServerStep::Write(Bytes::from_static(&PREAMBLE_ACK))
            }
            Phase::Done => ServerStep::Done,
        }
    }

    /// Report the via check, combining the connection's verdict with the endpoint's.
    pub fn on_validated(&mut self, validation: ViaValidation) -> Result<()> {
        let via = self.decoder.via();
        let content_type = self.decoder.content_type();
        match validation {
            ViaValidation::Accepted => {}
            ViaValidation::Rejected => {
                return Err(Error::ViaRefused {
                    via: via.to_string(),
                })
            }
            ViaValidation::Fault(fault) => {
                return Err(Error::Rejected {
                    fault,
                    reason: format!("via {via:?}: {}", fault.describe(content_type)),
                })
            }
        }
        if !self.endpoint.accepts_content_type(content_type) {
            return Err(Error::Rejected {
                fault: FaultKind::ContentTypeInvalid,
                reason: FaultKind::ContentTypeInvalid.describe(content_type),
            });
        }
        tracing::debug!(via, content_type, "preamble accepted");
        self.phase = Phase::AwaitUpgradeOrEnd;
        Ok(())
    }

    /// Report whether an acceptor can perform the requested upgrade.
    pub fn on_upgrade_checked(&mut self, accepted: bool) -> Result<()> {
        let Phase::CheckUpgrade(upgrade) = &self.phase else {
            return Ok(());
        };
        if self.upgrades.len() >= self.max_upgrades {
            return Err(self.error(ProtocolError::TooManyUpgrades(self.max_upgrades)));
        }
        if !accepted {
            return Err(self.error(ProtocolError::UpgradeNotSupported(upgrade.clone())));
        }
        self.phase = Phase::SendUpgradeResponse(upgrade.clone());
        Ok(())
    }

    /// The stream has been upgraded; decoding resumes on the upgraded connection.
    pub fn on_upgraded(&mut self) -> Result<()> {
        if let Phase::Upgrade(upgrade) =
            std::mem::replace(&mut self.phase, Phase::AwaitUpgradeOrEnd)
        {
            self.decoder.decode(&[])?;
            tracing::debug!(upgrade = %upgrade, "stream upgraded");
            self.upgrades.push(upgrade);
        }
        Ok(())
    }

    /// Decoder positioned after the preamble, once the ack has been written.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn via(&self) -> &str {
        self.decoder.via()
    }

    pub fn content_type(&self) -> &str {
        self.decoder.content_type()
    }

    pub fn upgrades(&self) -> &[String] {
        &self.upgrades
    }

    pub fn into_parts(self) -> (ServerDecoder, Vec<String>) {
        (self.decoder, self.upgrades)
    }

    fn error(&self, source: ProtocolError) -> Error {
        DecoderError::new(
            self.decoder.preamble_state(),
            self.decoder.stream_position(),
            source,
        )
        .into()
    }
}

impl Feed for ServerHandshake {
    fn on_read(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut offset = 0;
        loop {
            let target = match (&self.phase, self.decoder.preamble_state()) {
                (Phase::AwaitVia, PreambleState::PreUpgradeStart) => Some(Phase::Validate),
                (Phase::AwaitUpgradeOrEnd, PreambleState::UpgradeRequest) => {
                    Some(Phase::CheckUpgrade(self.decoder.upgrade().to_string()))
                }
                (Phase::AwaitUpgradeOrEnd, PreambleState::Start) => Some(Phase::SendAck),
                _ => None,
            };
            if let Some(next) = target {
                self.phase = next;
                return Ok(offset);
            }
            if self.decoder.needs_bytes() && offset == bytes.len() {
                return Ok(offset);
            }
            offset += self.decoder.decode(&bytes[offset..])?;
        }
    }

    fn premature_eof(&self) -> DecoderError {
        self.decoder.premature_eof()
    }
}
