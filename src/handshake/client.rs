//! Client handshake state machine: preamble, upgrade requests and the ack.

use bytes::{BufMut, Bytes, BytesMut};

use super::{fault_error, Feed};
use crate::config::FramingSettings;
use crate::error::{DecoderError, ProtocolError};
use crate::framing::client::ClientPreambleState;
use crate::framing::encoder::PREAMBLE_END;
use crate::framing::{
    encode_preamble, encode_upgrade_request, ClientDecoder, FramingMode, Progress, SessionDecoder,
};
use crate::Result;

/// Next action a client driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStep {
    /// Write and flush these bytes.
    Write(Bytes),
    /// Ask the upgrade initiator for the next upgrade and report it through
    /// [`ClientHandshake::on_next_upgrade`].
    NextUpgrade,
    /// Read and pass the buffered bytes to [`ClientHandshake::on_read`].
    Read,
    /// Upgrade the current connection, then call [`ClientHandshake::on_upgraded`].
    Upgrade(String),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    NextUpgrade,
    SendUpgradeRequest(String),
    AwaitUpgradeResponse(String),
    Upgrade(String),
    SendPreambleEnd,
    AwaitAck,
    Done,
}

/// Client side of the preamble: version, mode, via and content type, any number of upgrade
/// rounds, PreambleEnd, then the server's ack.
#[derive(Debug)]
pub struct ClientHandshake {
    phase: Phase,
    /// Preamble records not yet written; they ride along with the first write.
    preamble: Option<Bytes>,
    decoder: ClientDecoder,
    via: String,
    content_type: String,
    upgrades: Vec<String>,
    max_upgrades: usize,
}

impl ClientHandshake {
    pub fn new(
        mode: FramingMode,
        via: &str,
        content_type: &str,
        settings: &FramingSettings,
    ) -> Self {
        Self {
            phase: Phase::NextUpgrade,
            preamble: Some(encode_preamble(mode, via, content_type)),
            decoder: ClientDecoder::for_mode(mode, settings.max_fault_size, 0),
            via: via.to_string(),
            content_type: content_type.to_string(),
            upgrades: Vec::new(),
            max_upgrades: settings.max_upgrades,
        }
    }

    pub fn next_step(&mut self) -> ClientStep {
        match self.phase.clone() {
            Phase::NextUpgrade => ClientStep::NextUpgrade,
            Phase::SendUpgradeRequest(upgrade) => {
                let out = self.with_preamble(&encode_upgrade_request(&upgrade));
                self.phase = Phase::AwaitUpgradeResponse(upgrade);
                ClientStep::Write(out)
            }
            Phase::AwaitUpgradeResponse(_) | Phase::AwaitAck => ClientStep::Read,
            Phase::Upgrade(upgrade) => ClientStep::Upgrade(upgrade),
            Phase::SendPreambleEnd => {
                let out = self.with_preamble(&PREAMBLE_END);
                self.phase = Phase::AwaitAck;
                ClientStep::Write(out)
            }
            Phase::Done => ClientStep::Done,
        }
    }

    /// Report the initiator's answer; `None` ends the upgrade rounds.
    pub fn on_next_upgrade(&mut self, upgrade: Option<String>) -> Result<()> {
        self.phase = match upgrade {
            Some(_) if self.upgrades.len() >= self.max_upgrades => {
                return Err(self.error(ProtocolError::TooManyUpgrades(self.max_upgrades)));
            }
            Some(upgrade) => {
                tracing::debug!(via = %self.via, upgrade = %upgrade, "requesting stream upgrade");
                Phase::SendUpgradeRequest(upgrade)
            }
            None => Phase::SendPreambleEnd,
        };
        Ok(())
    }

    /// The stream has been upgraded; decoding resumes on the upgraded connection.
    pub fn on_upgraded(&mut self) -> Result<()> {
        if let Phase::Upgrade(upgrade) = std::mem::replace(&mut self.phase, Phase::NextUpgrade) {
            self.decoder.decode(&[])?;
            self.upgrades.push(upgrade);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn via(&self) -> &str {
        &self.via
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Upgrades applied so far, in order.
    pub fn upgrades(&self) -> &[String] {
        &self.upgrades
    }

    /// Reply decoder positioned just after the ack, plus the applied upgrades.
    pub fn into_parts(self) -> (ClientDecoder, Vec<String>) {
        (self.decoder, self.upgrades)
    }

    fn with_preamble(&mut self, record: &[u8]) -> Bytes {
        match self.preamble.take() {
            Some(preamble) => {
                let mut out = BytesMut::with_capacity(preamble.len() + record.len());
                out.put_slice(&preamble);
                out.put_slice(record);
                out.freeze()
            }
            None => Bytes::copy_from_slice(record),
        }
    }

    fn error(&self, source: ProtocolError) -> crate::Error {
        DecoderError::new(
            self.decoder.preamble_state(),
            self.decoder.stream_position(),
            source,
        )
        .into()
    }
}

impl Feed for ClientHandshake {
    fn on_read(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut offset = 0;
        loop {
            if self.decoder.progress() == Progress::Fault {
                let fault = self.decoder.fault().unwrap_or_default();
                return Err(fault_error(fault, &self.via, &self.content_type));
            }
            match (self.decoder.preamble_state(), &self.phase) {
                (Some(ClientPreambleState::UpgradeResponse), Phase::AwaitUpgradeResponse(u)) => {
                    self.phase = Phase::Upgrade(u.clone());
                    return Ok(offset);
                }
                (Some(ClientPreambleState::UpgradeResponse), _) => {
                    return Err(self.error(ProtocolError::UnexpectedFrame(
                        "upgrade response without an upgrade request",
                    )));
                }
                (Some(ClientPreambleState::Start), Phase::AwaitAck) => {
                    tracing::debug!(via = %self.via, upgrades = self.upgrades.len(), "preamble acknowledged");
                    self.phase = Phase::Done;
                    return Ok(offset);
                }
                (Some(ClientPreambleState::Start), _) => {
                    return Err(self.error(ProtocolError::UnexpectedFrame(
                        "preamble ack in reply to an upgrade request",
                    )));
                }
                _ => {}
            }
            if self.decoder.needs_bytes() && offset == bytes.len() {
                return Ok(offset);
            }
            offset += self.decoder.decode(&bytes[offset..])?;
        }
    }

    fn premature_eof(&self) -> DecoderError {
        SessionDecoder::premature_eof(&self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encoder::{PREAMBLE_ACK, UPGRADE_RESPONSE};
    use crate::framing::{encode_fault, FaultKind};
    use crate::Error;

    fn handshake() -> ClientHandshake {
        ClientHandshake::new(
            FramingMode::Duplex,
            "net.tcp://localhost/svc",
            "application/soap+msbinsession1",
            &FramingSettings::default(),
        )
    }

    #[test]
    fn preamble_and_end_coalesce_without_upgrades() {
        let mut hs = handshake();
        assert_eq!(hs.next_step(), ClientStep::NextUpgrade);
        hs.on_next_upgrade(None).unwrap();
        let ClientStep::Write(out) = hs.next_step() else {
            panic!("expected a write");
        };
        let preamble = encode_preamble(
            FramingMode::Duplex,
            "net.tcp://localhost/svc",
            "application/soap+msbinsession1",
        );
        assert_eq!(&out[..preamble.len()], &preamble[..]);
        assert_eq!(&out[preamble.len()..], &PREAMBLE_END);
        assert_eq!(hs.next_step(), ClientStep::Read);
        assert_eq!(hs.on_read(&PREAMBLE_ACK).unwrap(), 1);
        assert_eq!(hs.next_step(), ClientStep::Done);
    }

    #[test]
    fn upgrade_round_then_ack() {
        let mut hs = handshake();
        hs.next_step();
        hs.on_next_upgrade(Some("application/test".into())).unwrap();
        let ClientStep::Write(out) = hs.next_step() else {
            panic!("expected a write");
        };
        assert!(out.ends_with(&encode_upgrade_request("application/test")));
        assert_eq!(hs.next_step(), ClientStep::Read);
        assert_eq!(hs.on_read(&UPGRADE_RESPONSE).unwrap(), 1);
        assert_eq!(hs.next_step(), ClientStep::Upgrade("application/test".into()));
        hs.on_upgraded().unwrap();
        assert_eq!(hs.next_step(), ClientStep::NextUpgrade);
        hs.on_next_upgrade(None).unwrap();
        assert_eq!(hs.next_step(), ClientStep::Write(Bytes::from_static(&PREAMBLE_END)));
        hs.next_step();
        hs.on_read(&PREAMBLE_ACK).unwrap();
        assert!(hs.is_done());
        assert_eq!(hs.upgrades(), ["application/test".to_string()]);
    }

    #[test]
    fn fault_reply_surfaces_negotiated_fault() {
        let mut hs = handshake();
        hs.next_step();
        hs.on_next_upgrade(None).unwrap();
        hs.next_step();
        let fault = encode_fault(&FaultKind::ViaTooLong.fault_string());
        match hs.on_read(&fault) {
            Err(Error::Fault(f)) => assert_eq!(f.kind, FaultKind::ViaTooLong),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_in_place_of_upgrade_response_is_rejected() {
        let mut hs = handshake();
        hs.next_step();
        hs.on_next_upgrade(Some("application/test".into())).unwrap();
        hs.next_step();
        assert!(matches!(hs.on_read(&PREAMBLE_ACK), Err(Error::Protocol(_))));
    }

    #[test]
    fn upgrade_limit_enforced() {
        let settings = FramingSettings {
            max_upgrades: 0,
            ..FramingSettings::default()
        };
        let mut hs = ClientHandshake::new(FramingMode::Duplex, "v", "c", &settings);
        hs.next_step();
        let err = hs.on_next_upgrade(Some("application/test".into())).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(DecoderError {
                source: ProtocolError::TooManyUpgrades(0),
                ..
            })
        ));
    }

    #[test]
    fn partial_reads_need_more() {
        let mut hs = handshake();
        hs.next_step();
        hs.on_next_upgrade(None).unwrap();
        hs.next_step();
        assert_eq!(hs.on_read(&[]).unwrap(), 0);
        assert_eq!(hs.next_step(), ClientStep::Read);
    }
}
