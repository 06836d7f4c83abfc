//! Open sessions returned by the handshake drivers.

use std::time::Duration;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};

use super::fault::{send_fault, send_fault_async};
use super::EnvelopeReader;
use crate::connection::{AsyncConnection, Connection, ReadBuffer, TimeoutHelper};
use crate::error::{DecoderError, ProtocolError};
use crate::framing::encoder::END;
use crate::framing::{
    encode_sized_envelope, ClientDecoder, FramingMode, ServerDecoder, SingletonChunkWriter,
};
use crate::upgrade::RemoteSecurity;
use crate::Result;

/// Which side of the session a frame is written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// Write-side bookkeeping shared by both session types.
#[derive(Debug)]
struct Outbound {
    mode: FramingMode,
    side: Side,
    /// The End record (or a terminating singleton body) has been written.
    ended: bool,
}

impl Outbound {
    fn envelope(&mut self, payload: &[u8]) -> Result<Bytes> {
        if self.ended {
            return Err(anyhow!("the session has already ended").into());
        }
        match (self.side, self.mode) {
            (_, FramingMode::Singleton) => {
                let mut out = BytesMut::with_capacity(payload.len() + 8);
                let mut writer = SingletonChunkWriter::new();
                writer.chunk(payload, &mut out);
                writer.finish(&mut out);
                self.ended = true;
                Ok(out.freeze())
            }
            (Side::Client, FramingMode::SingletonSized) => {
                self.ended = true;
                Ok(Bytes::copy_from_slice(payload))
            }
            (Side::Server, FramingMode::Simplex) => {
                Err(anyhow!("simplex sessions carry no replies").into())
            }
            _ => encode_sized_envelope(payload).ok_or_else(|| {
                anyhow!("envelope of {} bytes does not fit a sized envelope", payload.len()).into()
            }),
        }
    }

    /// Trailer written on close, if any.
    fn end(&mut self) -> Option<&'static [u8]> {
        let sized_client = self.side == Side::Client && self.mode == FramingMode::SingletonSized;
        if std::mem::replace(&mut self.ended, true) || sized_client {
            None
        } else {
            Some(&END)
        }
    }
}

/// An established client session: the (possibly upgraded) connection and the state needed
/// to exchange envelopes over it.
pub struct ClientSession<C: ?Sized> {
    connection: Box<C>,
    mode: FramingMode,
    upgrades: Vec<String>,
    remote_security: Option<RemoteSecurity>,
    reader: EnvelopeReader<ClientDecoder>,
    buffer: ReadBuffer,
    outbound: Outbound,
}

/// An established server session.
pub struct ServerSession<C: ?Sized> {
    connection: Box<C>,
    mode: FramingMode,
    upgrades: Vec<String>,
    remote_security: Option<RemoteSecurity>,
    reader: EnvelopeReader<ServerDecoder>,
    buffer: ReadBuffer,
    outbound: Outbound,
    max_message_size: usize,
    max_drain_size: usize,
    /// Sized singleton payload already delivered.
    delivered: bool,
}

macro_rules! session_common {
    ($session:ident) => {
        impl<C: ?Sized> $session<C> {
            pub fn mode(&self) -> FramingMode {
                self.mode
            }

            pub fn via(&self) -> &str {
                self.reader.via()
            }

            pub fn content_type(&self) -> &str {
                self.reader.content_type()
            }

            /// Upgrades applied during the handshake, in order.
            pub fn upgrades(&self) -> &[String] {
                &self.upgrades
            }

            /// Security established by the last upgrade, if it authenticated anything.
            pub fn remote_security(&self) -> Option<&RemoteSecurity> {
                self.remote_security.as_ref()
            }

            /// Bytes read past the handshake that have not been decoded yet.
            pub fn leftover(&self) -> &[u8] {
                self.buffer.filled()
            }

            pub fn connection(&mut self) -> &mut C {
                &mut self.connection
            }

            /// Hand the connection and any read-ahead bytes to another protocol layer.
            pub fn into_parts(mut self) -> (Box<C>, Vec<u8>) {
                let leftover = self.buffer.take_remaining();
                (self.connection, leftover)
            }
        }
    };
}

session_common!(ClientSession);
session_common!(ServerSession);

impl<C: ?Sized> ClientSession<C> {
    pub(crate) fn new(
        connection: Box<C>,
        mode: FramingMode,
        upgrades: Vec<String>,
        remote_security: Option<RemoteSecurity>,
        reader: EnvelopeReader<ClientDecoder>,
        buffer: ReadBuffer,
    ) -> Self {
        Self {
            connection,
            mode,
            upgrades,
            remote_security,
            reader,
            buffer,
            outbound: Outbound {
                mode,
                side: Side::Client,
                ended: false,
            },
        }
    }
}

impl<C: ?Sized> ServerSession<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection: Box<C>,
        mode: FramingMode,
        upgrades: Vec<String>,
        remote_security: Option<RemoteSecurity>,
        reader: EnvelopeReader<ServerDecoder>,
        buffer: ReadBuffer,
        max_message_size: usize,
        max_drain_size: usize,
    ) -> Self {
        Self {
            connection,
            mode,
            upgrades,
            remote_security,
            reader,
            buffer,
            outbound: Outbound {
                mode,
                side: Side::Server,
                ended: false,
            },
            max_message_size,
            max_drain_size,
            delivered: false,
        }
    }

    fn check_sized_payload(&self, total: usize) -> std::result::Result<(), DecoderError> {
        if total > self.max_message_size {
            return Err(DecoderError::new(
                self.mode,
                self.reader.decoder().stream_position(),
                ProtocolError::EnvelopeTooLarge {
                    size: total as u64,
                    max: self.max_message_size,
                },
            ));
        }
        Ok(())
    }
}

impl ClientSession<dyn Connection> {
    pub fn send_envelope(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let frame = self.outbound.envelope(payload)?;
        self.connection.write(&frame, true, timeout)?;
        Ok(())
    }

    /// Next envelope from the server; `Ok(None)` once it ended the session.
    pub fn receive_envelope(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let result = self
            .reader
            .read_envelope(self.connection.as_mut(), &mut self.buffer, timeout);
        if result.is_err() {
            self.connection.abort();
        }
        result
    }

    /// Write End (where the mode has one) and half-close.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        if let Some(end) = self.outbound.end() {
            self.connection.write(end, true, helper.remaining_or_timeout()?)?;
        }
        self.connection.shutdown(helper.remaining_or_timeout()?)?;
        Ok(())
    }
}

impl ClientSession<dyn AsyncConnection> {
    pub async fn send_envelope(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let frame = self.outbound.envelope(payload)?;
        self.connection.write(&frame, true, timeout).await?;
        Ok(())
    }

    pub async fn receive_envelope(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let result = self
            .reader
            .read_envelope_async(self.connection.as_mut(), &mut self.buffer, timeout)
            .await;
        if result.is_err() {
            self.connection.abort();
        }
        result
    }

    pub async fn close(&mut self, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        if let Some(end) = self.outbound.end() {
            self.connection
                .write(end, true, helper.remaining_or_timeout()?)
                .await?;
        }
        self.connection
            .shutdown(helper.remaining_or_timeout()?)
            .await?;
        Ok(())
    }
}

impl ServerSession<dyn Connection> {
    pub fn send_envelope(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let frame = self.outbound.envelope(payload)?;
        self.connection.write(&frame, true, timeout)?;
        Ok(())
    }

    /// Next envelope from the client; `Ok(None)` once it ended the session. Limit
    /// violations are reported to the client as faults before the connection closes.
    pub fn receive_envelope(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let helper = TimeoutHelper::new(timeout);
        let result = if self.mode == FramingMode::SingletonSized {
            self.read_sized_singleton(&helper)
        } else {
            self.reader
                .read_envelope(self.connection.as_mut(), &mut self.buffer, timeout)
        };
        if let Err(e) = &result {
            match e.fault_to_send() {
                Some(fault) => {
                    send_fault(self.connection.as_mut(), fault, self.max_drain_size, &helper)
                }
                None => self.connection.abort(),
            }
        }
        result
    }

    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        if let Some(end) = self.outbound.end() {
            self.connection.write(end, true, helper.remaining_or_timeout()?)?;
        }
        self.connection.shutdown(helper.remaining_or_timeout()?)?;
        Ok(())
    }

    /// A sized singleton carries its single envelope as the rest of the stream.
    fn read_sized_singleton(&mut self, helper: &TimeoutHelper) -> Result<Option<Bytes>> {
        if std::mem::replace(&mut self.delivered, true) {
            return Ok(None);
        }
        let mut payload = BytesMut::from(&self.buffer.take_remaining()[..]);
        loop {
            self.check_sized_payload(payload.len())?;
            let read = self
                .buffer
                .fill(self.connection.as_mut(), helper.remaining_or_timeout()?)
                .map_err(|e| helper.classify(e))?;
            if read == 0 {
                return Ok(Some(payload.freeze()));
            }
            payload.extend_from_slice(&self.buffer.take_remaining());
        }
    }
}

impl ServerSession<dyn AsyncConnection> {
    pub async fn send_envelope(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let frame = self.outbound.envelope(payload)?;
        self.connection.write(&frame, true, timeout).await?;
        Ok(())
    }

    pub async fn receive_envelope(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let helper = TimeoutHelper::new(timeout);
        let result = if self.mode == FramingMode::SingletonSized {
            self.read_sized_singleton(&helper).await
        } else {
            self.reader
                .read_envelope_async(self.connection.as_mut(), &mut self.buffer, timeout)
                .await
        };
        if let Err(e) = &result {
            match e.fault_to_send() {
                Some(fault) => {
                    send_fault_async(self.connection.as_mut(), fault, self.max_drain_size, &helper)
                        .await
                }
                None => self.connection.abort(),
            }
        }
        result
    }

    pub async fn close(&mut self, timeout: Duration) -> Result<()> {
        let helper = TimeoutHelper::new(timeout);
        if let Some(end) = self.outbound.end() {
            self.connection
                .write(end, true, helper.remaining_or_timeout()?)
                .await?;
        }
        self.connection
            .shutdown(helper.remaining_or_timeout()?)
            .await?;
        Ok(())
    }

    async fn read_sized_singleton(&mut self, helper: &TimeoutHelper) -> Result<Option<Bytes>> {
        if std::mem::replace(&mut self.delivered, true) {
            return Ok(None);
        }
        let mut payload = BytesMut::from(&self.buffer.take_remaining()[..]);
        loop {
            self.check_sized_payload(payload.len())?;
            let read = self
                .buffer
                .fill_async(self.connection.as_mut(), helper.remaining_or_timeout()?)
                .await
                .map_err(|e| helper.classify(e))?;
            if read == 0 {
                return Ok(Some(payload.freeze()));
            }
            payload.extend_from_slice(&self.buffer.take_remaining());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(side: Side, mode: FramingMode) -> Outbound {
        Outbound {
            mode,
            side,
            ended: false,
        }
    }

    #[test]
    fn duplex_frames_are_sized_and_closed_with_end() {
        let mut out = outbound(Side::Client, FramingMode::Duplex);
        let frame = out.envelope(b"abc").unwrap();
        assert_eq!(&frame[..], &[0x06, 0x03, b'a', b'b', b'c']);
        assert_eq!(out.end(), Some(&END[..]));
        assert_eq!(out.end(), None);
    }

    #[test]
    fn singleton_body_ends_the_session() {
        let mut out = outbound(Side::Server, FramingMode::Singleton);
        let frame = out.envelope(b"ab").unwrap();
        assert_eq!(&frame[..], &[0x05, 0x02, b'a', b'b', 0x00, 0x07]);
        assert!(out.envelope(b"again").is_err());
        assert_eq!(out.end(), None);
    }

    #[test]
    fn sized_singleton_client_writes_raw_payload() {
        let mut out = outbound(Side::Client, FramingMode::SingletonSized);
        assert_eq!(&out.envelope(b"raw").unwrap()[..], b"raw");
        assert_eq!(out.end(), None);
    }

    #[test]
    fn simplex_server_cannot_reply() {
        let mut out = outbound(Side::Server, FramingMode::Simplex);
        assert!(out.envelope(b"x").is_err());
    }
}
