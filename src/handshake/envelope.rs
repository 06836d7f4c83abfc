//! Whole-envelope reassembly on top of the session decoders.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::fault_error;
use crate::connection::{AsyncConnection, Connection, ReadBuffer, TimeoutHelper};
use crate::error::{DecoderError, ProtocolError};
use crate::framing::singleton::SingletonMessageState;
use crate::framing::{Progress, SessionDecoder, SingletonMessageDecoder};
use crate::Result;

/// Reassembles complete envelopes from a session decoder positioned after the preamble.
///
/// Sized envelopes are bounded by `max_message_size` before any payload is buffered;
/// chunked singleton bodies are bounded as their chunks arrive.
#[derive(Debug)]
pub struct EnvelopeReader<D> {
    decoder: D,
    body: Option<SingletonMessageDecoder>,
    max_message_size: usize,
    envelope: BytesMut,
    finished: bool,
    via: String,
    content_type: String,
}

impl<D: SessionDecoder> EnvelopeReader<D> {
    pub fn new(
        decoder: D,
        max_message_size: usize,
        via: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            decoder,
            body: None,
            max_message_size,
            envelope: BytesMut::new(),
            finished: false,
            via: via.into(),
            content_type: content_type.into(),
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn via(&self) -> &str {
        &self.via
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Whether the peer ended the session; no further envelopes will be produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode from `bytes`. Returns the bytes consumed and, when one completed, an envelope.
    /// Without an envelope every byte has been consumed and more input is needed, unless
    /// the session has finished.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<(usize, Option<Bytes>)> {
        let mut offset = 0;
        loop {
            if self.finished {
                return Ok((offset, None));
            }
            if let Some(body) = self.body.as_mut() {
                match body.state() {
                    SingletonMessageState::EnvelopeEnd => {
                        body.decode(&[])?;
                        return Ok((offset, Some(self.envelope.split().freeze())));
                    }
                    SingletonMessageState::End => {
                        self.finished = true;
                        continue;
                    }
                    _ => {}
                }
                if body.needs_bytes() && offset == bytes.len() {
                    return Ok((offset, None));
                }
                let payload = body.state() == SingletonMessageState::ReadingEnvelopeBytes;
                let n = body.decode(&bytes[offset..])?;
                let position = body.stream_position();
                if payload {
                    self.append(&bytes[offset..offset + n], position)?;
                }
                offset += n;
                continue;
            }

            match self.decoder.progress() {
                Progress::EnvelopeStart { size: Some(size) } => {
                    if size as usize > self.max_message_size {
                        return Err(self.too_large(u64::from(size)).into());
                    }
                    self.envelope.reserve(size as usize);
                }
                Progress::EnvelopeStart { size: None } => {
                    self.body = Some(SingletonMessageDecoder::new(self.decoder.stream_position()));
                    continue;
                }
                Progress::EnvelopeEnd => {
                    self.decoder.decode(&[])?;
                    return Ok((offset, Some(self.envelope.split().freeze())));
                }
                Progress::End => {
                    tracing::trace!(via = %self.via, "peer ended the session");
                    self.finished = true;
                    continue;
                }
                Progress::Fault => {
                    let fault = self.decoder.fault().unwrap_or_default();
                    return Err(fault_error(fault, &self.via, &self.content_type));
                }
                Progress::Pending | Progress::EnvelopeBytes => {}
            }
            if self.decoder.needs_bytes() && offset == bytes.len() {
                return Ok((offset, None));
            }
            let payload = self.decoder.in_envelope_bytes();
            let n = self.decoder.decode(&bytes[offset..])?;
            if payload {
                self.envelope.extend_from_slice(&bytes[offset..offset + n]);
            }
            offset += n;
        }
    }

    /// Error describing an end of stream at the current position.
    pub fn premature_eof(&self) -> DecoderError {
        match &self.body {
            Some(body) => body.premature_eof(),
            None => self.decoder.premature_eof(),
        }
    }

    /// Read the next envelope from `conn`, with unconsumed input kept in `buffer`.
    /// `Ok(None)` means the peer ended the session.
    pub fn read_envelope<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        buffer: &mut ReadBuffer,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let helper = TimeoutHelper::new(timeout);
        loop {
            let (n, envelope) = self.decode(buffer.filled())?;
            buffer.consume(n);
            if envelope.is_some() || self.finished {
                return Ok(envelope);
            }
            let read = buffer
                .fill(conn, helper.remaining_or_timeout()?)
                .map_err(|e| helper.classify(e))?;
            if read == 0 {
                return Err(self.premature_eof().into());
            }
        }
    }

    pub async fn read_envelope_async<C: AsyncConnection + ?Sized>(
        &mut self,
        conn: &mut C,
        buffer: &mut ReadBuffer,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        let helper = TimeoutHelper::new(timeout);
        loop {
            let (n, envelope) = self.decode(buffer.filled())?;
            buffer.consume(n);
            if envelope.is_some() || self.finished {
                return Ok(envelope);
            }
            let read = buffer
                .fill_async(conn, helper.remaining_or_timeout()?)
                .await
                .map_err(|e| helper.classify(e))?;
            if read == 0 {
                return Err(self.premature_eof().into());
            }
        }
    }

    fn append(&mut self, chunk: &[u8], position: u64) -> std::result::Result<(), DecoderError> {
        let size = self.envelope.len() + chunk.len();
        if size > self.max_message_size {
            return Err(DecoderError::new(
                SingletonMessageState::ReadingEnvelopeBytes,
                position,
                ProtocolError::EnvelopeTooLarge {
                    size: size as u64,
                    max: self.max_message_size,
                },
            ));
        }
        self.envelope.extend_from_slice(chunk);
        Ok(())
    }

    fn too_large(&self, size: u64) -> DecoderError {
        DecoderError::new(
            self.decoder.progress(),
            self.decoder.stream_position(),
            ProtocolError::EnvelopeTooLarge {
                size,
                max: self.max_message_size,
            },
        )
    }
}
