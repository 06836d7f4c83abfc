//! Preamble handshake: sans-I/O engines plus blocking and async drivers.
//!
//! [`ClientHandshake`] and [`ServerHandshake`] are state machines that never touch a
//! connection. They hand out steps (write these bytes, read more, upgrade the stream, ...)
//! and are told the outcome. [`blocking`] and [`nonblocking`] drive the same engines over
//! [`crate::connection::Connection`] and [`crate::connection::AsyncConnection`], so the two
//! execution models differ only in how they wait.

pub mod blocking;
mod client;
mod envelope;
mod fault;
pub mod nonblocking;
mod server;
mod session;

use std::fmt;
use std::sync::Arc;

pub use client::{ClientHandshake, ClientStep};
pub use envelope::EnvelopeReader;
pub use fault::fault_error;
pub use server::{ServerHandshake, ServerStep};
pub use session::{ClientSession, ServerSession};

use crate::config::FramingSettings;
use crate::error::DecoderError;
use crate::framing::{FaultKind, FramingMode, HandshakeModeDecoder};
use crate::Result;

/// Outcome of checking a via before a session is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaValidation {
    Accepted,
    /// Close the connection without replying.
    Rejected,
    /// Reply with a fault, typically `EndpointNotFound`, `ServiceActivationFailed` or
    /// `ServerTooBusy`, then close.
    Fault(FaultKind),
}

type ViaValidator = dyn Fn(&str) -> ViaValidation + Send + Sync;

/// What a listening endpoint accepts.
#[derive(Clone, Default)]
pub struct Endpoint {
    content_types: Vec<String>,
    via_validator: Option<Arc<ViaValidator>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("content_types", &self.content_types)
            .field("via_validator", &self.via_validator.is_some())
            .finish()
    }
}

impl Endpoint {
    /// An endpoint accepting every via and content type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict sessions to these content types. An empty list accepts any.
    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_via_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> ViaValidation + Send + Sync + 'static,
    {
        self.via_validator = Some(Arc::new(validator));
        self
    }

    pub fn validate_via(&self, via: &str) -> ViaValidation {
        match &self.via_validator {
            Some(validate) => validate(via),
            None => ViaValidation::Accepted,
        }
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        self.content_types.is_empty() || self.content_types.iter().any(|c| c == content_type)
    }
}

/// Session parameters of an outbound connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub mode: FramingMode,
    pub via: String,
    pub content_type: String,
    pub settings: FramingSettings,
}

impl ClientOptions {
    pub fn new(mode: FramingMode, via: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            mode,
            via: via.into(),
            content_type: content_type.into(),
            settings: FramingSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: FramingSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// An engine that consumes bytes from the driver's read buffer.
pub(crate) trait Feed {
    /// Decode from `bytes`, returning how many were consumed.
    fn on_read(&mut self, bytes: &[u8]) -> Result<usize>;

    fn premature_eof(&self) -> DecoderError;
}

impl Feed for HandshakeModeDecoder {
    fn on_read(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut offset = 0;
        while !self.is_done() && offset < bytes.len() {
            offset += self.decode(&bytes[offset..])?;
        }
        Ok(offset)
    }

    fn premature_eof(&self) -> DecoderError {
        HandshakeModeDecoder::premature_eof(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_accept_everything() {
        let endpoint = Endpoint::new();
        assert!(endpoint.accepts_content_type("application/anything"));
        assert_eq!(endpoint.validate_via("net.tcp://x/"), ViaValidation::Accepted);
    }

    #[test]
    fn endpoint_filters() {
        let endpoint = Endpoint::new()
            .with_content_types(["application/soap+msbinsession1"])
            .with_via_validator(|via| {
                if via.ends_with("/svc") {
                    ViaValidation::Accepted
                } else {
                    ViaValidation::Fault(FaultKind::EndpointNotFound)
                }
            });
        assert!(endpoint.accepts_content_type("application/soap+msbinsession1"));
        assert!(!endpoint.accepts_content_type("text/plain"));
        assert_eq!(endpoint.validate_via("net.tcp://h/svc"), ViaValidation::Accepted);
        assert_eq!(
            endpoint.validate_via("net.tcp://h/other"),
            ViaValidation::Fault(FaultKind::EndpointNotFound)
        );
    }
}
