//! Error types for framing, connections and stream upgrades.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::framing::{FaultKind, RecordType, StringKind};

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by decoders, connections, the handshake engine and upgrade providers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("framing protocol: {0}")]
    Protocol(#[from] DecoderError),

    #[error(transparent)]
    Fault(#[from] NegotiatedFault),

    /// A locally detected condition that is reported to the peer as a fault.
    #[error("rejected ({fault}): {reason}")]
    Rejected { fault: FaultKind, reason: String },

    /// The connection refused the via; the session is closed without a reply.
    #[error("via {via:?} refused by the connection")]
    ViaRefused { via: String },

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("security negotiation: {0}")]
    Security(#[from] SecurityError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Fault that should be written back to the peer before closing, if any.
    pub fn fault_to_send(&self) -> Option<FaultKind> {
        match self {
            Error::Protocol(e) => e.source.fault(),
            Error::Rejected { fault, .. } => Some(*fault),
            _ => None,
        }
    }

    /// Whether this error is a timeout anywhere along the handshake.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Timeout { .. }))
    }
}

/// A protocol error annotated with the decoder state and stream position where it occurred.
#[derive(Error, Debug)]
#[error("{source} (state {state}, stream position {position})")]
pub struct DecoderError {
    pub state: String,
    pub position: u64,
    #[source]
    pub source: ProtocolError,
}

impl DecoderError {
    pub fn new(state: impl std::fmt::Debug, position: u64, source: ProtocolError) -> Self {
        Self {
            state: format!("{state:?}"),
            position,
            source,
        }
    }
}

/// Malformed or unexpected framing data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected record type {expected}, found {found:#04x}")]
    InvalidRecordType { expected: Expected, found: u8 },

    #[error("{}", unexpected_ack_message(.found))]
    UnexpectedAck { found: u8 },

    #[error("{kind} of {size} bytes exceeds the quota of {quota} bytes")]
    QuotaExceeded { kind: StringKind, size: u32, quota: u32 },

    #[error("encoded size is too large")]
    SizeTooLarge,

    #[error("unsupported framing version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unsupported framing mode {0:#04x}")]
    UnsupportedMode(u8),

    #[error("unknown known-encoding value {0:#04x}")]
    InvalidKnownEncoding(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(StringKind),

    #[error("envelope of {size} bytes exceeds the maximum message size of {max} bytes")]
    EnvelopeTooLarge { size: u64, max: usize },

    #[error("decode called after the decoder reached its final state")]
    DecodePastEnd,

    #[error("the stream ended before framing was complete")]
    PrematureEof,

    #[error("upgrade {0:?} requested but not supported")]
    UpgradeNotSupported(String),

    #[error("too many upgrades requested (limit {0})")]
    TooManyUpgrades(usize),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

impl ProtocolError {
    /// Fault string the local side reports to the peer for this error, if it has one.
    pub fn fault(&self) -> Option<FaultKind> {
        match self {
            ProtocolError::QuotaExceeded { kind, .. } => kind.quota_fault(),
            ProtocolError::UnsupportedVersion { .. } => Some(FaultKind::UnsupportedVersion),
            ProtocolError::UnsupportedMode(_) => Some(FaultKind::UnsupportedMode),
            ProtocolError::InvalidKnownEncoding(_) => Some(FaultKind::ContentTypeInvalid),
            ProtocolError::EnvelopeTooLarge { .. } => Some(FaultKind::MaxMessageSizeExceeded),
            ProtocolError::UpgradeNotSupported(_) | ProtocolError::TooManyUpgrades(_) => {
                Some(FaultKind::UpgradeInvalid)
            }
            _ => None,
        }
    }
}

fn unexpected_ack_message(found: &u8) -> String {
    let found = *found;
    if found == b'h' || found == b'H' {
        format!(
            "expected a preamble ack, found {found:#04x}; the remote endpoint may be an HTTP \
             server rather than a framing endpoint"
        )
    } else {
        format!("expected a preamble ack, found {found:#04x}")
    }
}

/// What the decoder expected at the position where an invalid record type was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Record(RecordType),
    OneOf(&'static [RecordType]),
}

impl std::fmt::Display for Expected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expected::Record(r) => write!(f, "{r}"),
            Expected::OneOf(records) => {
                for (i, r) in records.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{r}")?;
                }
                Ok(())
            }
        }
    }
}

/// A named fault the peer sent while terminating the handshake or session.
#[derive(Error, Debug, Clone)]
#[error("{} (fault {fault:?}, via {via:?})", .kind.describe(.content_type))]
pub struct NegotiatedFault {
    pub kind: FaultKind,
    pub fault: String,
    pub via: String,
    pub content_type: String,
}

/// Connection-level I/O failures.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("connection aborted")]
    Aborted,

    #[error("connection closed by peer")]
    Closed,

    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Classify an I/O error raised while an operation with `timeout` was outstanding.
    pub fn from_io(err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ConnectionError::Timeout { timeout }
            }
            io::ErrorKind::ConnectionAborted => ConnectionError::Aborted,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
            _ => ConnectionError::Io(err),
        }
    }

    /// Lossy conversion for stream adapters that must speak `io::Error`.
    pub fn into_io(self) -> io::Error {
        match self {
            ConnectionError::Timeout { timeout } => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("operation timed out after {timeout:?}"),
            ),
            ConnectionError::Aborted => io::ErrorKind::ConnectionAborted.into(),
            ConnectionError::Closed => io::ErrorKind::BrokenPipe.into(),
            ConnectionError::Io(e) => e,
        }
    }
}

/// Security upgrade failures. Always fatal to the negotiation.
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("the remote party did not present a client certificate")]
    ClientCertificateMissing,

    #[error("no server certificate is configured")]
    MissingServerCertificate,

    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("credentials: {0}")]
    Credentials(String),

    #[error("TLS configuration: {0}")]
    Config(String),

    #[error("upgrade provider is not open")]
    NotOpen,
}
