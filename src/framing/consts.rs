//! Constants for the framing protocol and its well-known fault strings.

use std::fmt;

/// Major version this implementation speaks; peers with another major are rejected.
pub const FRAMING_MAJOR_VERSION: u8 = 1;

/// Minor version written in outgoing preambles.
pub const FRAMING_MINOR_VERSION: u8 = 0;

/// Namespace every well-known fault string is rooted at.
pub const FAULT_NAMESPACE: &str = "http://schemas.microsoft.com/ws/2006/05/framing/faults/";

/// Upgrade content type of the TLS stream upgrade.
pub const TLS_UPGRADE: &str = "application/ssl-tls";

/// Maximum fault string size accepted from a peer.
pub const MAX_FAULT_SIZE: u32 = 256;

/// Why a peer terminated the handshake or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    EndpointNotFound,
    ContentTypeInvalid,
    ContentTypeTooLong,
    ServiceActivationFailed,
    MaxMessageSizeExceeded,
    UnsupportedMode,
    UnsupportedVersion,
    ServerTooBusy,
    UpgradeInvalid,
    ViaTooLong,
    ConnectionDispatchFailed,
    EndpointUnavailable,
    EndpointPaused,
    /// Any fault string this implementation does not know.
    Unrecognized,
}

const NAMED_FAULTS: [FaultKind; 13] = [
    FaultKind::EndpointNotFound,
    FaultKind::ContentTypeInvalid,
    FaultKind::ContentTypeTooLong,
    FaultKind::ServiceActivationFailed,
    FaultKind::MaxMessageSizeExceeded,
    FaultKind::UnsupportedMode,
    FaultKind::UnsupportedVersion,
    FaultKind::ServerTooBusy,
    FaultKind::UpgradeInvalid,
    FaultKind::ViaTooLong,
    FaultKind::ConnectionDispatchFailed,
    FaultKind::EndpointUnavailable,
    FaultKind::EndpointPaused,
];

impl FaultKind {
    /// Short name appended to [`FAULT_NAMESPACE`].
    pub const fn name(self) -> &'static str {
        match self {
            FaultKind::EndpointNotFound => "EndpointNotFound",
            FaultKind::ContentTypeInvalid => "ContentTypeInvalid",
            FaultKind::ContentTypeTooLong => "ContentTypeTooLong",
            FaultKind::ServiceActivationFailed => "ServiceActivationFailed",
            FaultKind::MaxMessageSizeExceeded => "MaxMessageSizeExceededFault",
            FaultKind::UnsupportedMode => "UnsupportedMode",
            FaultKind::UnsupportedVersion => "UnsupportedVersion",
            FaultKind::ServerTooBusy => "ServerTooBusy",
            FaultKind::UpgradeInvalid => "UpgradeInvalid",
            FaultKind::ViaTooLong => "ViaTooLong",
            FaultKind::ConnectionDispatchFailed => "ConnectionDispatchFailed",
            FaultKind::EndpointUnavailable => "EndpointUnavailable",
            FaultKind::EndpointPaused => "EndpointPaused",
            FaultKind::Unrecognized => "Unrecognized",
        }
    }

    /// Full fault string as written on the wire.
    pub fn fault_string(self) -> String {
        format!("{FAULT_NAMESPACE}{}", self.name())
    }

    /// Map a received fault string to its kind; unknown strings map to `Unrecognized`.
    pub fn from_fault_string(fault: &str) -> FaultKind {
        fault
            .strip_prefix(FAULT_NAMESPACE)
            .and_then(|name| NAMED_FAULTS.iter().copied().find(|k| k.name() == name))
            .unwrap_or(FaultKind::Unrecognized)
    }

    /// Human-readable explanation used in error messages.
    pub fn describe(self, content_type: &str) -> String {
        match self {
            FaultKind::EndpointNotFound => "no endpoint is listening at the via".to_string(),
            FaultKind::ContentTypeInvalid => {
                format!("the endpoint does not support content type {content_type:?}")
            }
            FaultKind::ContentTypeTooLong => {
                "the content type exceeds the size the endpoint accepts".to_string()
            }
            FaultKind::ServiceActivationFailed => "the service could not be activated".to_string(),
            FaultKind::MaxMessageSizeExceeded => {
                "the message exceeds the maximum size the endpoint accepts".to_string()
            }
            FaultKind::UnsupportedMode => "the endpoint does not support this mode".to_string(),
            FaultKind::UnsupportedVersion => {
                "the endpoint does not support this framing version".to_string()
            }
            FaultKind::ServerTooBusy => "the server is too busy to accept the session".to_string(),
            FaultKind::UpgradeInvalid => "the endpoint rejected the stream upgrade".to_string(),
            FaultKind::ViaTooLong => {
                "the via exceeds the maximum size the endpoint accepts".to_string()
            }
            FaultKind::ConnectionDispatchFailed => {
                "the connection could not be dispatched".to_string()
            }
            FaultKind::EndpointUnavailable => "the endpoint is unavailable".to_string(),
            FaultKind::EndpointPaused => "the endpoint is paused".to_string(),
            FaultKind::Unrecognized => "the peer sent an unrecognized fault".to_string(),
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_strings_roundtrip() {
        for kind in NAMED_FAULTS {
            assert_eq!(FaultKind::from_fault_string(&kind.fault_string()), kind);
        }
    }

    #[test]
    fn fault_lookup_falls_back() {
        assert_eq!(
            FaultKind::from_fault_string("ViaTooLong"),
            FaultKind::Unrecognized
        );
        assert_eq!(
            FaultKind::from_fault_string(&format!("{FAULT_NAMESPACE}Nope")),
            FaultKind::Unrecognized
        );
        assert_eq!(
            FaultKind::MaxMessageSizeExceeded.fault_string(),
            "http://schemas.microsoft.com/ws/2006/05/framing/faults/MaxMessageSizeExceededFault"
        );
    }
}
