//! Quotas, buffer sizes and timeouts shared by the decoders, connections and handshake drivers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framing::MAX_FAULT_SIZE;

/// Framing limits for one listener or one outbound connection factory.
///
/// Every field has a default, so partial configuration documents deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingSettings {
    /// Largest via string accepted in a preamble.
    pub max_via_size: u32,
    /// Largest extensible content type accepted in a preamble.
    pub max_content_type_size: u32,
    /// Largest upgrade content type accepted in an upgrade request.
    pub max_upgrade_size: u32,
    /// Largest fault string accepted from the peer.
    pub max_fault_size: u32,
    /// Largest envelope reassembled by the envelope readers.
    pub max_message_size: usize,
    /// Upper bound on bytes drained from a peer after sending it a fault.
    pub max_drain_size: usize,
    /// Size of the read buffer each connection session allocates once.
    pub connection_buffer_size: usize,
    /// Maximum upgrade rounds a single handshake may negotiate.
    pub max_upgrades: usize,
    /// Budget for the whole preamble handshake, upgrades included.
    #[serde(with = "duration_millis")]
    pub open_timeout: Duration,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            max_via_size: 2048,
            max_content_type_size: 256,
            max_upgrade_size: 256,
            max_fault_size: MAX_FAULT_SIZE,
            max_message_size: 64 * 1024,
            max_drain_size: 64 * 1024,
            connection_buffer_size: 8 * 1024,
            max_upgrades: 4,
            open_timeout: Duration::from_secs(60),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_uses_defaults() {
        let settings: FramingSettings =
            serde_json::from_str(r#"{"max_via_size": 10, "open_timeout": 1500}"#).unwrap();
        assert_eq!(settings.max_via_size, 10);
        assert_eq!(settings.open_timeout, Duration::from_millis(1500));
        assert_eq!(settings.max_fault_size, 256);
        assert_eq!(settings.connection_buffer_size, 8192);
    }

    #[test]
    fn serializes_timeout_as_millis() {
        let json = serde_json::to_value(FramingSettings::default()).unwrap();
        assert_eq!(json["open_timeout"], 60_000);
        let back: FramingSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, FramingSettings::default());
    }
}
