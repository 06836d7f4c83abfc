//! Record type, mode and known-encoding bytes of the framing wire format.
//! The numeric values are a contract with the peer and must never be renumbered.

use std::fmt;

/// One-byte tag at the start of every framing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Version = 0x00,
    Mode = 0x01,
    Via = 0x02,
    KnownEncoding = 0x03,
    ExtensibleEncoding = 0x04,
    UnsizedEnvelope = 0x05,
    SizedEnvelope = 0x06,
    End = 0x07,
    Fault = 0x08,
    UpgradeRequest = 0x09,
    UpgradeResponse = 0x0A,
    PreambleAck = 0x0B,
    PreambleEnd = 0x0C,
}

impl RecordType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            RecordType::Version => "Version",
            RecordType::Mode => "Mode",
            RecordType::Via => "Via",
            RecordType::KnownEncoding => "KnownEncoding",
            RecordType::ExtensibleEncoding => "ExtensibleEncoding",
            RecordType::UnsizedEnvelope => "UnsizedEnvelope",
            RecordType::SizedEnvelope => "SizedEnvelope",
            RecordType::End => "End",
            RecordType::Fault => "Fault",
            RecordType::UpgradeRequest => "UpgradeRequest",
            RecordType::UpgradeResponse => "UpgradeResponse",
            RecordType::PreambleAck => "PreambleAck",
            RecordType::PreambleEnd => "PreambleEnd",
        }
    }
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => RecordType::Version,
            0x01 => RecordType::Mode,
            0x02 => RecordType::Via,
            0x03 => RecordType::KnownEncoding,
            0x04 => RecordType::ExtensibleEncoding,
            0x05 => RecordType::UnsizedEnvelope,
            0x06 => RecordType::SizedEnvelope,
            0x07 => RecordType::End,
            0x08 => RecordType::Fault,
            0x09 => RecordType::UpgradeRequest,
            0x0A => RecordType::UpgradeResponse,
            0x0B => RecordType::PreambleAck,
            0x0C => RecordType::PreambleEnd,
            other => return Err(other),
        })
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session shape negotiated in the Mode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FramingMode {
    /// One unsized (chunked) envelope per connection.
    Singleton = 0x01,
    /// Many sized envelopes in both directions over one connection.
    Duplex = 0x02,
    /// Sized envelopes in one direction only.
    Simplex = 0x03,
    /// One envelope whose length is carried out of band.
    SingletonSized = 0x04,
}

impl FramingMode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FramingMode::Singleton),
            0x02 => Some(FramingMode::Duplex),
            0x03 => Some(FramingMode::Simplex),
            0x04 => Some(FramingMode::SingletonSized),
            _ => None,
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FramingMode::Singleton => "singleton",
            FramingMode::Duplex => "duplex",
            FramingMode::Simplex => "simplex",
            FramingMode::SingletonSized => "singleton-sized",
        })
    }
}

/// Content types that travel as a single byte instead of a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KnownEncoding {
    Soap11Utf8 = 0x00,
    Soap11Utf16 = 0x01,
    Soap11Utf16FFFE = 0x02,
    Soap12Utf8 = 0x03,
    Soap12Utf16 = 0x04,
    Soap12Utf16FFFE = 0x05,
    Mtom = 0x06,
    Binary = 0x07,
    BinarySession = 0x08,
}

const KNOWN_ENCODINGS: [KnownEncoding; 9] = [
    KnownEncoding::Soap11Utf8,
    KnownEncoding::Soap11Utf16,
    KnownEncoding::Soap11Utf16FFFE,
    KnownEncoding::Soap12Utf8,
    KnownEncoding::Soap12Utf16,
    KnownEncoding::Soap12Utf16FFFE,
    KnownEncoding::Mtom,
    KnownEncoding::Binary,
    KnownEncoding::BinarySession,
];

impl KnownEncoding {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        KNOWN_ENCODINGS.get(usize::from(value)).copied()
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            KnownEncoding::Soap11Utf8 => "text/xml; charset=utf-8",
            KnownEncoding::Soap11Utf16 => "text/xml; charset=utf-16",
            KnownEncoding::Soap11Utf16FFFE => "text/xml; charset=unicodeFFFE",
            KnownEncoding::Soap12Utf8 => "application/soap+xml; charset=utf-8",
            KnownEncoding::Soap12Utf16 => "application/soap+xml; charset=utf-16",
            KnownEncoding::Soap12Utf16FFFE => "application/soap+xml; charset=unicodeFFFE",
            KnownEncoding::Mtom => "multipart/related",
            KnownEncoding::Binary => "application/soap+msbin1",
            KnownEncoding::BinarySession => "application/soap+msbinsession1",
        }
    }

    /// Exact (byte-for-byte) match against the known content type strings.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        KNOWN_ENCODINGS
            .iter()
            .copied()
            .find(|e| e.content_type() == content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_types_are_fixed() {
        for b in 0x00..=0x0Cu8 {
            let r = RecordType::try_from(b).unwrap();
            assert_eq!(r.as_u8(), b);
        }
        assert_eq!(RecordType::try_from(0x0D), Err(0x0D));
        assert_eq!(RecordType::PreambleAck.as_u8(), 0x0B);
    }

    #[test]
    fn modes_are_fixed() {
        assert_eq!(FramingMode::Singleton.as_u8(), 1);
        assert_eq!(FramingMode::Duplex.as_u8(), 2);
        assert_eq!(FramingMode::Simplex.as_u8(), 3);
        assert_eq!(FramingMode::SingletonSized.as_u8(), 4);
        assert_eq!(FramingMode::from_u8(0), None);
        assert_eq!(FramingMode::from_u8(5), None);
    }

    #[test]
    fn known_encodings_map_both_ways() {
        for (i, e) in KNOWN_ENCODINGS.iter().enumerate() {
            assert_eq!(usize::from(e.as_u8()), i);
            assert_eq!(KnownEncoding::from_content_type(e.content_type()), Some(*e));
        }
        assert_eq!(KnownEncoding::from_u8(9), None);
        assert_eq!(KnownEncoding::from_content_type("text/plain"), None);
    }
}
