//! FVP wire protocol
//!
//! Canonical definitions for the FVP on-wire format: a fixed 12-byte header
//! followed by an opaque payload.
//!
//! ```text
//! [3: magic "FVP"] [1: type] [1: peer id] [4: sequence LE] [2: length LE] [1: version]
//! ```
//!
//! The version byte packs `(minor << 3) | patch`; the major version is
//! implicit and fixed at 1.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Wire protocol magic, first three bytes of every packet.
pub const MAGIC: [u8; 3] = *b"FVP";
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 12;
/// The only structural major version the header encoding can carry.
pub const PROTOCOL_MAJOR: u8 = 1;

// Version byte stamped on outgoing packets. Binaries initialize it from
// the crate version at startup; protocol 1.0.0 until then.
static VERSION_BYTE: AtomicU8 = AtomicU8::new(version_byte(0, 0));

/// The wire version byte currently stamped on outgoing packets.
pub fn protocol_version() -> u8 {
    VERSION_BYTE.load(Ordering::Relaxed)
}

/// Derive the wire version byte from a `major.minor.patch` version string
/// and make it the one [`Packet::new`] stamps. Called once at binary
/// startup; a malformed or unencodable version leaves the byte unchanged.
pub fn init_protocol_version(version: &str) -> Result<()> {
    let mut parts = version.split('.');
    let mut component = |name: &str| -> Result<u8> {
        parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Config(format!("invalid {} version in {:?}", name, version)))
    };
    let major = component("major")?;
    let minor = component("minor")?;
    let patch = component("patch")?;
    VERSION_BYTE.store(encode_version(major, minor, patch)?, Ordering::Relaxed);
    Ok(())
}

/// The four packet types carried in the header's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Auth = 2,
    Ping = 3,
    Pong = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Data),
            2 => Ok(PacketType::Auth),
            3 => Ok(PacketType::Ping),
            4 => Ok(PacketType::Pong),
            other => Err(Error::BadType(other)),
        }
    }
}

/// Pack minor (5 bits) and patch (3 bits) into the wire version byte.
pub const fn version_byte(minor: u8, patch: u8) -> u8 {
    (minor << 3) | (patch & 0x07)
}

/// Split a wire version byte into (major, minor, patch). The major is not
/// encoded and is always 1.
pub const fn version_parts(byte: u8) -> (u8, u8, u8) {
    (PROTOCOL_MAJOR, byte >> 3, byte & 0x07)
}

/// Range-checked version byte construction. The encoding only has room for
/// major 1, minor 0..=31, patch 0..=7.
pub fn encode_version(major: u8, minor: u8, patch: u8) -> Result<u8> {
    if major != PROTOCOL_MAJOR {
        return Err(Error::VersionMismatch { got: major, want: PROTOCOL_MAJOR });
    }
    if minor > 31 {
        return Err(Error::Config(format!("protocol minor must be 0-31, got {}", minor)));
    }
    if patch > 7 {
        return Err(Error::Config(format!("protocol patch must be 0-7, got {}", patch)));
    }
    Ok(version_byte(minor, patch))
}

/// A decoded wire packet. Header fields are kept verbatim so that
/// `encode(parse(bytes))` reproduces the input byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: [u8; 3],
    pub packet_type: u8,
    pub peer_id: u8,
    pub sequence: u32,
    pub length: u16,
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a well-formed packet of the given type.
    pub fn new(packet_type: PacketType, peer_id: u8, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            magic: MAGIC,
            packet_type: packet_type as u8,
            peer_id,
            sequence,
            length: payload.len() as u16,
            version: protocol_version(),
            payload,
        }
    }

    pub fn data(peer_id: u8, sequence: u32, payload: Vec<u8>) -> Self {
        Self::new(PacketType::Data, peer_id, sequence, payload)
    }

    pub fn auth(peer_id: u8, sequence: u32, payload: Vec<u8>) -> Self {
        Self::new(PacketType::Auth, peer_id, sequence, payload)
    }

    pub fn ping(peer_id: u8, sequence: u32) -> Self {
        Self::new(PacketType::Ping, peer_id, sequence, Vec::new())
    }

    pub fn pong(peer_id: u8, sequence: u32) -> Self {
        Self::new(PacketType::Pong, peer_id, sequence, Vec::new())
    }

    /// The validated packet type. Call after [`Packet::validate`]; on a raw
    /// parsed packet this surfaces the same `BadType` the validator would.
    pub fn kind(&self) -> Result<PacketType> {
        PacketType::try_from(self.packet_type)
    }

    /// Serialize the header and payload into a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.magic);
        buf.push(self.packet_type);
        buf.push(self.peer_id);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.push(self.version);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Split a datagram into header fields and payload. Only length is
    /// checked here; field validation is a separate pass.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::ShortPacket(data.len()));
        }
        Ok(Self {
            magic: [data[0], data[1], data[2]],
            packet_type: data[3],
            peer_id: data[4],
            sequence: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
            length: u16::from_le_bytes([data[9], data[10]]),
            version: data[11],
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Header validation: magic, major version, type, length, in that
    /// order. First failure wins.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::BadMagic(self.magic));
        }
        let (major, _, _) = version_parts(self.version);
        if major != PROTOCOL_MAJOR {
            return Err(Error::VersionMismatch { got: major, want: PROTOCOL_MAJOR });
        }
        PacketType::try_from(self.packet_type)?;
        if self.length as usize != self.payload.len() {
            return Err(Error::LengthMismatch { header: self.length, actual: self.payload.len() });
        }
        Ok(())
    }

    /// Parse and validate in one step. No downstream component ever sees a
    /// packet that failed either pass.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let packet = Self::parse(data)?;
        packet.validate()?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(packet_type: PacketType, payload: &[u8]) -> Packet {
        Packet::new(packet_type, 7, 42, payload.to_vec())
    }

    #[test]
    fn encode_parse_round_trip() {
        for (ty, payload) in [
            (PacketType::Data, &b"ciphertext"[..]),
            (PacketType::Auth, &[][..]),
            (PacketType::Ping, &[][..]),
            (PacketType::Pong, &[][..]),
        ] {
            let packet = sample(ty, payload);
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn parse_encode_is_identity_on_valid_bytes() {
        let mut bytes = sample(PacketType::Data, b"abc").encode();
        assert_eq!(Packet::parse(&bytes).unwrap().encode(), bytes);

        // Identity holds even for bytes that fail validation.
        bytes[0] = b'X';
        assert_eq!(Packet::parse(&bytes).unwrap().encode(), bytes);
    }

    #[test]
    fn header_layout_is_fixed() {
        let packet = Packet::data(3, 0x01020304, vec![0xaa; 5]);
        let bytes = packet.encode();
        assert_eq!(&bytes[0..3], b"FVP");
        assert_eq!(bytes[3], 1);
        assert_eq!(bytes[4], 3);
        assert_eq!(&bytes[5..9], &[0x04, 0x03, 0x02, 0x01]); // little-endian
        assert_eq!(&bytes[9..11], &[5, 0]);
        assert_eq!(bytes[11], protocol_version());
        assert_eq!(bytes.len(), HEADER_LEN + 5);
    }

    #[test]
    fn short_packet_rejected() {
        assert!(matches!(Packet::parse(&[0u8; 11]), Err(Error::ShortPacket(11))));
        assert!(Packet::parse(&[0u8; 12]).is_ok());
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut packet = sample(PacketType::Data, b"x");
        packet.magic = *b"XVP";
        assert!(matches!(packet.validate(), Err(Error::BadMagic(_))));
    }

    #[test]
    fn validate_rejects_bad_type() {
        for ty in [0u8, 5, 9, 255] {
            let mut packet = sample(PacketType::Data, b"");
            packet.packet_type = ty;
            assert!(matches!(packet.validate(), Err(Error::BadType(t)) if t == ty));
        }
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let mut packet = sample(PacketType::Data, b"abc");
        packet.length = 4;
        assert!(matches!(
            packet.validate(),
            Err(Error::LengthMismatch { header: 4, actual: 3 })
        ));
    }

    #[test]
    fn validate_order_magic_first() {
        // A packet broken in every field reports the magic violation.
        let mut packet = sample(PacketType::Data, b"abc");
        packet.magic = *b"???";
        packet.packet_type = 9;
        packet.length = 99;
        assert!(matches!(packet.validate(), Err(Error::BadMagic(_))));
    }

    #[test]
    fn any_version_byte_decodes_to_major_one() {
        // The encoding has no room for another major; all 256 values pass.
        for byte in 0..=255u8 {
            let mut packet = sample(PacketType::Ping, b"");
            packet.version = byte;
            assert!(packet.validate().is_ok());
            let (major, minor, patch) = version_parts(byte);
            assert_eq!(major, 1);
            assert_eq!(byte, version_byte(minor, patch));
        }
    }

    #[test]
    fn version_byte_packing() {
        assert_eq!(version_byte(0, 0), 0);
        assert_eq!(version_byte(2, 3), 0b0001_0011);
        assert_eq!(version_parts(0b0001_0011), (1, 2, 3));
        assert_eq!(encode_version(1, 31, 7).unwrap(), 0xff);
        assert!(encode_version(2, 0, 0).is_err());
        assert!(encode_version(1, 32, 0).is_err());
        assert!(encode_version(1, 0, 8).is_err());
    }

    #[test]
    fn init_from_crate_version() {
        // The crate version is 1.0.0, which encodes to the default byte,
        // so this is safe alongside concurrently running tests.
        init_protocol_version(env!("CARGO_PKG_VERSION")).unwrap();
        assert_eq!(protocol_version(), version_byte(0, 0));

        // Rejected versions leave the stamped byte unchanged.
        assert!(init_protocol_version("2.0.0").is_err());
        assert!(init_protocol_version("1.0").is_err());
        assert!(init_protocol_version("1.40.0").is_err());
        assert!(init_protocol_version("1.0.9").is_err());
        assert!(init_protocol_version("one.two.three").is_err());
        assert_eq!(protocol_version(), version_byte(0, 0));
    }
}
