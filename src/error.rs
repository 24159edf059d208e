//! FVP error types

use thiserror::Error;

/// Result type alias for FVP operations
pub type Result<T> = std::result::Result<T, Error>;

/// FVP error types
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("packet too short: {0} bytes")]
    ShortPacket(usize),

    #[error("invalid magic: {0:02x?}")]
    BadMagic([u8; 3]),

    #[error("unsupported protocol version: got major {got}, want {want}")]
    VersionMismatch { got: u8, want: u8 },

    #[error("invalid packet type: {0}")]
    BadType(u8),

    #[error("length mismatch: header says {header}, payload is {actual}")]
    LengthMismatch { header: u16, actual: usize },

    // Replay errors
    #[error("stale sequence {sequence} for peer {peer} (last accepted {last})")]
    ReplayOrReorder { peer: u8, sequence: u32, last: u32 },

    // Identity errors
    #[error("unknown peer: {0}")]
    UnknownPeer(u8),

    #[error("peer table full")]
    Full,

    #[error("key already in use by a live peer")]
    DuplicateKey,

    #[error("sequence space exhausted for peer {0}")]
    SequenceExhausted(u8),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    // Crypto errors
    #[error("decryption failed")]
    Undecryptable,

    #[error("key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid hex key: {0}")]
    InvalidHexKey(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors (startup only)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("configuration file already exists")]
    ConfigExists,

    #[error("duplicate client id in configuration: {0}")]
    DuplicateClientId(u8),

    // Administrative errors
    #[error("client {0} not found")]
    ClientNotFound(u8),
}

impl Error {
    /// Read-deadline expiries on the UDP socket and the TUN device. The
    /// pumps poll on these to observe shutdown; they are never logged.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut
                || e.kind() == std::io::ErrorKind::WouldBlock
        )
    }
}
