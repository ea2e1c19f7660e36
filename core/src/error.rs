//! Error kinds surfaced by the packet engine

use thiserror::Error;

/// Errors that can occur anywhere in the packet engine
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("transport not connected")]
    NotConnected,

    #[error("operation timed out")]
    TimedOut,

    #[error("encryption failed: no key material")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("packet buffer pool exhausted")]
    OutOfBuffers,

    #[error("payload larger than interface packet size")]
    InsufficientPacketSize,

    #[error("buffer tailroom exhausted")]
    OutOfMemory,

    #[error("operation not supported by this transport")]
    NotSupported,

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("connection failed: {0}")]
    ConnectionFailed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PacketError {
    /// Stable one-byte code carried in CONN_TERMINATED payloads.
    pub fn wire_code(&self) -> u8 {
        match self {
            PacketError::NotConnected => 0x01,
            PacketError::TimedOut => 0x02,
            PacketError::EncryptFailed => 0x03,
            PacketError::DecryptFailed => 0x04,
            PacketError::OutOfBuffers => 0x05,
            PacketError::InsufficientPacketSize => 0x06,
            PacketError::OutOfMemory => 0x07,
            PacketError::NotSupported => 0x08,
            PacketError::InvalidFrame(_) => 0x09,
            PacketError::ConnectionFailed(_) => 0x0A,
            PacketError::Io(_) => 0x0B,
        }
    }
}
