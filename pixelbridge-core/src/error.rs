//! Error types for protocol parsing and packet assembly.

use thiserror::Error;

/// Errors produced while decoding or assembling PixelPusher wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input ended in the middle of a field or block.
    #[error("truncated input while reading {context}")]
    Truncated { context: &'static str },

    /// A discovery beacon announced a device type this library does not
    /// decode.
    #[error("unsupported device type ({0})")]
    UnsupportedDeviceType(u8),

    /// The command byte did not match any known command.
    #[error("unknown command byte 0x{0:02X}")]
    UnknownCommand(u8),

    /// A command datagram did not begin with the expected magic prefix.
    #[error("command did not begin with magic prefix")]
    BadCommandMagic,

    /// A pixel datagram referenced a strip outside the configured range.
    #[error("strip index {strip} exceeds maximum ({max})")]
    StripOutOfRange { strip: u8, max: usize },

    /// An outbound datagram exceeds the link's maximum datagram size.
    #[error("packet size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// A single strip state cannot fit in a datagram even by itself.
    #[error("strip data size {size} exceeds maximum packet size {max}")]
    StripDataTooLarge { size: usize, max: usize },

    /// A reader or stream was used before a device-specific implementation
    /// was bound to it.
    #[error("not configured for a device")]
    NotConfigured,
}

/// Errors produced while sending datagrams through a [`DatagramSender`].
///
/// [`DatagramSender`]: crate::io::DatagramSender
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
