use std::time::Duration;

/// Errors that can occur during frame encoding/decoding and frame I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with the protocol magic.
    #[error("invalid frame magic {found:02x?} (expected 98 b7 f3)")]
    InvalidMagic { found: [u8; 3] },

    /// The magic matched but carries a protocol version this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The payload is not a valid envelope.
    #[error("envelope codec error: {0}")]
    Codec(#[from] CodecError),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// A single read or write attempt did not complete before its deadline.
    #[error("frame I/O timed out after {0:?}")]
    TimedOut(Duration),
}

impl FrameError {
    /// True for header-level corruption after which the stream cannot be resynchronized.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic { .. }
                | FrameError::UnsupportedVersion(_)
                | FrameError::PayloadTooLarge { .. }
        )
    }

    /// True when a deadline expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            FrameError::TimedOut(_) => true,
            FrameError::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Errors that can occur while serializing or deserializing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before a field was complete.
    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// The message type byte is not CONNECT or CLOSE.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// The destination address is not UTF-8.
    #[error("destination address is not valid UTF-8")]
    InvalidDestination,

    /// Declared field lengths did not consume the whole payload.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    /// A destination was given but is empty.
    #[error("destination address is empty")]
    EmptyDestination,

    /// The destination address does not fit its 16-bit length prefix.
    #[error("destination address too long ({0} bytes, max 65535)")]
    DestinationTooLong(usize),

    /// The body does not fit its 32-bit length prefix.
    #[error("body too large ({0} bytes)")]
    BodyTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, FrameError>;
