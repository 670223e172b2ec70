use tunmux_frame::{ChannelId, FrameError};
use tunmux_transport::TransportError;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error (bind, connect, handshake).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error on the shared connection.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The message transport was closed locally or by a previous failure.
    #[error("transport closed")]
    TransportClosed,

    /// The channel was already closed.
    #[error("channel {0} closed")]
    ChannelClosed(ChannelId),

    /// The channel's queue stayed full past its enqueue timeout.
    #[error("channel {0} stalled")]
    ChannelStalled(ChannelId),

    /// The pool was torn down together with its connection.
    #[error("channel pool closed")]
    PoolClosed,

    /// A local socket operation failed.
    #[error("channel {channel_id} I/O error: {source}")]
    ChannelIo {
        channel_id: ChannelId,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// True when the error only means "already closed".
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            SessionError::TransportClosed
                | SessionError::ChannelClosed(_)
                | SessionError::PoolClosed
                | SessionError::Frame(FrameError::ConnectionClosed)
        )
    }

    /// True when a deadline expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            SessionError::Frame(err) => err.is_timeout(),
            SessionError::ChannelStalled(_) => true,
            SessionError::ChannelIo { source, .. } => {
                source.kind() == std::io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
