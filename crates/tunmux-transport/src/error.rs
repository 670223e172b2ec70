use std::path::PathBuf;

/// Errors that can occur in stream transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// TLS handshake with a peer failed.
    #[error("tls handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        source: std::io::Error,
    },

    /// A TLS certificate, key, or CA file could not be read.
    #[error("failed to read tls material {}: {source}", .path.display())]
    TlsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TLS material was readable but unusable.
    #[error("invalid tls configuration: {0}")]
    Tls(String),

    /// The name used to verify the server certificate is not a valid DNS name or IP.
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),

    /// An I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors caused by configuration rather than the network.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TransportError::TlsFile { .. }
                | TransportError::Tls(_)
                | TransportError::InvalidServerName(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
