//! TCP and TLS stream layer for tunmux.
//!
//! Provides a unified stream type over the physical connections tunmux uses:
//! - plain TCP (local accepted sockets, dialed destinations, plaintext relays)
//! - TLS client and server streams (the control connection when a TLS
//!   profile is configured)
//!
//! This is the lowest layer of tunmux. Framing and multiplexing build on the
//! [`MuxStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use error::{Result, TransportError};
pub use stream::MuxStream;
pub use tcp::{Dialer, Incoming, MuxListener};
pub use tls::{client_context, server_context, ClientTls, TlsFiles};
pub use tokio_rustls::TlsAcceptor;
