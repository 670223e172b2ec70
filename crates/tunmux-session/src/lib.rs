//! Channel multiplexing over one framed connection.
//!
//! A [`ClientSession`] accepts local connections and carries each one as a
//! channel over a shared link to a [`MuxServer`], which dials the requested
//! destination and relays bytes back. Channels live in a per-link
//! [`ChannelPool`]; losing the link closes every channel on it.

pub mod channel;
pub mod client;
pub mod error;
pub mod pool;
pub mod server;
pub mod stats;
pub mod transport;

pub use channel::{Channel, ChannelConfig, DEFAULT_QUEUE_CAPACITY, READ_BUFFER_SIZE};
pub use client::ClientSession;
pub use error::{Result, SessionError};
pub use pool::ChannelPool;
pub use server::{MuxServer, ServerOptions, DEFAULT_DIAL_TIMEOUT};
pub use stats::{Stats, StatsSnapshot};
pub use transport::{ClientTransport, MessageTransport, ServerTransport};
