//! Multiplex many TCP connections through one TLS tunnel.
//!
//! A client accepts local connections and carries each one as a channel over
//! a single framed link to a server, which dials the requested destination.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and TLS streams, dial/listen, TLS contexts
//! - [`frame`]: versioned framing and channel envelopes
//! - [`session`]: channels, pools, client and server sessions
//! - [`config`], [`proxy`], [`report`]: pieces the `tunmux` binary is built from

pub mod config;
pub mod proxy;
pub mod report;

/// Re-export transport types.
pub mod transport {
    pub use tunmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tunmux_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use tunmux_session::*;
}
