//! Versioned length-prefixed framing with channel envelopes.
//!
//! This is the wire layer of tunmux. Every message is framed with:
//! - A 3-byte magic prefix plus a 1-byte protocol version
//! - A 4-byte big-endian payload length
//! - The payload: a serialized [`Request`] or [`Response`] envelope
//!
//! Readers reassemble frames across arbitrary partial reads; readers and
//! writers both bound every I/O attempt with a deadline.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, EnvelopeCodec, FrameConfig, DEFAULT_IO_TIMEOUT,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC, PROTOCOL_VERSION,
};
pub use error::{CodecError, FrameError, Result};
pub use message::{ChannelId, Envelope, MessageType, Request, Response};
pub use reader::FrameReader;
pub use writer::FrameWriter;
