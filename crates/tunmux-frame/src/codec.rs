use std::marker::PhantomData;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::message::Envelope;

/// Frame header: magic (3) + version (1) + length (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic prefix shared by every protocol version.
pub const MAGIC: [u8; 3] = [0x98, 0xB7, 0xF3];

/// Protocol version carried in the fourth header byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default deadline applied to each frame read or write attempt.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬─────────┬─────────────┬────────────────┐
/// │ Magic (3B)       │ Version │ Length      │ Payload        │
/// │ 0x98 0xB7 0xF3   │ (1B)    │ (4B BE)     │ (Length bytes) │
/// └──────────────────┴─────────┴─────────────┴────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    put_header(dst, payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame payload from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..3] != MAGIC {
        return Err(FrameError::InvalidMagic {
            found: [src[0], src[1], src[2]],
        });
    }
    if src[3] != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(src[3]));
    }

    let payload_len = (&src[4..8]).get_u32() as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

fn put_header(dst: &mut BytesMut, len: u32) {
    dst.put_slice(&MAGIC);
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_u32(len);
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Deadline for each read attempt. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Deadline for each write attempt. `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
}

impl FrameConfig {
    /// Same deadline for reads and writes.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            read_timeout: Some(timeout),
            write_timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Largest number of bytes a reader may buffer: one full frame.
    pub fn buffer_capacity(&self) -> usize {
        HEADER_SIZE + self.max_payload_size
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: Some(DEFAULT_IO_TIMEOUT),
            write_timeout: Some(DEFAULT_IO_TIMEOUT),
        }
    }
}

/// `tokio_util` codec that frames one envelope type.
///
/// `M` is the message this side decodes; encoding accepts `&M` so the
/// same type can drive both directions in tests and `Framed` adapters.
#[derive(Debug)]
pub struct EnvelopeCodec<M> {
    max_payload_size: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> EnvelopeCodec<M> {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            _message: PhantomData,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl<M> Default for EnvelopeCodec<M> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl<M> Clone for EnvelopeCodec<M> {
    fn clone(&self) -> Self {
        Self::new(self.max_payload_size)
    }
}

impl<M: Envelope> Decoder for EnvelopeCodec<M> {
    type Item = M;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>> {
        match decode_frame(src, self.max_payload_size)? {
            Some(payload) => Ok(Some(M::decode(payload)?)),
            None => Ok(None),
        }
    }
}

impl<'a, M: Envelope> Encoder<&'a M> for EnvelopeCodec<M> {
    type Error = FrameError;

    fn encode(&mut self, item: &'a M, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        put_header(dst, 0);
        if let Err(err) = item.encode(dst) {
            dst.truncate(start);
            return Err(err.into());
        }

        let size = dst.len() - start - HEADER_SIZE;
        if size > self.max_payload_size {
            dst.truncate(start);
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        dst[start + 4..start + HEADER_SIZE].copy_from_slice(&(size as u32).to_be_bytes());
        Ok(())
    }
}
