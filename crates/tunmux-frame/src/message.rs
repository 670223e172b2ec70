//! Channel envelopes carried inside frames.
//!
//! ```text
//! Request:  id (u32 BE) | type (u8) | dest_len (u16 BE) | dest (UTF-8) | body_len (u32 BE) | body
//! Response: id (u32 BE) | type (u8) | body_len (u32 BE) | body
//! ```
//!
//! A request with `dest_len == 0` carries no destination.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Identifier of one logical channel, unique within a session.
pub type ChannelId = u32;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Open a channel and/or carry data on it.
    Connect = 1,
    /// Tear a channel down.
    Close = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Connect),
            2 => Ok(MessageType::Close),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// A message that can travel as one frame payload.
pub trait Envelope: Sized {
    /// Channel the message belongs to.
    fn channel_id(&self) -> ChannelId;

    /// Message type.
    fn msg_type(&self) -> MessageType;

    /// Append the serialized message to `dst`.
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Parse a complete payload. Trailing bytes are an error.
    fn decode(src: Bytes) -> Result<Self, CodecError>;
}

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub channel_id: ChannelId,
    pub msg_type: MessageType,
    /// `host:port` the server should dial, present on the first message of a channel.
    pub destination: Option<String>,
    pub body: Bytes,
}

impl Request {
    /// First message of a channel: CONNECT with the destination and no body.
    pub fn open(channel_id: ChannelId, destination: impl Into<String>) -> Self {
        Self {
            channel_id,
            msg_type: MessageType::Connect,
            destination: Some(destination.into()),
            body: Bytes::new(),
        }
    }

    /// Data on an already open channel.
    pub fn data(channel_id: ChannelId, body: Bytes) -> Self {
        Self {
            channel_id,
            msg_type: MessageType::Connect,
            destination: None,
            body,
        }
    }

    pub fn close(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            msg_type: MessageType::Close,
            destination: None,
            body: Bytes::new(),
        }
    }
}

impl Envelope for Request {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        // A zero length prefix means "no destination".
        let dest = match self.destination.as_deref() {
            Some("") => return Err(CodecError::EmptyDestination),
            Some(dest) => dest,
            None => "",
        };
        if dest.len() > u16::MAX as usize {
            return Err(CodecError::DestinationTooLong(dest.len()));
        }
        let body_len = body_len(&self.body)?;

        dst.reserve(4 + 1 + 2 + dest.len() + 4 + self.body.len());
        dst.put_u32(self.channel_id);
        dst.put_u8(self.msg_type.into());
        dst.put_u16(dest.len() as u16);
        dst.put_slice(dest.as_bytes());
        dst.put_u32(body_len);
        dst.put_slice(&self.body);
        Ok(())
    }

    fn decode(mut src: Bytes) -> Result<Self, CodecError> {
        need(&src, 4 + 1 + 2, "request header")?;
        let channel_id = src.get_u32();
        let msg_type = MessageType::try_from(src.get_u8())?;

        let dest_len = src.get_u16() as usize;
        need(&src, dest_len, "destination")?;
        let destination = if dest_len == 0 {
            None
        } else {
            let raw = src.split_to(dest_len);
            let dest = std::str::from_utf8(&raw).map_err(|_| CodecError::InvalidDestination)?;
            Some(dest.to_string())
        };

        let body = take_body(&mut src)?;
        Ok(Self {
            channel_id,
            msg_type,
            destination,
            body,
        })
    }
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub channel_id: ChannelId,
    pub msg_type: MessageType,
    pub body: Bytes,
}

impl Response {
    pub fn data(channel_id: ChannelId, body: Bytes) -> Self {
        Self {
            channel_id,
            msg_type: MessageType::Connect,
            body,
        }
    }

    pub fn close(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            msg_type: MessageType::Close,
            body: Bytes::new(),
        }
    }
}

impl Envelope for Response {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body_len = body_len(&self.body)?;
        dst.reserve(4 + 1 + 4 + self.body.len());
        dst.put_u32(self.channel_id);
        dst.put_u8(self.msg_type.into());
        dst.put_u32(body_len);
        dst.put_slice(&self.body);
        Ok(())
    }

    fn decode(mut src: Bytes) -> Result<Self, CodecError> {
        need(&src, 4 + 1, "response header")?;
        let channel_id = src.get_u32();
        let msg_type = MessageType::try_from(src.get_u8())?;
        let body = take_body(&mut src)?;
        Ok(Self {
            channel_id,
            msg_type,
            body,
        })
    }
}

fn need(src: &Bytes, needed: usize, field: &'static str) -> Result<(), CodecError> {
    if src.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            available: src.remaining(),
        });
    }
    Ok(())
}

fn body_len(body: &Bytes) -> Result<u32, CodecError> {
    u32::try_from(body.len()).map_err(|_| CodecError::BodyTooLarge(body.len()))
}

fn take_body(src: &mut Bytes) -> Result<Bytes, CodecError> {
    need(src, 4, "body length")?;
    let len = src.get_u32() as usize;
    need(src, len, "body")?;
    let body = src.split_to(len);
    if src.has_remaining() {
        return Err(CodecError::TrailingBytes(src.remaining()));
    }
    Ok(body)
}
