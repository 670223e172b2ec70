use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunmux_frame::{
    Envelope, EnvelopeCodec, FrameConfig, FrameReader, FrameWriter, Request, Response,
};
use tunmux_transport::MuxStream;

use crate::error::{Result, SessionError};

/// Client side: sends requests, receives responses.
pub type ClientTransport = MessageTransport<Request, Response>;

/// Server side: sends responses, receives requests.
pub type ServerTransport = MessageTransport<Response, Request>;

/// Sends and receives envelopes over one physical connection.
///
/// Sends are serialized with each other and receives are serialized with each
/// other, but a send never waits for a receive. Each underlying read or write
/// attempt is bounded by the frame config's timeouts.
pub struct MessageTransport<Out, In> {
    reader: Mutex<FrameReader<ReadHalf<MuxStream>, EnvelopeCodec<In>>>,
    writer: Mutex<FrameWriter<WriteHalf<MuxStream>, EnvelopeCodec<Out>>>,
    exited: AtomicBool,
    cancel: CancellationToken,
    peer: SocketAddr,
}

impl<Out: Envelope, In: Envelope> MessageTransport<Out, In> {
    pub fn new(stream: MuxStream, config: &FrameConfig) -> Self {
        let peer = stream.peer_addr();
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FrameReader::new(
                read_half,
                EnvelopeCodec::new(config.max_payload_size),
                config,
            )),
            writer: Mutex::new(FrameWriter::new(
                write_half,
                EnvelopeCodec::new(config.max_payload_size),
                config,
            )),
            exited: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            peer,
        }
    }

    /// Encode and write one message.
    pub async fn send(&self, message: &Out) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::TransportClosed);
        }
        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::TransportClosed),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::TransportClosed),
            result = writer.write(message) => result.map_err(SessionError::from),
        }
    }

    /// Read until one complete message decodes.
    pub async fn receive(&self) -> Result<In> {
        if self.is_closed() {
            return Err(SessionError::TransportClosed);
        }
        let mut reader = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::TransportClosed),
            reader = self.reader.lock() => reader,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::TransportClosed),
            result = reader.read() => result.map_err(SessionError::from),
        }
    }

    /// Close the connection. Only the first call has an effect; it aborts any
    /// send or receive in flight and returns `true`.
    pub async fn close(&self) -> bool {
        if self.exited.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(peer = %self.peer, error = %err, "shutdown after close failed");
        }
        debug!(peer = %self.peer, "transport closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<Out, In> std::fmt::Debug for MessageTransport<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("peer", &self.peer)
            .field("closed", &self.exited.load(Ordering::Relaxed))
            .finish()
    }
}
