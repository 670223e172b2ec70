use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A connected stream, plain TCP or TLS over TCP.
///
/// This is the fundamental I/O type returned by dial and accept operations.
/// It implements `AsyncRead + AsyncWrite`, so framing and channel code never
/// needs to know whether the connection is encrypted.
pub struct MuxStream {
    inner: MuxStreamInner,
    peer: SocketAddr,
}

enum MuxStreamInner {
    Tcp(TcpStream),
    TlsClient(Box<client::TlsStream<TcpStream>>),
    TlsServer(Box<server::TlsStream<TcpStream>>),
}

impl MuxStream {
    pub(crate) fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            inner: MuxStreamInner::Tcp(stream),
            peer,
        }
    }

    pub(crate) fn tls_client(stream: client::TlsStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            inner: MuxStreamInner::TlsClient(Box::new(stream)),
            peer,
        }
    }

    pub(crate) fn tls_server(stream: server::TlsStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            inner: MuxStreamInner::TlsServer(Box::new(stream)),
            peer,
        }
    }

    /// Wrap an already connected TCP stream without TLS.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self::tcp(stream, peer))
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        !matches!(self.inner, MuxStreamInner::Tcp(_))
    }

    /// Disable Nagle on the underlying socket.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match &self.inner {
            MuxStreamInner::Tcp(stream) => stream.set_nodelay(nodelay),
            MuxStreamInner::TlsClient(stream) => stream.get_ref().0.set_nodelay(nodelay),
            MuxStreamInner::TlsServer(stream) => stream.get_ref().0.set_nodelay(nodelay),
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            MuxStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            MuxStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            MuxStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            MuxStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            MuxStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            MuxStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            MuxStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            MuxStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            MuxStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            MuxStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            MuxStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            MuxStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            MuxStreamInner::Tcp(_) => "tcp",
            MuxStreamInner::TlsClient(_) => "tls-client",
            MuxStreamInner::TlsServer(_) => "tls-server",
        };
        f.debug_struct("MuxStream")
            .field("type", &kind)
            .field("peer", &self.peer)
            .finish()
    }
}
