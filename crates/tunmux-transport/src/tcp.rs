use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::MuxStream;
use crate::tls::ClientTls;

/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens outbound connections, optionally wrapping them in TLS.
#[derive(Clone)]
pub struct Dialer {
    tls: Option<ClientTls>,
    connect_timeout: Duration,
}

impl Dialer {
    /// Plain TCP dialer.
    pub fn plain() -> Self {
        Self {
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Dialer that performs a TLS client handshake after connecting.
    pub fn with_tls(tls: ClientTls) -> Self {
        Self {
            tls: Some(tls),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect (and handshake) timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect timeout currently in effect.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect to `addr` (a `host:port` string).
    pub async fn dial(&self, addr: &str) -> Result<MuxStream> {
        match tokio::time::timeout(self.connect_timeout, self.dial_inner(addr)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ),
            }),
        }
    }

    async fn dial_inner(&self, addr: &str) -> Result<MuxStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        let peer = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        let Some(tls) = &self.tls else {
            debug!(%addr, %peer, "connected");
            return Ok(MuxStream::tcp(stream, peer));
        };

        let stream = tls
            .connector
            .connect(tls.server_name.clone(), stream)
            .await
            .map_err(|e| TransportError::Handshake {
                peer: peer.to_string(),
                source: e,
            })?;
        debug!(%addr, %peer, "connected with tls");
        Ok(MuxStream::tls_client(stream, peer))
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Listens for inbound TCP connections, optionally terminating TLS.
pub struct MuxListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl MuxListener {
    /// Bind a listener on `addr`.
    pub async fn bind(addr: &str, acceptor: Option<TlsAcceptor>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, tls = acceptor.is_some(), "listening");

        Ok(Self {
            listener,
            acceptor,
            local_addr,
        })
    }

    /// Accept the next TCP connection.
    ///
    /// The TLS handshake (if any) is deferred to [`Incoming::establish`] so a
    /// slow client never stalls the accept loop.
    pub async fn accept(&self) -> Result<Incoming> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok(Incoming {
            stream,
            peer,
            acceptor: self.acceptor.clone(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        if self.acceptor.is_some() {
            "tcp+tls"
        } else {
            "tcp"
        }
    }
}

/// An accepted TCP connection that has not finished its TLS handshake yet.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl Incoming {
    /// Remote address of the accepted connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Complete the TLS handshake (if configured) and return the stream.
    pub async fn establish(self) -> Result<MuxStream> {
        let _ = self.stream.set_nodelay(true);
        match self.acceptor {
            None => Ok(MuxStream::tcp(self.stream, self.peer)),
            Some(acceptor) => {
                let stream =
                    acceptor
                        .accept(self.stream)
                        .await
                        .map_err(|e| TransportError::Handshake {
                            peer: self.peer.to_string(),
                            source: e,
                        })?;
                debug!(peer = %self.peer, "tls handshake complete");
                Ok(MuxStream::tls_server(stream, self.peer))
            }
        }
    }
}
