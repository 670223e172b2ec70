//! Client side: many local connections multiplexed over one server link.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunmux_frame::{ChannelId, FrameConfig, MessageType, Request};
use tunmux_transport::{Dialer, MuxListener, MuxStream};

use crate::channel::{ChannelConfig, READ_BUFFER_SIZE};
use crate::error::{Result, SessionError};
use crate::pool::ChannelPool;
use crate::stats::Stats;
use crate::transport::ClientTransport;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The shared connection to the server together with its channels.
struct Link {
    transport: ClientTransport,
    pool: ChannelPool,
}

/// Multiplexes local connections onto one lazily established server link.
///
/// The link is created on the first local connection and shared by every
/// later one. When it fails, all of its channels are closed and the next
/// local connection builds a fresh link.
pub struct ClientSession {
    dialer: Dialer,
    server_addr: String,
    frame_config: FrameConfig,
    channel_config: ChannelConfig,
    stats: Arc<Stats>,
    next_id: AtomicU32,
    link: Mutex<Option<Arc<Link>>>,
}

impl ClientSession {
    pub fn new(dialer: Dialer, server_addr: impl Into<String>, stats: Arc<Stats>) -> Self {
        Self {
            dialer,
            server_addr: server_addr.into(),
            frame_config: FrameConfig::default(),
            channel_config: ChannelConfig::default(),
            stats,
            next_id: AtomicU32::new(1),
            link: Mutex::new(None),
        }
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Whether a live link to the server currently exists.
    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| !link.transport.is_closed())
    }

    /// Accept local connections forever, tunnelling each one to `remote`.
    pub async fn serve_listener(self: Arc<Self>, listener: MuxListener, remote: String) {
        let local = listener.local_addr();
        info!(%local, %remote, server = %self.server_addr, "forwarding");
        loop {
            let incoming = match listener.accept().await {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!(%local, error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let session = Arc::clone(&self);
            let remote = remote.clone();
            tokio::spawn(async move {
                let peer = incoming.peer_addr();
                let stream = match incoming.establish().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%peer, error = %err, "local handshake failed");
                        return;
                    }
                };
                if let Err(err) = session.handle_local(stream, remote).await {
                    debug!(%peer, error = %err, "local connection ended with error");
                }
            });
        }
    }

    /// Tunnel one local connection to `remote` until either side ends it.
    pub async fn handle_local(self: Arc<Self>, stream: MuxStream, remote: String) -> Result<()> {
        let link = self.link().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = link.pool.add(id, remote.as_str(), stream)?;
        debug!(channel_id = id, %remote, "channel opened");

        self.send(&link, &Request::open(id, remote)).await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let outcome = loop {
            match channel.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    let request = Request::data(id, Bytes::copy_from_slice(&buf[..n]));
                    self.send(&link, &request).await?;
                }
                Err(SessionError::ChannelClosed(_)) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        // Still registered means the peer has not closed it: tell it.
        if link.pool.del(id) {
            self.send(&link, &Request::close(id)).await?;
        }
        outcome
    }

    /// Send on the shared transport; a failure tears the whole link down.
    async fn send(&self, link: &Arc<Link>, request: &Request) -> Result<()> {
        if let Err(err) = link.transport.send(request).await {
            self.teardown(link, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn link(self: &Arc<Self>) -> Result<Arc<Link>> {
        let mut current = self.link.lock().await;
        if let Some(link) = current.as_ref() {
            if !link.transport.is_closed() {
                return Ok(Arc::clone(link));
            }
        }

        let stream = self.dialer.dial(&self.server_addr).await?;
        info!(server = %self.server_addr, peer = %stream.peer_addr(), "link established");
        let link = Arc::new(Link {
            transport: ClientTransport::new(stream, &self.frame_config),
            pool: ChannelPool::new(self.channel_config.clone(), Arc::clone(&self.stats)),
        });
        *current = Some(Arc::clone(&link));
        drop(current);

        let session = Arc::clone(self);
        let supervised = Arc::clone(&link);
        tokio::spawn(async move {
            if let Err(err) = receive_loop(&supervised).await {
                session.teardown(&supervised, &err).await;
            }
        });
        Ok(link)
    }

    /// Close `link` and forget it if it is still the current one.
    async fn teardown(&self, link: &Arc<Link>, cause: &SessionError) {
        let first = link.transport.close().await;
        let closed = link.pool.close_all();
        if first {
            warn!(server = %self.server_addr, channels = closed, error = %cause, "link lost");
        }

        let mut current = self.link.lock().await;
        if current
            .as_ref()
            .is_some_and(|existing| Arc::ptr_eq(existing, link))
        {
            *current = None;
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("server_addr", &self.server_addr)
            .field("dialer", &self.dialer)
            .finish()
    }
}

/// Deliver responses to their channels until the transport fails.
async fn receive_loop(link: &Link) -> Result<()> {
    loop {
        let response = link.transport.receive().await?;
        let id: ChannelId = response.channel_id;
        match response.msg_type {
            MessageType::Close => {
                if link.pool.del(id) {
                    debug!(channel_id = id, "closed by server");
                }
            }
            MessageType::Connect => {
                let Some(channel) = link.pool.find(id) else {
                    debug!(channel_id = id, "data for unknown channel dropped");
                    continue;
                };
                if response.body.is_empty() {
                    continue;
                }
                // Bounded: a local reader that stops must not hold up the link.
                if let Err(err) = channel.deliver(response.body).await {
                    debug!(channel_id = id, error = %err, "local delivery failed");
                    if link.pool.del(id) {
                        link.transport.send(&Request::close(id)).await?;
                    }
                }
            }
        }
    }
}
