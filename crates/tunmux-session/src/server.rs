//! Server side: demultiplex channels from each client link onto destinations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunmux_frame::{ChannelId, FrameConfig, MessageType, Request, Response};
use tunmux_transport::{Dialer, MuxListener, MuxStream};

use crate::channel::{Channel, ChannelConfig, READ_BUFFER_SIZE};
use crate::error::Result;
use crate::pool::ChannelPool;
use crate::stats::Stats;
use crate::transport::ServerTransport;

/// Default bound on dialing a destination.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Settings shared by every connection a server handles.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub frame: FrameConfig,
    pub channel: ChannelConfig,
    pub dial_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            channel: ChannelConfig::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

struct Shared {
    frame: FrameConfig,
    channel: ChannelConfig,
    dialer: Dialer,
    stats: Arc<Stats>,
}

/// Accepts client links and relays their channels.
pub struct MuxServer {
    listener: MuxListener,
    shared: Arc<Shared>,
}

impl MuxServer {
    pub fn new(listener: MuxListener, options: ServerOptions, stats: Arc<Stats>) -> Self {
        Self {
            listener,
            shared: Arc::new(Shared {
                frame: options.frame,
                channel: options.channel,
                dialer: Dialer::plain().with_connect_timeout(options.dial_timeout),
                stats,
            }),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Accept links forever; each one is served on its own task.
    pub async fn run(self) {
        info!(
            local = %self.listener.local_addr(),
            transport = self.listener.transport_name(),
            "server ready"
        );
        loop {
            let incoming = match self.listener.accept().await {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let peer = incoming.peer_addr();
                match incoming.establish().await {
                    Ok(stream) => serve_link(stream, shared).await,
                    Err(err) => warn!(%peer, error = %err, "link handshake failed"),
                }
            });
        }
    }
}

/// A channel whose destination is still being dialed.
struct Pending {
    chunks: Vec<Bytes>,
    // The client already sent CLOSE; flush `chunks` and end the channel.
    closing: bool,
    cancel: CancellationToken,
}

/// Outcome of offering a request to the in-flight dials.
enum Parked {
    /// Kept until the dial finishes.
    Held,
    /// A CLOSE arrived with nothing parked, so the dial was abandoned.
    Cancelled,
    /// More chunks arrived than a channel queue holds.
    Overflow,
    /// No dial is in flight for this id.
    NotPending(Request),
}

/// One client connection with its channels and in-flight dials.
struct Link {
    transport: ServerTransport,
    pool: ChannelPool,
    // Locked before the pool, never the other way round.
    pending: Mutex<HashMap<ChannelId, Pending>>,
    shared: Arc<Shared>,
}

impl Link {
    fn pending(&self) -> MutexGuard<'_, HashMap<ChannelId, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, request: Request) -> Parked {
        let id = request.channel_id;
        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(&id) else {
            return Parked::NotPending(request);
        };
        let overflow = match request.msg_type {
            MessageType::Close if !entry.chunks.is_empty() => {
                entry.closing = true;
                return Parked::Held;
            }
            MessageType::Close => false,
            MessageType::Connect => {
                if !request.body.is_empty() {
                    entry.chunks.push(request.body);
                }
                if entry.chunks.len() <= self.shared.channel.queue_capacity {
                    return Parked::Held;
                }
                true
            }
        };
        if let Some(entry) = pending.remove(&id) {
            entry.cancel.cancel();
        }
        if overflow {
            Parked::Overflow
        } else {
            Parked::Cancelled
        }
    }

    fn begin_dial(&self, id: ChannelId, body: Bytes) -> CancellationToken {
        let cancel = CancellationToken::new();
        let chunks = if body.is_empty() { Vec::new() } else { vec![body] };
        self.pending().insert(
            id,
            Pending {
                chunks,
                closing: false,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Hand the parked chunks to `channel`, then publish it in the pool.
    /// Returns `false` when the client closed the channel meanwhile; the
    /// caller then closes it, which still flushes what was handed over.
    async fn promote(&self, channel: &Arc<Channel>) -> Result<bool> {
        let id = channel.id();
        loop {
            let chunks = {
                let mut pending = self.pending();
                let Some(entry) = pending.get_mut(&id) else {
                    return Ok(false);
                };
                if entry.chunks.is_empty() {
                    let closing = entry.closing;
                    pending.remove(&id);
                    if closing {
                        return Ok(false);
                    }
                    self.pool.insert(Arc::clone(channel))?;
                    return Ok(true);
                }
                std::mem::take(&mut entry.chunks)
            };
            for chunk in chunks {
                channel.deliver(chunk).await?;
            }
        }
    }

    /// Drop the dial for `id` and tell the client, unless it already sent
    /// CLOSE itself.
    async fn refuse(&self, id: ChannelId) {
        let removed = self.pending().remove(&id);
        if removed.is_some_and(|dial| !dial.closing) {
            self.reply_close(id).await;
        }
    }

    fn cancel_dials(&self) -> usize {
        let dials: Vec<Pending> = self.pending().drain().map(|(_, dial)| dial).collect();
        for dial in &dials {
            dial.cancel.cancel();
        }
        dials.len()
    }

    /// Tell the client `id` is gone. A failed send takes the link down.
    async fn reply_close(&self, id: ChannelId) {
        if let Err(err) = self.transport.send(&Response::close(id)).await {
            warn!(channel_id = id, error = %err, "send to client failed");
            self.transport.close().await;
        }
    }
}

async fn serve_link(stream: MuxStream, shared: Arc<Shared>) {
    let peer = stream.peer_addr();
    info!(%peer, "link accepted");

    let link = Arc::new(Link {
        transport: ServerTransport::new(stream, &shared.frame),
        pool: ChannelPool::new(shared.channel.clone(), Arc::clone(&shared.stats)),
        pending: Mutex::new(HashMap::new()),
        shared,
    });

    let result = receive_requests(&link).await;
    let closed = link.pool.close_all();
    let dials = link.cancel_dials();
    link.transport.close().await;
    match result {
        Err(err) if err.is_closed() => info!(%peer, channels = closed, dials, "link closed"),
        Err(err) => warn!(%peer, channels = closed, dials, error = %err, "link failed"),
        Ok(()) => {}
    }
}

/// Route requests to channels. Dials run on their own tasks so a slow
/// destination never holds up the other channels of the link.
async fn receive_requests(link: &Arc<Link>) -> Result<()> {
    loop {
        let request = link.transport.receive().await?;
        let id = request.channel_id;

        let request = match link.park(request) {
            Parked::NotPending(request) => request,
            Parked::Held => continue,
            Parked::Cancelled => {
                debug!(channel_id = id, "closed by client while dialing");
                continue;
            }
            Parked::Overflow => {
                warn!(channel_id = id, "too much data while dialing");
                link.transport.send(&Response::close(id)).await?;
                continue;
            }
        };

        let Some(channel) = link.pool.find(id) else {
            match (request.msg_type, request.destination) {
                (MessageType::Connect, Some(destination)) => {
                    let cancel = link.begin_dial(id, request.body);
                    tokio::spawn(dial(Arc::clone(link), id, destination, cancel));
                }
                // Late data for a channel that already ended.
                (MessageType::Connect, None) => {
                    debug!(channel_id = id, "data for unknown channel")
                }
                (MessageType::Close, _) => debug!(channel_id = id, "close for unknown channel"),
            }
            continue;
        };

        match request.msg_type {
            MessageType::Close => {
                link.pool.del(id);
                debug!(channel_id = id, "closed by client");
            }
            MessageType::Connect => {
                if request.body.is_empty() {
                    continue;
                }
                if let Err(err) = channel.deliver(request.body).await {
                    debug!(channel_id = id, error = %err, "destination delivery failed");
                    if link.pool.del(id) {
                        link.transport.send(&Response::close(id)).await?;
                    }
                }
            }
        }
    }
}

/// Dial `destination` for channel `id`, then relay it until either side ends.
async fn dial(link: Arc<Link>, id: ChannelId, destination: String, cancel: CancellationToken) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(channel_id = id, remote = %destination, "dial abandoned");
            return;
        }
        dialed = link.shared.dialer.dial(&destination) => dialed,
    };
    let stream = match dialed {
        Ok(stream) => stream,
        Err(err) => {
            warn!(channel_id = id, remote = %destination, error = %err, "dial failed");
            link.refuse(id).await;
            return;
        }
    };

    let channel = link.pool.open(id, destination.as_str(), stream);
    match link.promote(&channel).await {
        Ok(true) => {
            debug!(channel_id = id, remote = %destination, "channel opened");
            relay(link, channel).await;
        }
        Ok(false) => {
            channel.close();
            debug!(channel_id = id, remote = %destination, "closed by client while dialing");
        }
        Err(err) => {
            debug!(channel_id = id, error = %err, "destination delivery failed");
            channel.close();
            link.refuse(id).await;
        }
    }
}

/// Copy destination output back to the client until the destination ends.
async fn relay(link: Arc<Link>, channel: Arc<Channel>) {
    let id = channel.id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match channel.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let response = Response::data(id, Bytes::copy_from_slice(&buf[..n]));
                if let Err(err) = link.transport.send(&response).await {
                    warn!(channel_id = id, error = %err, "send to client failed");
                    link.transport.close().await;
                    return;
                }
            }
            Err(err) => {
                if !err.is_closed() {
                    debug!(channel_id = id, error = %err, "destination read failed");
                }
                break;
            }
        }
    }

    if link.pool.del(id) {
        link.reply_close(id).await;
    }
}
