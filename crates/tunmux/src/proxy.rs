//! Plain TCP passthrough with round-robin failover across remotes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use tunmux_session::Stats;
use tunmux_transport::{Dialer, MuxListener, MuxStream};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One upstream address and the dialer used to reach it.
#[derive(Debug, Clone)]
pub struct Remote {
    pub addr: String,
    pub dialer: Dialer,
}

/// Forwards every accepted connection to the first reachable remote.
///
/// Dialing starts at the remote that last worked; a failed dial moves the
/// cursor to the next one, wrapping around.
pub struct PassthroughProxy {
    listener: MuxListener,
    remotes: Vec<Remote>,
    cursor: AtomicUsize,
    stats: Arc<Stats>,
}

impl PassthroughProxy {
    pub fn new(listener: MuxListener, remotes: Vec<Remote>, stats: Arc<Stats>) -> Self {
        Self {
            listener,
            remotes,
            cursor: AtomicUsize::new(0),
            stats,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Index of the remote the next connection tries first.
    pub fn current_remote(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>) {
        info!(local = %self.local_addr(), remotes = self.remotes.len(), "proxy ready");
        loop {
            let incoming = match self.listener.accept().await {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let peer = incoming.peer_addr();
                let local = match incoming.establish().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%peer, error = %err, "local handshake failed");
                        return;
                    }
                };
                let Some(remote) = proxy.dial_remote().await else {
                    warn!(%peer, "no remote reachable");
                    return;
                };
                proxy.pipe(local, remote).await;
            });
        }
    }

    async fn dial_remote(&self) -> Option<MuxStream> {
        if self.remotes.is_empty() {
            return None;
        }
        for _ in 0..self.remotes.len() {
            let index = self.cursor.load(Ordering::Relaxed) % self.remotes.len();
            let remote = &self.remotes[index];
            match remote.dialer.dial(&remote.addr).await {
                Ok(stream) => return Some(stream),
                Err(err) => {
                    let next = (index + 1) % self.remotes.len();
                    warn!(
                        remote = %remote.addr,
                        next = %self.remotes[next].addr,
                        error = %err,
                        "dial failed, switching remote"
                    );
                    let _ = self.cursor.compare_exchange(
                        index,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
            }
        }
        None
    }

    async fn pipe(&self, mut local: MuxStream, mut remote: MuxStream) {
        let route = format!("{}->{}", local.peer_addr(), remote.peer_addr());
        debug!(%route, "proxy connection opened");
        self.stats.channel_opened();

        match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
            Ok((up, down)) => {
                self.stats.record(up as usize);
                self.stats.record(down as usize);
                debug!(%route, up, down, "proxy connection closed");
            }
            Err(err) => debug!(%route, error = %err, "proxy connection failed"),
        }
        self.stats.channel_closed();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    fn remote(addr: String) -> Remote {
        Remote {
            addr,
            dialer: Dialer::plain().with_connect_timeout(Duration::from_secs(2)),
        }
    }

    #[tokio::test]
    async fn fails_over_to_next_remote_and_sticks() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr");
        let live = echo().await;

        let listener = MuxListener::bind("127.0.0.1:0", None).await.expect("bind proxy");
        let proxy = Arc::new(PassthroughProxy::new(
            listener,
            vec![remote(dead.to_string()), remote(live.to_string())],
            Arc::new(Stats::new()),
        ));
        let local = proxy.local_addr();
        tokio::spawn(Arc::clone(&proxy).run());

        for message in [&b"first"[..], &b"second"[..]] {
            let mut conn = TcpStream::connect(local).await.expect("connect proxy");
            conn.write_all(message).await.expect("write");
            let mut buf = vec![0u8; message.len()];
            tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
                .await
                .expect("echo should arrive")
                .expect("read");
            assert_eq!(buf, message);
        }
        assert_eq!(proxy.current_remote(), 1);
    }

    #[tokio::test]
    async fn closes_local_when_no_remote_is_reachable() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr");
        let listener = MuxListener::bind("127.0.0.1:0", None).await.expect("bind proxy");
        let proxy = Arc::new(PassthroughProxy::new(
            listener,
            vec![remote(dead.to_string())],
            Arc::new(Stats::new()),
        ));
        let local = proxy.local_addr();
        tokio::spawn(proxy.run());

        let mut conn = TcpStream::connect(local).await.expect("connect proxy");
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut buf))
            .await
            .expect("local connection should be closed")
            .expect("read");
        assert!(buf.is_empty());
    }
}
