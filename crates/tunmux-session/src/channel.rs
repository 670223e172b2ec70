use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunmux_frame::ChannelId;
use tunmux_transport::MuxStream;

use crate::error::{Result, SessionError};
use crate::stats::Stats;

/// Default number of chunks buffered between a channel and its socket.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Size of the buffer used when reading from a channel's socket.
pub const READ_BUFFER_SIZE: usize = 4 * 1024;

/// Default deadline for each write to a channel's socket.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on queueing link data into a full channel.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Chunks that may wait for the socket before `write` blocks.
    pub queue_capacity: usize,
    /// Deadline for each socket write; expiry closes the channel.
    pub write_timeout: Option<Duration>,
    /// How long [`Channel::deliver`] waits for queue space. Must stay below
    /// the link's frame timeout so one stalled channel cannot stall the link.
    pub enqueue_timeout: Duration,
}

impl ChannelConfig {
    /// Settings for a link whose frame I/O times out after `timeout`.
    pub fn for_link_timeout(timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            enqueue_timeout: timeout / 4,
            ..Self::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// One logical stream bound to a local or destination socket.
///
/// Writes are queued and drained by a background task, so a slow socket
/// blocks the writer once the queue is full. Closing stops new writes,
/// aborts pending reads, and lets the drain task flush what is already
/// queued before it shuts the socket down.
pub struct Channel {
    id: ChannelId,
    remote: String,
    // `None` once closed.
    queue: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: tokio::sync::Mutex<ReadHalf<MuxStream>>,
    cancel: CancellationToken,
    enqueue_timeout: Duration,
    stats: Arc<Stats>,
}

impl Channel {
    /// Wrap `stream` and start its drain task. Must be called within a runtime.
    pub fn new(
        id: ChannelId,
        remote: impl Into<String>,
        stream: MuxStream,
        config: &ChannelConfig,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let write_timeout = config.write_timeout;

        stats.channel_opened();
        Arc::new_cyclic(|weak| {
            tokio::spawn(drain(weak.clone(), write_half, rx, write_timeout));
            Self {
                id,
                remote: remote.into(),
                queue: Mutex::new(Some(tx)),
                reader: tokio::sync::Mutex::new(read_half),
                cancel: CancellationToken::new(),
                enqueue_timeout: config.enqueue_timeout,
                stats,
            }
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Address this channel is bound to: the destination on the server, the
    /// requested remote on the client.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Read from the socket. `Ok(0)` means the socket reached EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(SessionError::ChannelClosed(self.id));
        }
        let mut reader = self.reader.lock().await;
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::ChannelClosed(self.id)),
            read = reader.read(buf) => read,
        };
        let n = read.map_err(|source| SessionError::ChannelIo {
            channel_id: self.id,
            source,
        })?;
        if n > 0 {
            self.stats.record(n);
        }
        Ok(n)
    }

    /// Queue `data` for the socket, waiting while the queue is full.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::ChannelClosed(self.id))?;
        let len = data.len();
        tx.send(data)
            .await
            .map_err(|_| SessionError::ChannelClosed(self.id))?;
        self.stats.record(len);
        Ok(())
    }

    /// Queue `data` received from the link. Unlike [`Channel::write`] this
    /// gives up with [`SessionError::ChannelStalled`] once the queue has been
    /// full for the configured enqueue timeout.
    pub async fn deliver(&self, data: Bytes) -> Result<()> {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::ChannelClosed(self.id))?;
        let len = data.len();
        tx.send_timeout(data, self.enqueue_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => SessionError::ChannelStalled(self.id),
                SendTimeoutError::Closed(_) => SessionError::ChannelClosed(self.id),
            })?;
        self.stats.record(len);
        Ok(())
    }

    /// Close the channel. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return false;
        }
        drop(sender);
        self.cancel.cancel();
        self.stats.channel_closed();
        debug!(channel_id = self.id, remote = %self.remote, "channel closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn drain(
    channel: Weak<Channel>,
    mut socket: WriteHalf<MuxStream>,
    mut rx: mpsc::Receiver<Bytes>,
    write_timeout: Option<Duration>,
) {
    while let Some(chunk) = rx.recv().await {
        let written = match write_timeout {
            Some(limit) => match tokio::time::timeout(limit, socket.write_all(&chunk)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            },
            None => socket.write_all(&chunk).await,
        };
        if let Err(err) = written {
            if let Some(channel) = channel.upgrade() {
                debug!(channel_id = channel.id, error = %err, "channel write failed");
                channel.close();
            }
            return;
        }
    }

    // Sender dropped: the channel was closed and everything queued is written.
    if let Err(err) = socket.shutdown().await {
        trace!(error = %err, "channel shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testing::stream_pair;

    #[tokio::test]
    async fn read_and_write_reach_the_socket() {
        let (stream, mut peer) = stream_pair().await;
        let stats = Arc::new(Stats::new());
        let channel = Channel::new(1, "test", stream, &ChannelConfig::default(), stats.clone());

        channel.write(Bytes::from_static(b"to peer")).await.unwrap();
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to peer");

        peer.write_all(b"from peer").await.unwrap();
        let mut buf = [0u8; 64];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &b"from peer"[..n]);
        assert!(n > 0);

        let snap = stats.snapshot();
        assert_eq!(snap.open_channels, 1);
        assert!(snap.chunks >= 2);
    }

    #[tokio::test]
    async fn concurrent_close_has_one_winner() {
        let (stream, _peer) = stream_pair().await;
        let stats = Arc::new(Stats::new());
        let channel = Channel::new(7, "test", stream, &ChannelConfig::default(), stats.clone());

        let a = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.close() })
        };
        let b = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.close() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one close call should win");
        assert!(!channel.close());
        assert_eq!(stats.snapshot().open_channels, 0);
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let (stream, _peer) = stream_pair().await;
        let channel = Channel::new(
            2,
            "test",
            stream,
            &ChannelConfig::default(),
            Arc::new(Stats::new()),
        );
        assert!(channel.close());
        assert!(channel.is_closed());

        let mut buf = [0u8; 8];
        assert!(matches!(
            channel.read(&mut buf).await.unwrap_err(),
            SessionError::ChannelClosed(2)
        ));
        assert!(matches!(
            channel.write(Bytes::from_static(b"x")).await.unwrap_err(),
            SessionError::ChannelClosed(2)
        ));
    }

    #[tokio::test]
    async fn close_flushes_queue_then_ends_stream() {
        let (stream, mut peer) = stream_pair().await;
        let channel = Channel::new(
            3,
            "test",
            stream,
            &ChannelConfig::default(),
            Arc::new(Stats::new()),
        );

        channel.write(Bytes::from_static(b"last ")).await.unwrap();
        channel.write(Bytes::from_static(b"words")).await.unwrap();
        channel.close();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn close_aborts_blocked_read() {
        let (stream, _peer) = stream_pair().await;
        let channel = Channel::new(
            4,
            "test",
            stream,
            &ChannelConfig::default(),
            Arc::new(Stats::new()),
        );

        let reader = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                channel.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read should be aborted")
            .unwrap();
        assert!(matches!(result, Err(SessionError::ChannelClosed(4))));
    }

    #[tokio::test]
    async fn full_queue_blocks_writer() {
        let (stream, mut peer) = stream_pair().await;
        let config = ChannelConfig {
            queue_capacity: 1,
            write_timeout: None,
            ..ChannelConfig::default()
        };
        let channel = Channel::new(5, "test", stream, &config, Arc::new(Stats::new()));
        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);

        // With nobody reading, the socket and then the queue fill up.
        let mut blocked = false;
        for _ in 0..256 {
            let write = channel.write(chunk.clone());
            if tokio::time::timeout(Duration::from_millis(200), write)
                .await
                .is_err()
            {
                blocked = true;
                break;
            }
        }
        assert!(blocked, "write should block once the queue is full");

        // Draining the peer releases the backpressure.
        let drained = tokio::spawn(async move {
            let mut sink = vec![0u8; 64 * 1024];
            let mut total = 0usize;
            while let Ok(n) = peer.read(&mut sink).await {
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        });
        tokio::time::timeout(Duration::from_secs(10), channel.write(chunk))
            .await
            .expect("write should resume once the peer reads")
            .unwrap();
        channel.close();
        assert!(drained.await.unwrap() > 0);
    }

    #[tokio::test]
    async fn deliver_gives_up_on_a_stalled_socket() {
        let (stream, _peer) = stream_pair().await;
        let config = ChannelConfig {
            queue_capacity: 1,
            write_timeout: None,
            enqueue_timeout: Duration::from_millis(100),
        };
        let channel = Channel::new(6, "test", stream, &config, Arc::new(Stats::new()));
        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);

        // Nobody reads the peer, so the socket and then the queue fill up.
        let mut outcome = Ok(());
        for _ in 0..256 {
            let delivered =
                tokio::time::timeout(Duration::from_secs(2), channel.deliver(chunk.clone()))
                    .await
                    .expect("deliver should never wait past its bound");
            if delivered.is_err() {
                outcome = delivered;
                break;
            }
        }
        assert!(matches!(outcome, Err(SessionError::ChannelStalled(6))));
        assert!(!channel.is_closed(), "the caller decides whether to close");
    }

    #[test]
    fn link_timeout_bounds_enqueue_wait() {
        let config = ChannelConfig::for_link_timeout(Duration::from_secs(8));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(8)));
        assert_eq!(config.enqueue_timeout, Duration::from_secs(2));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(ChannelConfig::default().enqueue_timeout < DEFAULT_WRITE_TIMEOUT);
    }
}
