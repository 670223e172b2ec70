use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tunmux_frame::ChannelId;
use tunmux_transport::MuxStream;

use crate::channel::{Channel, ChannelConfig};
use crate::error::{Result, SessionError};
use crate::stats::Stats;

/// Channels of one physical connection, keyed by id.
///
/// The lock only guards the map: channels are closed after they have been
/// removed, never while the lock is held.
pub struct ChannelPool {
    // `None` once `close_all` ran.
    channels: RwLock<Option<HashMap<ChannelId, Arc<Channel>>>>,
    config: ChannelConfig,
    stats: Arc<Stats>,
}

impl ChannelPool {
    pub fn new(config: ChannelConfig, stats: Arc<Stats>) -> Self {
        Self {
            channels: RwLock::new(Some(HashMap::new())),
            config,
            stats,
        }
    }

    pub fn find(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|channels| channels.get(&id).cloned())
    }

    /// Register a channel for `stream`. An existing channel with the same id
    /// is replaced and closed.
    pub fn add(
        &self,
        id: ChannelId,
        remote: impl Into<String>,
        stream: MuxStream,
    ) -> Result<Arc<Channel>> {
        let channel = self.open(id, remote, stream);
        self.insert(Arc::clone(&channel))?;
        Ok(channel)
    }

    /// Build a channel with this pool's settings without registering it.
    pub fn open(
        &self,
        id: ChannelId,
        remote: impl Into<String>,
        stream: MuxStream,
    ) -> Arc<Channel> {
        Channel::new(id, remote, stream, &self.config, Arc::clone(&self.stats))
    }

    /// Register a channel built by [`ChannelPool::open`], replacing and
    /// closing any channel with the same id. A closed pool closes `channel`.
    pub fn insert(&self, channel: Arc<Channel>) -> Result<()> {
        let mut guard = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(channels) = guard.as_mut() else {
            drop(guard);
            channel.close();
            return Err(SessionError::PoolClosed);
        };
        let replaced = channels.insert(channel.id(), channel);
        drop(guard);

        if let Some(old) = replaced {
            old.close();
        }
        Ok(())
    }

    /// Close and remove a channel. Returns `true` if it was registered.
    pub fn del(&self, id: ChannelId) -> bool {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|channels| channels.remove(&id));
        match removed {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close and remove every channel, leaving the pool unusable.
    pub fn close_all(&self) -> usize {
        let channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(channels) = channels else {
            return 0;
        };
        let count = channels.len();
        for channel in channels.into_values() {
            channel.close();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("channels", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
