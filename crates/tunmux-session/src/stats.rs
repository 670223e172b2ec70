use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Throughput counters shared by every channel of a process.
///
/// Channels record each transferred chunk and bump the open-channel gauge on
/// creation and close. A reporter samples [`Stats::snapshot`] periodically.
#[derive(Debug, Default)]
pub struct Stats {
    bytes: AtomicU64,
    chunks: AtomicU64,
    open_channels: AtomicI64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub chunks: u64,
    pub open_channels: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one transferred chunk of `len` bytes.
    pub fn record(&self, len: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.open_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        self.open_channels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            open_channels: self.open_channels.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Counter growth since `earlier`; the gauge is taken from `self`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.saturating_sub(earlier.bytes),
            chunks: self.chunks.saturating_sub(earlier.chunks),
            open_channels: self.open_channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_chunks_and_gauge() {
        let stats = Stats::new();
        stats.record(10);
        stats.record(5);
        stats.channel_opened();
        stats.channel_opened();
        stats.channel_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes, 15);
        assert_eq!(snap.chunks, 2);
        assert_eq!(snap.open_channels, 1);
    }

    #[test]
    fn since_subtracts_counters_only() {
        let earlier = StatsSnapshot {
            bytes: 100,
            chunks: 4,
            open_channels: 3,
        };
        let later = StatsSnapshot {
            bytes: 250,
            chunks: 9,
            open_channels: 1,
        };
        assert_eq!(
            later.since(&earlier),
            StatsSnapshot {
                bytes: 150,
                chunks: 5,
                open_channels: 1
            }
        );
    }
}
