//! Periodic throughput report.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tunmux_session::{Stats, StatsSnapshot};

/// Log per-second averages of `stats` every `interval`, forever.
pub async fn run(stats: Arc<Stats>, interval: Duration, mode: &'static str) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut previous = stats.snapshot();
    loop {
        ticker.tick().await;
        let current = stats.snapshot();
        let rate = per_second(&current.since(&previous), interval);
        info!(
            mode,
            channels = current.open_channels,
            chunks = %format_rate(rate.chunks),
            bytes = %format_rate(rate.bytes),
            "throughput"
        );
        previous = current;
    }
}

fn per_second(delta: &StatsSnapshot, interval: Duration) -> StatsSnapshot {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return *delta;
    }
    StatsSnapshot {
        bytes: (delta.bytes as f64 / secs) as u64,
        chunks: (delta.chunks as f64 / secs) as u64,
        open_channels: delta.open_channels,
    }
}

/// Render a per-second count with a binary unit.
pub fn format_rate(count: u64) -> String {
    const K: f64 = 1024.0;
    let value = count as f64;
    if count < 1024 {
        format!("{count}/s")
    } else if value < K * K {
        format!("{:.2} k/s", value / K)
    } else if value < K * K * K {
        format!("{:.2} M/s", value / (K * K))
    } else {
        format!("{:.2} G/s", value / (K * K * K))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_units() {
        assert_eq!(format_rate(0), "0/s");
        assert_eq!(format_rate(1023), "1023/s");
        assert_eq!(format_rate(1536), "1.50 k/s");
        assert_eq!(format_rate(5 * 1024 * 1024), "5.00 M/s");
        assert_eq!(format_rate(3 * 1024 * 1024 * 1024), "3.00 G/s");
    }

    #[test]
    fn averages_over_interval() {
        let delta = StatsSnapshot {
            bytes: 10_000,
            chunks: 50,
            open_channels: 4,
        };
        let rate = per_second(&delta, Duration::from_secs(10));
        assert_eq!(rate.bytes, 1_000);
        assert_eq!(rate.chunks, 5);
        assert_eq!(rate.open_channels, 4);

    }

    #[test]
    fn averages_over_fractional_intervals() {
        let delta = StatsSnapshot {
            bytes: 3_000,
            chunks: 30,
            open_channels: 1,
        };
        let rate = per_second(&delta, Duration::from_millis(500));
        assert_eq!(rate.bytes, 6_000);
        assert_eq!(rate.chunks, 60);

        let rate = per_second(&delta, Duration::from_millis(1500));
        assert_eq!(rate.bytes, 2_000);
        assert_eq!(rate.chunks, 20);
    }
}
