use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between two throughput samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Integer percentage of `transferred` over `total`, clamped to 100.
///
/// Returns 0 when the total is unknown (zero).
pub fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u128::from(transferred) * 100 / u128::from(total)).min(100);
    pct as u8
}

/// Calculates transfer speed from byte deltas between spaced samples.
///
/// A new sample is taken only when at least [`SAMPLE_INTERVAL`] has passed
/// since the previous one; in between, the last computed rate is kept.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    last_bytes: u64,
    last_at: Instant,
    rate: u64,
}

impl ThroughputMeter {
    /// Creates a meter whose first sample window starts at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            last_bytes: 0,
            last_at: now,
            rate: 0,
        }
    }

    /// Starts over from zero bytes at `now`.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    /// Records the cumulative byte count at `now`.
    ///
    /// Returns `true` when a new sample was taken.
    pub fn record(&mut self, bytes: u64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < SAMPLE_INTERVAL {
            return false;
        }

        let delta = bytes.saturating_sub(self.last_bytes);
        self.rate = (delta as f64 / elapsed.as_secs_f64()) as u64;
        self.last_bytes = bytes;
        self.last_at = now;
        true
    }

    /// Bytes per second from the most recent sample.
    pub fn bytes_per_second(&self) -> u64 {
        self.rate
    }
}
