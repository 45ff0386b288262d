//! Replay pacing
//!
//! Reconstructs the original spacing between records from their capture
//! timestamps.

use std::time::Duration;

use crate::config::PlaybackConfig;

/// Tracks the previously delivered timestamp and yields the wait before the next
#[derive(Debug, Clone)]
pub struct PacingClock {
    previous: Option<u32>,
    gap_ceiling: Duration,
    min_sleep: Duration,
    zero_is_unset: bool,
}

impl PacingClock {
    /// Clock using the thresholds of `config`
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            previous: None,
            gap_ceiling: config.gap_ceiling(),
            min_sleep: config.min_sleep(),
            zero_is_unset: config.zero_timestamp_is_unset,
        }
    }

    /// Forget the reference; the next record is delivered immediately
    pub fn clear(&mut self) {
        self.previous = None;
    }

    /// Timestamp of the last record seen
    pub fn previous(&self) -> Option<u32> {
        self.previous
    }

    /// Record `timestamp` and return how long to wait before delivering it
    ///
    /// `None` means deliver now: no reference yet, a non-positive delta, a
    /// delta at or beyond the gap ceiling, or a wait too short to matter.
    pub fn advance(&mut self, timestamp: u32, speed: f64) -> Option<Duration> {
        let previous = match self.previous {
            Some(0) if self.zero_is_unset => None,
            other => other,
        };
        self.previous = Some(timestamp);

        let delta = i64::from(timestamp) - i64::from(previous?);
        if delta <= 0 {
            return None;
        }

        if Duration::from_millis(delta as u64) >= self.gap_ceiling {
            return None;
        }

        let wait = Duration::from_nanos((delta as f64 * 1e6 / speed).round() as u64);
        (wait > self.min_sleep).then_some(wait)
    }
}
