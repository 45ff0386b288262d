//! Writer and playback configuration
//!
//! Both structs are plain data with defaults so an application can persist
//! them alongside its own settings (`#[serde(default)]` fills missing keys).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default directory for session logs
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default extension of the raw byte-stream log
pub const DEFAULT_RAW_EXTENSION: &str = "bin";

/// Default extension of the parsed telemetry log
pub const DEFAULT_PARSED_EXTENSION: &str = "dat";

/// Timestamp gaps at or above this are treated as a session boundary (ms)
pub const DEFAULT_GAP_CEILING_MS: u64 = 5000;

/// Waits shorter than this are skipped entirely (ms)
pub const DEFAULT_MIN_SLEEP_MS: u64 = 1;

/// Sleep granularity while paused or pacing, bounds stop latency (ms)
pub const DEFAULT_PAUSE_POLL_MS: u64 = 10;

/// Bytes read per iteration when replaying a raw log
pub const DEFAULT_RAW_CHUNK_SIZE: usize = 256;

/// Configuration for [`crate::datalog::BinaryLogWriter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Directory receiving the session file pairs
    pub log_dir: PathBuf,
    /// Extension of the raw log (without the dot)
    pub raw_extension: String,
    /// Extension of the parsed log (without the dot)
    pub parsed_extension: String,
}

impl WriterConfig {
    /// Default configuration writing into `log_dir`
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            raw_extension: DEFAULT_RAW_EXTENSION.to_string(),
            parsed_extension: DEFAULT_PARSED_EXTENSION.to_string(),
        }
    }
}

/// Configuration for [`crate::datalog::LogPlayer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Timestamp deltas at or above this are replayed without waiting
    pub gap_ceiling_ms: u64,
    /// Computed waits at or below this are skipped
    pub min_sleep_ms: u64,
    /// Poll interval while paused; also the slice length of pacing sleeps
    pub pause_poll_ms: u64,
    /// Bytes per read in raw replay
    pub raw_chunk_size: usize,
    /// Treat a previous timestamp of exactly 0 as "no reference yet"
    pub zero_timestamp_is_unset: bool,
}

impl PlaybackConfig {
    /// Gap ceiling as a duration
    pub fn gap_ceiling(&self) -> Duration {
        Duration::from_millis(self.gap_ceiling_ms)
    }

    /// Minimum sleep as a duration
    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    /// Pause poll interval as a duration, never zero
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            gap_ceiling_ms: DEFAULT_GAP_CEILING_MS,
            min_sleep_ms: DEFAULT_MIN_SLEEP_MS,
            pause_poll_ms: DEFAULT_PAUSE_POLL_MS,
            raw_chunk_size: DEFAULT_RAW_CHUNK_SIZE,
            zero_timestamp_is_unset: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_defaults() {
        let config = PlaybackConfig::default();
        assert_eq!(config.gap_ceiling(), Duration::from_secs(5));
        assert_eq!(config.min_sleep(), Duration::from_millis(1));
        assert_eq!(config.raw_chunk_size, 256);
        assert!(!config.zero_timestamp_is_unset);
    }

    #[test]
    fn test_pause_poll_never_zero() {
        let config = PlaybackConfig {
            pause_poll_ms: 0,
            ..PlaybackConfig::default()
        };
        assert_eq!(config.pause_poll(), Duration::from_millis(1));
    }

    #[test]
    fn test_writer_config_new() {
        let config = WriterConfig::new("/tmp/flight");
        assert_eq!(config.log_dir, PathBuf::from("/tmp/flight"));
        assert_eq!(config.raw_extension, "bin");
        assert_eq!(config.parsed_extension, "dat");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PlaybackConfig = serde_json::from_str(r#"{ "gap_ceiling_ms": 2000 }"#).unwrap();
        assert_eq!(config.gap_ceiling_ms, 2000);
        assert_eq!(config.pause_poll_ms, DEFAULT_PAUSE_POLL_MS);

        let writer: WriterConfig = serde_json::from_str(r#"{ "log_dir": "flights" }"#).unwrap();
        assert_eq!(writer.log_dir, PathBuf::from("flights"));
        assert_eq!(writer.parsed_extension, DEFAULT_PARSED_EXTENSION);
    }
}
