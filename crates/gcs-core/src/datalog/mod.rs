//! Data Logging
//!
//! Records live telemetry sessions and plays them back.
//!
//! A session produces two files: the raw byte stream exactly as received and
//! the parsed log of fixed-size [`Telemetry`](crate::telemetry::Telemetry)
//! records. Either can be replayed by a [`LogPlayer`].

mod format;
mod pacing;
mod player;
mod writer;

pub use format::{export_csv, read_parsed_log, write_csv, LogKind, ParsedLog, SessionPaths};
pub use pacing::PacingClock;
pub use player::{LogPlayer, PlaybackState, PlayerEvents};
pub use writer::{BinaryLogWriter, WriterEvents};
