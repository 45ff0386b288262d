//! # GCS Core Library
//!
//! Telemetry pipeline for a ground control station.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A thread-safe event bus wiring the pipeline stages together
//! - Parser / converter contracts plus a reference framed protocol
//! - Dual raw + parsed session logging of a live byte stream
//! - Timed replay of recorded sessions with pause, seek and speed control
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gcs_core::prelude::*;
//! use gcs_core::pipeline::envelope::{envelope_registry, EnvelopeParser, TelemetryConverter};
//!
//! let registry = Arc::new(envelope_registry());
//!
//! // Record every session of a transport
//! let transport = TransportEvents::default();
//! let writer = BinaryLogWriter::new(
//!     Box::new(EnvelopeParser::new(registry.clone())),
//!     Box::new(TelemetryConverter::new()),
//!     WriterConfig::new("logs"),
//! );
//! writer.bind(&transport);
//!
//! // Replay one of them at double speed
//! let player = LogPlayer::new(
//!     Box::new(EnvelopeParser::new(registry)),
//!     Box::new(TelemetryConverter::new()),
//!     PlaybackConfig::default(),
//! );
//! let _sub = player.events().telemetry.subscribe(|t| println!("t={} ms", t.timestamp));
//! player.load("logs/20260101_120000_raw.bin", LogKind::Raw)?;
//! player.set_speed(2.0);
//! player.play();
//! # Ok::<(), gcs_core::error::LogError>(())
//! ```

pub mod config;
pub mod datalog;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod telemetry;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PlaybackConfig, WriterConfig};
    pub use crate::datalog::{BinaryLogWriter, LogKind, LogPlayer, PlaybackState, SessionPaths};
    pub use crate::error::{FrameError, LogError};
    pub use crate::event::{EventBus, Subscription};
    pub use crate::pipeline::{Converter, Packet, PacketRegistry, Parser};
    pub use crate::telemetry::{Telemetry, RECORD_SIZE};
    pub use crate::transport::{ByteSource, SessionInfo, StreamPump, TransportEvents};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
