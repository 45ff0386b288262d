//! Error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the log writer, the log player and the log file helpers
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Raw log replay requires a parser and converter")]
    NoPipeline,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while decoding a protocol frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown packet id {0:#04x}")]
    UnknownPacket(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unexpected packet id {0:#04x}")]
    UnexpectedPacket(u8),
}
