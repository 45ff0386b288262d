//! Log file formats
//!
//! Session file naming, reading parsed logs back for analysis, and CSV export.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::config::{WriterConfig, DEFAULT_PARSED_EXTENSION, DEFAULT_RAW_EXTENSION};
use crate::error::LogError;
use crate::telemetry::{Telemetry, RECORD_SIZE};

/// Kind of session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Verbatim byte stream; replay runs it through a parser and converter
    Raw,
    /// Back-to-back fixed-size telemetry records
    Parsed,
}

impl LogKind {
    /// Detect kind from the default file extensions
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            DEFAULT_RAW_EXTENSION => Some(LogKind::Raw),
            DEFAULT_PARSED_EXTENSION => Some(LogKind::Parsed),
            _ => None,
        }
    }

    /// Default file extension for this kind
    pub fn extension(&self) -> &'static str {
        match self {
            LogKind::Raw => DEFAULT_RAW_EXTENSION,
            LogKind::Parsed => DEFAULT_PARSED_EXTENSION,
        }
    }
}

/// File pair of one logging session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Session start stamp (`YYYYmmdd_HHMMSS`)
    pub stamp: String,
    /// Raw byte-stream log
    pub raw: PathBuf,
    /// Parsed telemetry log
    pub parsed: PathBuf,
}

impl SessionPaths {
    /// Paths for a session starting at `start`
    ///
    /// One-second resolution: two sessions started within the same second
    /// map to the same files.
    pub fn for_start(config: &WriterConfig, start: DateTime<Local>) -> Self {
        let stamp = start.format("%Y%m%d_%H%M%S").to_string();
        let raw = config
            .log_dir
            .join(format!("{}_raw.{}", stamp, config.raw_extension));
        let parsed = config
            .log_dir
            .join(format!("{}_parsed.{}", stamp, config.parsed_extension));
        Self { stamp, raw, parsed }
    }
}

/// Contents of a parsed log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    /// Complete records in file order
    pub records: Vec<Telemetry>,
    /// Bytes of an incomplete record at the end of the file
    pub trailing_bytes: usize,
}

/// Read every complete record of a parsed log
pub fn read_parsed_log<P: AsRef<Path>>(path: P) -> Result<ParsedLog, LogError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| LogError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let mut log = ParsedLog::default();
    let mut buf = [0u8; RECORD_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == RECORD_SIZE {
            log.records.push(Telemetry::decode(&buf));
        } else {
            log.trailing_bytes = n;
            break;
        }
    }

    Ok(log)
}

/// Write telemetry records to a CSV file
pub fn write_csv<P: AsRef<Path>>(path: P, records: &[Telemetry]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    // Write header
    writeln!(
        writer,
        "Time,PosX,PosY,PosZ,VelX,VelY,VelZ,AccX,AccY,AccZ,QuatW,QuatX,QuatY,QuatZ,\
         Roll,Pitch,Yaw,Rx,Tx,Fsm,Sensor,Ejection"
    )?;

    // Write data rows
    for record in records {
        write!(writer, "{:.3}", record.timestamp as f64 / 1000.0)?;
        for value in record
            .position
            .iter()
            .chain(&record.velocity)
            .chain(&record.acceleration)
            .chain(&record.quaternion)
            .chain(&record.euler)
        {
            write!(writer, ",{:.6}", value)?;
        }
        writeln!(
            writer,
            ",{},{},{},{},{}",
            record.rx_count, record.tx_count, record.fsm, record.sensor, record.ejection
        )?;
    }

    writer.flush()?;
    Ok(())
}

/// Convert a parsed log into CSV, returning the number of rows written
pub fn export_csv<P: AsRef<Path>, Q: AsRef<Path>>(parsed: P, csv: Q) -> Result<usize, LogError> {
    let log = read_parsed_log(parsed)?;
    write_csv(csv, &log.records)?;
    Ok(log.records.len())
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF)
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
