//! Tests for session logging

use gcs_core::config::WriterConfig;
use gcs_core::datalog::{read_parsed_log, BinaryLogWriter, LogKind};
use gcs_core::error::LogError;
use gcs_core::pipeline::envelope::{encode_frame, envelope_registry, EnvelopeParser, TelemetryConverter, TelemetryPacket};
use gcs_core::telemetry::{quaternion_to_euler, Telemetry, RECORD_SIZE};
use gcs_core::transport::{SessionInfo, StreamPump, TransportEvents};
use pretty_assertions::assert_eq;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sample(i: u32) -> Telemetry {
    let quaternion = [1.0, 0.0, 0.0, 0.0];
    Telemetry {
        timestamp: i * 50,
        position: [0.0, 0.0, 10.0 * i as f64],
        velocity: [0.0, 0.0, 10.0],
        acceleration: [0.0, 0.0, 1.5],
        quaternion,
        euler: quaternion_to_euler(quaternion),
        rx_count: i,
        tx_count: i + 1,
        fsm: 2,
        sensor: 0x03,
        ejection: 0,
    }
}

fn stream(records: &[Telemetry]) -> Vec<u8> {
    records
        .iter()
        .flat_map(|r| encode_frame(&TelemetryPacket::from_record(r)).unwrap())
        .collect()
}

fn writer(log_dir: impl Into<PathBuf>) -> BinaryLogWriter {
    let registry = Arc::new(envelope_registry());
    BinaryLogWriter::new(
        Box::new(EnvelopeParser::new(registry)),
        Box::new(TelemetryConverter::new()),
        WriterConfig::new(log_dir),
    )
}

/// Session files in `dir` of the given kind
fn logs_of(dir: &Path, kind: LogKind) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| LogKind::from_extension(path) == Some(kind))
        .collect();
    found.sort();
    found
}

#[test]
fn test_session_via_stream_pump() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join("logs");
    let records: Vec<Telemetry> = (0..25).map(sample).collect();
    let bytes = stream(&records);

    let transport = TransportEvents::default();
    let writer = writer(&log_dir);
    writer.bind(&transport);

    let (tx, live) = mpsc::channel();
    let _sub = writer.events().telemetry.subscribe(move |t| {
        let _ = tx.send(*t);
    });

    let pump = StreamPump::spawn("loopback", Cursor::new(bytes.clone()), transport.clone()).unwrap();
    assert_eq!(pump.join(), bytes.len() as u64);
    assert!(!writer.is_logging());

    let raw = logs_of(&log_dir, LogKind::Raw);
    let parsed = logs_of(&log_dir, LogKind::Parsed);
    assert_eq!(raw.len(), 1);
    assert_eq!(parsed.len(), 1);
    assert!(raw[0].to_string_lossy().ends_with("_raw.bin"));
    assert!(parsed[0].to_string_lossy().ends_with("_parsed.dat"));

    assert_eq!(fs::read(&raw[0]).unwrap(), bytes);
    let log = read_parsed_log(&parsed[0]).unwrap();
    assert_eq!(log.trailing_bytes, 0);
    assert_eq!(log.records, records);
    assert_eq!(live.try_iter().collect::<Vec<_>>(), records);
}

#[test]
fn test_uncreatable_directory_still_parses() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not_a_dir");
    fs::write(&blocker, b"file").unwrap();

    let writer = writer(blocker.join("logs"));
    let (tx, live) = mpsc::channel();
    let _sub = writer.events().telemetry.subscribe(move |t| {
        let _ = tx.send(*t);
    });

    let result = writer.start_logging();
    assert!(matches!(result, Err(LogError::CreateDir { .. })));
    assert!(!writer.is_logging());

    let records: Vec<Telemetry> = (0..3).map(sample).collect();
    writer.ingest(&stream(&records));
    assert_eq!(live.try_iter().collect::<Vec<_>>(), records);
    writer.stop_logging();
}

#[test]
fn test_uncreatable_directory_on_transport_open() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not_a_dir");
    fs::write(&blocker, b"file").unwrap();

    let transport = TransportEvents::default();
    let writer = writer(blocker.join("logs"));
    writer.bind(&transport);
    let (tx, live) = mpsc::channel();
    let _sub = writer.events().telemetry.subscribe(move |t| {
        let _ = tx.send(*t);
    });

    let session = SessionInfo::new("COM3");
    transport.opened.publish(&session);
    transport.bytes_received.publish(&stream(&[sample(7)]));
    transport.closed.publish(&session);

    assert_eq!(live.try_iter().count(), 1);
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let writer = writer(dir.path());

    writer.stop_logging();
    assert!(!writer.is_logging());
    assert_eq!(writer.session_paths(), None);

    let first = writer.start_logging().unwrap();
    let second = writer.start_logging().unwrap();
    assert!(writer.is_logging());
    assert_eq!(writer.session_paths(), Some(second.clone()));
    assert!(first.raw.exists());
    assert!(second.parsed.exists());

    writer.stop_logging();
    writer.stop_logging();
    assert!(!writer.is_logging());
    assert_eq!(writer.session_paths(), None);
}

#[test]
fn test_drop_flushes_session() {
    let dir = TempDir::new().unwrap();
    let records: Vec<Telemetry> = (0..4).map(sample).collect();
    let bytes = stream(&records);

    let paths = {
        let writer = writer(dir.path());
        let paths = writer.start_logging().unwrap();
        writer.ingest(&bytes[..100]);
        writer.ingest(&bytes[100..]);
        paths
    };

    assert_eq!(fs::read(&paths.raw).unwrap(), bytes);
    assert_eq!(fs::metadata(&paths.parsed).unwrap().len(), (4 * RECORD_SIZE) as u64);
    assert_eq!(read_parsed_log(&paths.parsed).unwrap().records, records);
}

#[test]
fn test_corrupt_frame_is_reported_and_skipped() {
    let dir = TempDir::new().unwrap();
    let writer = writer(dir.path());
    let paths = writer.start_logging().unwrap();

    let (tx, invalid) = mpsc::channel();
    let _sub = writer.events().validation_failed.subscribe(move |bytes| {
        let _ = tx.send(bytes.clone());
    });

    let mut corrupt = encode_frame(&TelemetryPacket::from_record(&sample(1))).unwrap();
    corrupt[8] ^= 0x5A;
    let tail = corrupt.len() - 4;
    corrupt[tail..].fill(0);

    writer.ingest(&corrupt);
    writer.ingest(&stream(&[sample(2)]));
    writer.stop_logging();

    assert!(invalid.try_recv().is_ok());
    assert_eq!(read_parsed_log(&paths.parsed).unwrap().records, vec![sample(2)]);
}

#[test]
fn test_rebind_follows_new_source_only() {
    let dir = TempDir::new().unwrap();
    let writer = writer(dir.path());
    let old = TransportEvents::default();
    let new = TransportEvents::default();

    writer.bind(&old);
    writer.bind(&new);
    assert_eq!(old.opened.listener_count(), 0);
    assert_eq!(new.bytes_received.listener_count(), 1);

    old.opened.publish(&SessionInfo::new("old"));
    assert!(!writer.is_logging());

    new.opened.publish(&SessionInfo::new("new"));
    assert!(writer.is_logging());

    writer.unbind();
    assert_eq!(new.closed.listener_count(), 0);
    assert!(writer.is_logging());
}

#[test]
fn test_drop_detaches_from_transport() {
    let transport = TransportEvents::default();
    let dir = TempDir::new().unwrap();
    {
        let writer = writer(dir.path());
        writer.bind(&transport);
        assert_eq!(transport.bytes_received.listener_count(), 1);
    }
    assert_eq!(transport.opened.listener_count(), 0);
    assert_eq!(transport.bytes_received.listener_count(), 0);
    transport.bytes_received.publish(&vec![0xA5, 0x01]);
}

#[test]
fn test_listener_may_feed_bytes_back() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let writer = Arc::new(writer(dir.path()));
    let paths = writer.start_logging().unwrap();

    let (tx, live) = mpsc::channel();
    let weak: Weak<BinaryLogWriter> = Arc::downgrade(&writer);
    let _sub = writer.events().telemetry.subscribe(move |t| {
        let _ = tx.send(t.timestamp);
        if t.timestamp == sample(1).timestamp {
            if let Some(writer) = weak.upgrade() {
                writer.ingest(&[0x00]);
                writer.ingest(&stream(&[sample(2)]));
            }
        }
    });

    let (done_tx, done) = mpsc::channel();
    let feeder = {
        let writer = writer.clone();
        thread::spawn(move || {
            writer.ingest(&stream(&[sample(1)]));
            let _ = done_tx.send(());
        })
    };
    assert!(done.recv_timeout(Duration::from_secs(3)).is_ok(), "ingest did not return");
    feeder.join().unwrap();

    assert_eq!(live.try_iter().collect::<Vec<_>>(), vec![50, 100]);
    writer.stop_logging();

    let mut expected_raw = stream(&[sample(1)]);
    expected_raw.push(0x00);
    expected_raw.extend(stream(&[sample(2)]));
    assert_eq!(fs::read(&paths.raw).unwrap(), expected_raw);
    assert_eq!(read_parsed_log(&paths.parsed).unwrap().records, vec![sample(1), sample(2)]);
}
