//! Binary log writer
//!
//! Mirrors a live transport into a raw/parsed file pair while still driving
//! its own parser and converter for live consumers.
//!
//! The event chain bytes → parser → packet → converter → telemetry → file
//! runs synchronously on the transport's thread. Each stage sits behind its
//! own lock and locks are only ever taken in that order (parser, converter,
//! files), with the file lock released before bytes enter the parser.
//!
//! Notifications for the writer's own listeners are queued while the stage
//! locks are held and published once they are released, so a listener may
//! feed bytes straight back into the writer.

use chrono::Local;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::format::SessionPaths;
use crate::config::WriterConfig;
use crate::error::LogError;
use crate::event::{lock, EventBus, Subscription};
use crate::pipeline::{Converter, Parser};
use crate::telemetry::Telemetry;
use crate::transport::ByteSource;

/// Events re-published by the writer for live consumers
#[derive(Debug, Default, Clone)]
pub struct WriterEvents {
    /// Telemetry converted from the live stream
    pub telemetry: EventBus<Telemetry>,
    /// Frames of the live stream that failed validation
    pub validation_failed: EventBus<Vec<u8>>,
}

#[derive(Default)]
struct SessionFiles {
    paths: Option<SessionPaths>,
    raw: Option<BufWriter<File>>,
    parsed: Option<BufWriter<File>>,
}

impl SessionFiles {
    fn is_open(&self) -> bool {
        self.raw.is_some() || self.parsed.is_some()
    }

    fn close(&mut self) {
        for (label, stream) in [("raw", &mut self.raw), ("parsed", &mut self.parsed)] {
            if let Some(mut file) = stream.take() {
                if let Err(e) = file.flush() {
                    warn!(stream = label, "failed to flush log: {e}");
                }
            }
        }
        if let Some(paths) = self.paths.take() {
            info!(session = %paths.stamp, "log session closed");
        }
    }
}

/// Appends to `stream`; a failed write closes the stream for the rest of the session
fn append(stream: &mut Option<BufWriter<File>>, bytes: &[u8], label: &str) {
    let failed = match stream {
        Some(file) => file.write_all(bytes).err(),
        None => None,
    };
    if let Some(e) = failed {
        error!(stream = label, "log write failed, dropping further writes: {e}");
        *stream = None;
    }
}

fn open_stream(path: &Path) -> Result<BufWriter<File>, LogError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| LogError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Notification produced under the stage locks
enum Outcome {
    Telemetry(Telemetry),
    Invalid(Vec<u8>),
}

struct WriterShared {
    config: WriterConfig,
    files: Mutex<SessionFiles>,
    parser: Mutex<Box<dyn Parser>>,
    converter: Mutex<Box<dyn Converter>>,
    outbox: Mutex<VecDeque<Outcome>>,
    events: WriterEvents,
}

impl WriterShared {
    fn start_logging(&self) -> Result<SessionPaths, LogError> {
        let mut files = lock(&self.files);
        files.close();

        let dir = &self.config.log_dir;
        if let Err(source) = fs::create_dir_all(dir) {
            let err = LogError::CreateDir {
                path: dir.clone(),
                source,
            };
            error!("{err}");
            return Err(err);
        }

        let paths = SessionPaths::for_start(&self.config, Local::now());
        let mut result = Ok(paths.clone());

        match open_stream(&paths.raw) {
            Ok(file) => files.raw = Some(file),
            Err(e) => {
                error!("{e}");
                result = Err(e);
            }
        }
        match open_stream(&paths.parsed) {
            Ok(file) => files.parsed = Some(file),
            Err(e) => {
                error!("{e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if files.is_open() {
            info!(
                raw = %paths.raw.display(),
                parsed = %paths.parsed.display(),
                "log session started"
            );
            files.paths = Some(paths);
        }
        result
    }

    fn stop_logging(&self) {
        lock(&self.files).close();
    }

    fn ingest(&self, bytes: &[u8]) {
        append(&mut lock(&self.files).raw, bytes, "raw");
        lock(&self.parser).push_data(bytes);
        self.publish_outbox();
    }

    /// Runs under the parser and converter locks
    fn record(&self, telemetry: &Telemetry) {
        append(&mut lock(&self.files).parsed, &telemetry.encode(), "parsed");
        lock(&self.outbox).push_back(Outcome::Telemetry(*telemetry));
    }

    /// Publish queued notifications in order, with no stage lock held
    fn publish_outbox(&self) {
        loop {
            let next = lock(&self.outbox).pop_front();
            match next {
                Some(Outcome::Telemetry(telemetry)) => self.events.telemetry.publish(&telemetry),
                Some(Outcome::Invalid(bytes)) => self.events.validation_failed.publish(&bytes),
                None => return,
            }
        }
    }

    fn reset_pipeline(&self) {
        lock(&self.parser).reset();
        lock(&self.converter).reset();
    }
}

/// Records a live transport into raw and parsed session logs
pub struct BinaryLogWriter {
    shared: Arc<WriterShared>,
    transport: Mutex<Vec<Subscription>>,
    pipeline: Vec<Subscription>,
}

impl BinaryLogWriter {
    /// Create a writer owning `parser` and `converter`
    ///
    /// The log directory is created when the first session starts.
    pub fn new(parser: Box<dyn Parser>, converter: Box<dyn Converter>, config: WriterConfig) -> Self {
        let parser_events = parser.events().clone();
        let converter_events = converter.events().clone();

        let shared = Arc::new(WriterShared {
            config,
            files: Mutex::new(SessionFiles::default()),
            parser: Mutex::new(parser),
            converter: Mutex::new(converter),
            outbox: Mutex::new(VecDeque::new()),
            events: WriterEvents::default(),
        });

        let weak = Arc::downgrade(&shared);
        let on_packet = parser_events.packet_received.subscribe(move |packet| {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.converter).convert(packet.as_ref());
            }
        });

        let weak = Arc::downgrade(&shared);
        let on_invalid = parser_events.validation_failed.subscribe(move |bytes| {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.outbox).push_back(Outcome::Invalid(bytes.clone()));
            }
        });

        let weak = Arc::downgrade(&shared);
        let on_telemetry = converter_events.telemetry.subscribe(move |telemetry| {
            if let Some(shared) = weak.upgrade() {
                shared.record(telemetry);
            }
        });

        Self {
            shared,
            transport: Mutex::new(Vec::new()),
            pipeline: vec![on_packet, on_invalid, on_telemetry],
        }
    }

    /// Follow `source`: its sessions open and close log pairs, its bytes are recorded
    ///
    /// Binding again detaches from the previously bound source.
    pub fn bind(&self, source: &dyn ByteSource) {
        let events = source.events();
        let mut subs = lock(&self.transport);
        subs.clear();

        let weak = Arc::downgrade(&self.shared);
        subs.push(events.opened.subscribe(move |session| {
            if let Some(shared) = weak.upgrade() {
                debug!(port = %session.name, "transport opened, starting log session");
                shared.reset_pipeline();
                // Failures are already reported; writes are dropped until the next session
                let _ = shared.start_logging();
            }
        }));

        let weak = Arc::downgrade(&self.shared);
        subs.push(events.closed.subscribe(move |session| {
            if let Some(shared) = weak.upgrade() {
                debug!(port = %session.name, "transport closed, ending log session");
                shared.stop_logging();
            }
        }));

        let weak = Arc::downgrade(&self.shared);
        subs.push(events.bytes_received.subscribe(move |bytes| {
            if let Some(shared) = weak.upgrade() {
                shared.ingest(bytes);
            }
        }));
    }

    /// Detach from the bound source, keeping any open session
    pub fn unbind(&self) {
        lock(&self.transport).clear();
    }

    /// Open a new timestamp-named file pair, closing the current one first
    ///
    /// On failure the error is logged and returned; streams that could not be
    /// opened silently drop their writes until the next successful start.
    pub fn start_logging(&self) -> Result<SessionPaths, LogError> {
        self.shared.start_logging()
    }

    /// Flush and close the current file pair; no-op when not logging
    pub fn stop_logging(&self) {
        self.shared.stop_logging();
    }

    /// Record bytes as if they arrived from the bound transport
    ///
    /// Safe to call from a listener of this writer's own events.
    pub fn ingest(&self, bytes: &[u8]) {
        self.shared.ingest(bytes);
    }

    /// Whether a session file is open
    pub fn is_logging(&self) -> bool {
        lock(&self.shared.files).is_open()
    }

    /// Files of the current session
    pub fn session_paths(&self) -> Option<SessionPaths> {
        lock(&self.shared.files).paths.clone()
    }

    /// Live telemetry and validation events
    pub fn events(&self) -> &WriterEvents {
        &self.shared.events
    }

    /// Writer configuration
    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }
}

impl Drop for BinaryLogWriter {
    fn drop(&mut self) {
        // No callback may reach the writer once teardown begins
        lock(&self.transport).clear();
        self.pipeline.clear();
        self.shared.stop_logging();
    }
}
