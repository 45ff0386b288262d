//! Log playback
//!
//! Replays a recorded session on a background worker, re-creating the
//! original spacing between records. Raw logs are re-fed through the player's
//! own parser and converter; parsed logs are read record by record.
//!
//! Control calls (`play`, `pause`, `seek_to`, ...) come from any thread and
//! only touch atomics or the source lock, which the worker holds for a single
//! read at a time. Seeks, stops, loads and restarts bump an epoch; the worker
//! drops any unit read under an older epoch, abandons a pacing wait when the
//! epoch moves, and resets the pipeline itself before feeding bytes of a new
//! one, so no frame straddles a jump.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::format::{read_full, LogKind};
use super::pacing::PacingClock;
use crate::config::PlaybackConfig;
use crate::error::LogError;
use crate::event::{lock, EventBus, Subscription};
use crate::pipeline::{Converter, Parser};
use crate::telemetry::{Telemetry, RECORD_SIZE};

/// Player state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No file loaded
    Idle,
    /// File open, worker not running
    Loaded,
    /// Worker delivering records
    Playing,
    /// Worker running but holding position
    Paused,
}

/// Events raised during playback
#[derive(Debug, Default, Clone)]
pub struct PlayerEvents {
    /// A record was replayed
    pub telemetry: EventBus<Telemetry>,
    /// A frame failed validation, or the log ends in a partial record
    pub validation_failed: EventBus<Vec<u8>>,
    /// The end of the log was reached
    pub end_of_file: EventBus<()>,
}

struct LogSource {
    path: PathBuf,
    kind: LogKind,
    size: u64,
    reader: BufReader<File>,
}

impl LogSource {
    /// Byte offset for `fraction`, never inside a record of a parsed log
    fn offset_for(&self, fraction: f64) -> u64 {
        let offset = ((fraction * self.size as f64).floor() as u64).min(self.size);
        match self.kind {
            LogKind::Parsed => offset - offset % RECORD_SIZE as u64,
            LogKind::Raw => offset,
        }
    }
}

struct Pipeline {
    parser: Mutex<Box<dyn Parser>>,
    converter: Mutex<Box<dyn Converter>>,
}

/// One unit read by the worker
enum Unit {
    Record(Telemetry),
    Bytes(Vec<u8>),
    Truncated(Vec<u8>),
    End,
}

struct PlayerShared {
    config: PlaybackConfig,
    source: Mutex<Option<LogSource>>,
    clock: Mutex<PacingClock>,
    pipeline: Option<Pipeline>,
    events: PlayerEvents,
    speed: AtomicU64,
    stop: AtomicBool,
    paused: AtomicBool,
    active: AtomicBool,
    /// Bumped (under the source lock) whenever the read position jumps
    epoch: AtomicU64,
    /// Epoch of the bytes currently inside the parser
    fed_epoch: AtomicU64,
    /// Identifies the worker allowed to run
    generation: AtomicU64,
}

impl PlayerShared {
    fn speed(&self) -> f64 {
        f64::from_bits(self.speed.load(Ordering::SeqCst))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn run(&self, generation: u64) {
        debug!(generation, "replay worker started");

        while !self.stop.load(Ordering::SeqCst) && self.is_current(generation) {
            if self.paused.load(Ordering::SeqCst) {
                thread::sleep(self.config.pause_poll());
                continue;
            }

            if !self.step() {
                if self.is_current(generation) {
                    self.stop.store(true, Ordering::SeqCst);
                    self.active.store(false, Ordering::SeqCst);
                    info!("end of log reached");
                    self.events.end_of_file.publish(&());
                }
                return;
            }
        }

        if self.is_current(generation) {
            self.active.store(false, Ordering::SeqCst);
        }
        debug!(generation, "replay worker stopped");
    }

    /// Read and deliver one unit; false at end of stream
    fn step(&self) -> bool {
        let (unit, epoch) = self.read_unit();
        let stale = epoch != self.epoch.load(Ordering::SeqCst);

        match unit {
            Unit::Record(telemetry) => {
                if !stale {
                    self.fed_epoch.store(epoch, Ordering::SeqCst);
                    self.deliver(&telemetry);
                }
                true
            }
            Unit::Bytes(bytes) => {
                if !stale {
                    self.feed(&bytes, epoch);
                }
                true
            }
            Unit::Truncated(bytes) => {
                warn!(bytes = bytes.len(), "log ends with a partial record");
                self.events.validation_failed.publish(&bytes);
                false
            }
            Unit::End => false,
        }
    }

    fn read_unit(&self) -> (Unit, u64) {
        let mut guard = lock(&self.source);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(source) = guard.as_mut() else {
            return (Unit::End, epoch);
        };

        let unit = match source.kind {
            LogKind::Parsed => {
                let mut buf = [0u8; RECORD_SIZE];
                match read_full(&mut source.reader, &mut buf) {
                    Ok(RECORD_SIZE) => Unit::Record(Telemetry::decode(&buf)),
                    Ok(0) => Unit::End,
                    Ok(n) => Unit::Truncated(buf[..n].to_vec()),
                    Err(e) => {
                        error!(path = %source.path.display(), "log read failed: {e}");
                        Unit::End
                    }
                }
            }
            LogKind::Raw => {
                let mut buf = vec![0u8; self.config.raw_chunk_size.max(1)];
                match read_chunk(&mut source.reader, &mut buf) {
                    Ok(0) => Unit::End,
                    Ok(n) => {
                        buf.truncate(n);
                        Unit::Bytes(buf)
                    }
                    Err(e) => {
                        error!(path = %source.path.display(), "log read failed: {e}");
                        Unit::End
                    }
                }
            }
        };
        (unit, epoch)
    }

    fn feed(&self, bytes: &[u8], epoch: u64) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };

        let mut parser = lock(&pipeline.parser);
        if self.fed_epoch.swap(epoch, Ordering::SeqCst) != epoch {
            parser.reset();
            lock(&pipeline.converter).reset();
        }
        parser.push_data(bytes);
    }

    /// Wait out the original gap before `telemetry`, then publish it
    ///
    /// Records fed before the latest jump are dropped without touching the
    /// clock, which the jump has already cleared.
    fn deliver(&self, telemetry: &Telemetry) {
        let epoch = self.fed_epoch.load(Ordering::SeqCst);
        let wait = {
            let mut clock = lock(&self.clock);
            if self.interrupted(epoch) {
                return;
            }
            clock.advance(telemetry.timestamp, self.speed())
        };
        if let Some(wait) = wait {
            if !self.sleep_uninterrupted(wait, epoch) {
                return;
            }
        }
        self.events.telemetry.publish(telemetry);
    }

    fn interrupted(&self, epoch: u64) -> bool {
        self.stop.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch
    }

    /// Sleep in slices, giving up early on a stop or a jump
    fn sleep_uninterrupted(&self, duration: Duration, epoch: u64) -> bool {
        let deadline = Instant::now() + duration;
        let slice = self.config.pause_poll();
        loop {
            if self.interrupted(epoch) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(slice));
        }
    }

    /// Move the read position and invalidate everything read before it
    ///
    /// Called with the source lock held, so the worker cannot read past the
    /// jump before the clock has forgotten its reference.
    fn reposition(&self, source: &mut LogSource, offset: u64) -> io::Result<()> {
        source.reader.seek(SeekFrom::Start(offset))?;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.clock).clear();
    }
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Replays recorded session logs with original timing
pub struct LogPlayer {
    // Released before the pipeline they listen to
    _pipeline_subscriptions: Vec<Subscription>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Workers stopped from their own thread, joined by the next control call
    retired: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<PlayerShared>,
}

impl LogPlayer {
    /// Player able to replay both raw and parsed logs
    pub fn new(parser: Box<dyn Parser>, converter: Box<dyn Converter>, config: PlaybackConfig) -> Self {
        let parser_events = parser.events().clone();
        let converter_events = converter.events().clone();

        let shared = Self::shared(
            config,
            Some(Pipeline {
                parser: Mutex::new(parser),
                converter: Mutex::new(converter),
            }),
        );

        let weak = Arc::downgrade(&shared);
        let on_packet = parser_events.packet_received.subscribe(move |packet| {
            if let Some(shared) = weak.upgrade() {
                if let Some(pipeline) = &shared.pipeline {
                    lock(&pipeline.converter).convert(packet.as_ref());
                }
            }
        });

        let events = shared.events.clone();
        let on_invalid = parser_events
            .validation_failed
            .subscribe(move |bytes| events.validation_failed.publish(bytes));

        let weak = Arc::downgrade(&shared);
        let on_telemetry = converter_events.telemetry.subscribe(move |telemetry| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(telemetry);
            }
        });

        Self {
            shared,
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            _pipeline_subscriptions: vec![on_packet, on_invalid, on_telemetry],
        }
    }

    /// Player for parsed logs only; loading a raw log fails
    pub fn parsed_only(config: PlaybackConfig) -> Self {
        Self {
            shared: Self::shared(config, None),
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            _pipeline_subscriptions: Vec::new(),
        }
    }

    /// Join a worker, or keep it for later when we are that worker
    /// (e.g. called from one of its listeners)
    fn join_worker(&self, handle: JoinHandle<()>) {
        if handle.thread().id() == thread::current().id() {
            lock(&self.retired).push(handle);
        } else if handle.join().is_err() {
            error!("replay worker panicked");
        }
    }

    fn join_retired(&self) {
        let retired = std::mem::take(&mut *lock(&self.retired));
        for handle in retired {
            self.join_worker(handle);
        }
    }

    fn shared(config: PlaybackConfig, pipeline: Option<Pipeline>) -> Arc<PlayerShared> {
        Arc::new(PlayerShared {
            clock: Mutex::new(PacingClock::new(&config)),
            config,
            source: Mutex::new(None),
            pipeline,
            events: PlayerEvents::default(),
            speed: AtomicU64::new(1.0f64.to_bits()),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            fed_epoch: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// Open a log file, stopping any playback first
    ///
    /// On failure the player is left without a file.
    pub fn load<P: AsRef<Path>>(&self, path: P, kind: LogKind) -> Result<(), LogError> {
        self.stop();

        let path = path.as_ref();
        let mut source = lock(&self.shared.source);
        *source = None;

        if kind == LogKind::Raw && self.shared.pipeline.is_none() {
            warn!(path = %path.display(), "raw log loaded on a player without pipeline");
            return Err(LogError::NoPipeline);
        }

        let opened = File::open(path).and_then(|file| {
            let size = file.metadata()?.len();
            Ok((file, size))
        });
        let (file, size) = opened.map_err(|e| {
            warn!(path = %path.display(), "failed to open log: {e}");
            LogError::Open {
                path: path.to_path_buf(),
                source: e,
            }
        })?;

        *source = Some(LogSource {
            path: path.to_path_buf(),
            kind,
            size,
            reader: BufReader::new(file),
        });
        self.shared.invalidate();
        drop(source);

        info!(path = %path.display(), ?kind, bytes = size, "log loaded");
        Ok(())
    }

    /// Start playback, or resume it if paused; no-op without a loaded file
    pub fn play(&self) {
        if self.shared.active.load(Ordering::SeqCst) {
            self.shared.paused.store(false, Ordering::SeqCst);
            return;
        }
        if lock(&self.shared.source).is_none() {
            debug!("play ignored, no log loaded");
            return;
        }

        // A worker that ran into the end of the log is still joinable
        let finished = lock(&self.worker).take();
        if let Some(handle) = finished {
            self.join_worker(handle);
        }
        self.join_retired();

        let mut worker = lock(&self.worker);
        if worker.is_some() || self.shared.active.load(Ordering::SeqCst) {
            self.shared.paused.store(false, Ordering::SeqCst);
            return;
        }

        // Anything an unjoinable old worker still has in flight is stale now
        {
            let source = lock(&self.shared.source);
            if source.is_none() {
                return;
            }
            self.shared.invalidate();
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.active.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("log-replay".into())
            .spawn(move || shared.run(generation))
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                error!("failed to start replay worker: {e}");
            }
        }
    }

    /// Hold the current position; `play` resumes
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Stop the worker, wait for it, and rewind to the start
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            self.join_worker(handle);
        }
        self.join_retired();

        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);

        match lock(&self.shared.source).as_mut() {
            Some(source) => {
                if let Err(e) = self.shared.reposition(source, 0) {
                    warn!(path = %source.path.display(), "failed to rewind log: {e}");
                }
            }
            None => lock(&self.shared.clock).clear(),
        }
    }

    /// Set the playback speed multiplier; non-positive values are ignored
    pub fn set_speed(&self, multiplier: f64) {
        if multiplier > 0.0 && multiplier.is_finite() {
            self.shared.speed.store(multiplier.to_bits(), Ordering::SeqCst);
        }
    }

    /// Current playback speed multiplier
    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    /// Jump to `fraction` of the file (clamped to 0..=1)
    ///
    /// Parsed logs land on the record boundary at or before the target.
    pub fn seek_to(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };

        {
            let mut guard = lock(&self.shared.source);
            let Some(source) = guard.as_mut() else {
                return;
            };
            let offset = source.offset_for(fraction);
            if let Err(e) = self.shared.reposition(source, offset) {
                warn!(path = %source.path.display(), offset, "seek failed: {e}");
                return;
            }
            debug!(offset, fraction, "seek");
        }
    }

    /// Fraction of the file consumed so far, 0.0 when nothing is loaded
    pub fn current_position(&self) -> f64 {
        let mut guard = lock(&self.shared.source);
        match guard.as_mut() {
            Some(source) if source.size > 0 => match source.reader.stream_position() {
                Ok(position) => position as f64 / source.size as f64,
                Err(_) => 0.0,
            },
            _ => 0.0,
        }
    }

    /// Byte offset of the next read
    pub fn byte_position(&self) -> Option<u64> {
        lock(&self.shared.source)
            .as_mut()
            .and_then(|source| source.reader.stream_position().ok())
    }

    /// Current state
    pub fn state(&self) -> PlaybackState {
        if self.shared.active.load(Ordering::SeqCst) {
            if self.shared.paused.load(Ordering::SeqCst) {
                PlaybackState::Paused
            } else {
                PlaybackState::Playing
            }
        } else if lock(&self.shared.source).is_some() {
            PlaybackState::Loaded
        } else {
            PlaybackState::Idle
        }
    }

    /// Whether the worker is running (paused included)
    pub fn is_playing(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Whether playback is paused
    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    /// Size of the loaded file in bytes
    pub fn file_size(&self) -> Option<u64> {
        lock(&self.shared.source).as_ref().map(|s| s.size)
    }

    /// Kind of the loaded file
    pub fn kind(&self) -> Option<LogKind> {
        lock(&self.shared.source).as_ref().map(|s| s.kind)
    }

    /// Path of the loaded file
    pub fn path(&self) -> Option<PathBuf> {
        lock(&self.shared.source).as_ref().map(|s| s.path.clone())
    }

    /// Playback events
    pub fn events(&self) -> &PlayerEvents {
        &self.shared.events
    }

    /// Playback configuration
    pub fn config(&self) -> &PlaybackConfig {
        &self.shared.config
    }
}

impl Drop for LogPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
