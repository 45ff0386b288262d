//! Transport boundary
//!
//! The core never opens devices itself. A transport announces a session with
//! `opened`, streams `bytes_received`, and ends it with `closed`; the log
//! writer only consumes those three events.
//!
//! [`StreamPump`] adapts any blocking [`Read`] (a serial handle, a TCP stream,
//! a file) into that event shape on a background thread.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::event::EventBus;

/// Size of the pump's read buffer
const PUMP_BUFFER_SIZE: usize = 4096;

/// Identifies the connection a session runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Port or endpoint name (e.g. "/dev/ttyUSB0")
    pub name: String,
}

impl SessionInfo {
    /// Session info for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Notifications raised by a byte transport
#[derive(Debug, Default, Clone)]
pub struct TransportEvents {
    /// The connection was opened; a new session starts
    pub opened: EventBus<SessionInfo>,
    /// The connection was closed; the session ends
    pub closed: EventBus<SessionInfo>,
    /// Bytes arrived on the connection
    pub bytes_received: EventBus<Vec<u8>>,
}

/// Anything exposing transport notifications
pub trait ByteSource {
    /// Event buses of this source
    fn events(&self) -> &TransportEvents;
}

impl ByteSource for TransportEvents {
    fn events(&self) -> &TransportEvents {
        self
    }
}

/// Pumps a blocking reader into [`TransportEvents`]
///
/// Publishes `opened` once, every non-empty read as `bytes_received`, and
/// `closed` on end of stream, on a read error, or after [`StreamPump::stop`].
pub struct StreamPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl StreamPump {
    /// Start pumping `reader` on a new thread
    pub fn spawn<R>(name: impl Into<String>, reader: R, events: TransportEvents) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let session = SessionInfo::new(name);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("pump-{}", session.name))
            .spawn(move || pump(reader, session, events, flag))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the pump to finish after the current read returns
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the pump thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the pump to finish, returning the number of bytes forwarded
    pub fn join(mut self) -> u64 {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(total)) => total,
            Some(Err(_)) => {
                warn!("stream pump thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        // A reader blocked without timeout would hang a join here, so the
        // thread is only told to stop.
        self.stop();
    }
}

fn pump<R: Read>(mut reader: R, session: SessionInfo, events: TransportEvents, stop: Arc<AtomicBool>) -> u64 {
    info!(port = %session.name, "transport opened");
    events.opened.publish(&session);

    let mut buf = [0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;
    while !stop.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                events.bytes_received.publish(&buf[..n].to_vec());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Serial ports report an idle line as a timeout
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(port = %session.name, "transport read failed: {e}");
                break;
            }
        }
    }

    debug!(port = %session.name, bytes = total, "transport closing");
    events.closed.publish(&session);
    total
}
