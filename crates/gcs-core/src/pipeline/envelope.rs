//! Envelope protocol
//!
//! Reference framing used by the bundled parser and converter.
//!
//! Frame format:
//! - 1 byte: sync (`0xA5`)
//! - 1 byte: packet id
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload
//! - 4 bytes: CRC32 of id + length + payload (big-endian)

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc32fast::Hasher;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{Converter, ConverterEvents, Packet, PacketRegistry, Parser, ParserEvents};
use crate::error::FrameError;
use crate::telemetry::{quaternion_to_euler, Telemetry};

/// Frame start marker
pub const SYNC_BYTE: u8 = 0xA5;

/// Sync + id + length
pub const HEADER_SIZE: usize = 4;

/// Trailing CRC32
pub const CRC_SIZE: usize = 4;

/// Largest payload accepted; longer length fields are treated as noise
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Packet id of [`TelemetryPacket`]
pub const TELEMETRY_PACKET_ID: u8 = 0x01;

/// Encoded payload size of [`TelemetryPacket`]
pub const TELEMETRY_PAYLOAD_SIZE: usize = 4 + 13 * 8 + 4 + 4 + 1 + 1 + 1;

/// CRC32 over the id, the big-endian length and the payload
///
/// `payload` must not exceed [`MAX_PAYLOAD_SIZE`].
pub fn frame_crc(id: u8, payload: &[u8]) -> u32 {
    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, payload.len() as u16);

    let mut hasher = Hasher::new();
    hasher.update(&[id]);
    hasher.update(&len_bytes);
    hasher.update(payload);
    hasher.finalize()
}

/// Wrap a packet in a complete frame
///
/// Payloads longer than [`MAX_PAYLOAD_SIZE`] are rejected; the parser would
/// treat their length field as noise.
pub fn encode_frame(packet: &dyn Packet) -> Result<Vec<u8>, FrameError> {
    let id = packet.id();
    let payload = packet.serialize();
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);

    bytes.push(SYNC_BYTE);
    bytes.push(id);

    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, payload.len() as u16);
    bytes.extend_from_slice(&len_bytes);

    bytes.extend_from_slice(&payload);

    let mut crc_bytes = [0u8; 4];
    BigEndian::write_u32(&mut crc_bytes, frame_crc(id, &payload));
    bytes.extend_from_slice(&crc_bytes);

    Ok(bytes)
}

/// Registry containing every packet of the envelope protocol
pub fn envelope_registry() -> PacketRegistry {
    let mut registry = PacketRegistry::new();
    registry.register(TELEMETRY_PACKET_ID, TelemetryPacket::decode);
    registry
}

/// Vehicle state as sent over the link
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryPacket {
    /// Milliseconds since vehicle boot
    pub timestamp: u32,
    /// Position (m)
    pub position: [f64; 3],
    /// Velocity (m/s)
    pub velocity: [f64; 3],
    /// Acceleration (m/s^2)
    pub acceleration: [f64; 3],
    /// Attitude quaternion (W, X, Y, Z)
    pub quaternion: [f64; 4],
    /// Packets received by the vehicle
    pub rx_count: u32,
    /// Packets transmitted by the vehicle
    pub tx_count: u32,
    /// Flight state machine code
    pub fsm: u8,
    /// Sensor status flags
    pub sensor: u8,
    /// Ejection type code
    pub ejection: u8,
}

impl TelemetryPacket {
    /// Build the packet that carries `record` (Euler angles are not sent)
    pub fn from_record(record: &Telemetry) -> Self {
        Self {
            timestamp: record.timestamp,
            position: record.position,
            velocity: record.velocity,
            acceleration: record.acceleration,
            quaternion: record.quaternion,
            rx_count: record.rx_count,
            tx_count: record.tx_count,
            fsm: record.fsm,
            sensor: record.sensor,
            ejection: record.ejection,
        }
    }

    /// Parse a payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() != TELEMETRY_PAYLOAD_SIZE {
            return Err(FrameError::Truncated {
                expected: TELEMETRY_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }

        let mut values = [0f64; 13];
        for (i, value) in values.iter_mut().enumerate() {
            *value = LittleEndian::read_f64(&payload[4 + i * 8..]);
        }
        let tail = 4 + 13 * 8;

        Ok(Self {
            timestamp: LittleEndian::read_u32(&payload[0..4]),
            position: [values[0], values[1], values[2]],
            velocity: [values[3], values[4], values[5]],
            acceleration: [values[6], values[7], values[8]],
            quaternion: [values[9], values[10], values[11], values[12]],
            rx_count: LittleEndian::read_u32(&payload[tail..]),
            tx_count: LittleEndian::read_u32(&payload[tail + 4..]),
            fsm: payload[tail + 8],
            sensor: payload[tail + 9],
            ejection: payload[tail + 10],
        })
    }

    fn decode(payload: &[u8]) -> Result<Arc<dyn Packet>, FrameError> {
        Ok(Arc::new(Self::from_payload(payload)?))
    }
}

impl Packet for TelemetryPacket {
    fn id(&self) -> u8 {
        TELEMETRY_PACKET_ID
    }

    fn serialize(&self) -> Vec<u8> {
        let mut payload = vec![0u8; TELEMETRY_PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut payload[0..4], self.timestamp);

        let values = self
            .position
            .iter()
            .chain(&self.velocity)
            .chain(&self.acceleration)
            .chain(&self.quaternion);
        for (i, value) in values.enumerate() {
            LittleEndian::write_f64(&mut payload[4 + i * 8..], *value);
        }

        let tail = 4 + 13 * 8;
        LittleEndian::write_u32(&mut payload[tail..], self.rx_count);
        LittleEndian::write_u32(&mut payload[tail + 4..], self.tx_count);
        payload[tail + 8] = self.fsm;
        payload[tail + 9] = self.sensor;
        payload[tail + 10] = self.ejection;
        payload
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Streaming parser for envelope frames
pub struct EnvelopeParser {
    registry: Arc<PacketRegistry>,
    buffer: Vec<u8>,
    events: ParserEvents,
}

impl EnvelopeParser {
    /// Create a parser resolving packet ids through `registry`
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            buffer: Vec::with_capacity(HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE),
            events: ParserEvents::default(),
        }
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn drain_frames(&mut self) {
        loop {
            match self.buffer.iter().position(|&b| b == SYNC_BYTE) {
                None => {
                    if !self.buffer.is_empty() {
                        trace!(bytes = self.buffer.len(), "discarding bytes without sync");
                    }
                    self.buffer.clear();
                    return;
                }
                Some(0) => {}
                Some(skip) => {
                    trace!(bytes = skip, "discarding bytes before sync");
                    self.buffer.drain(..skip);
                }
            }

            if self.buffer.len() < HEADER_SIZE {
                return;
            }

            let id = self.buffer[1];
            let length = BigEndian::read_u16(&self.buffer[2..4]) as usize;
            if length > MAX_PAYLOAD_SIZE {
                debug!(length, "implausible frame length, resyncing");
                self.buffer.drain(..1);
                continue;
            }

            let frame_len = HEADER_SIZE + length + CRC_SIZE;
            if self.buffer.len() < frame_len {
                return;
            }

            let payload = &self.buffer[HEADER_SIZE..HEADER_SIZE + length];
            let received = BigEndian::read_u32(&self.buffer[HEADER_SIZE + length..frame_len]);
            let expected = frame_crc(id, payload);

            if received != expected {
                debug!(
                    "{}",
                    FrameError::CrcMismatch {
                        expected,
                        actual: received
                    }
                );
                let frame = self.buffer[..frame_len].to_vec();
                // The sync byte may have been noise; retry from the next byte
                self.buffer.drain(..1);
                self.events.validation_failed.publish(&frame);
                continue;
            }

            let decoded = self.registry.decode(id, payload);
            self.buffer.drain(..frame_len);
            match decoded {
                Ok(packet) => self.events.packet_received.publish(&packet),
                Err(e) => debug!(id, "dropping frame: {e}"),
            }
        }
    }
}

impl Parser for EnvelopeParser {
    fn push_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.drain_frames();
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn events(&self) -> &ParserEvents {
        &self.events
    }
}

/// Converts [`TelemetryPacket`]s into [`Telemetry`] records
#[derive(Debug, Default)]
pub struct TelemetryConverter {
    events: ConverterEvents,
    converted: u64,
    last_timestamp: Option<u32>,
}

impl TelemetryConverter {
    /// Create a converter
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets converted since creation or the last reset
    pub fn converted(&self) -> u64 {
        self.converted
    }
}

impl Converter for TelemetryConverter {
    fn convert(&mut self, packet: &dyn Packet) {
        let Some(packet) = packet.as_any().downcast_ref::<TelemetryPacket>() else {
            debug!("ignoring {}", FrameError::UnexpectedPacket(packet.id()));
            return;
        };

        if let Some(last) = self.last_timestamp {
            if packet.timestamp < last {
                debug!(
                    last,
                    current = packet.timestamp,
                    "telemetry timestamp went backwards"
                );
            }
        }
        self.last_timestamp = Some(packet.timestamp);
        self.converted += 1;

        let record = Telemetry {
            timestamp: packet.timestamp,
            position: packet.position,
            velocity: packet.velocity,
            acceleration: packet.acceleration,
            quaternion: packet.quaternion,
            euler: quaternion_to_euler(packet.quaternion),
            rx_count: packet.rx_count,
            tx_count: packet.tx_count,
            fsm: packet.fsm,
            sensor: packet.sensor,
            ejection: packet.ejection,
        };
        self.events.telemetry.publish(&record);
    }

    fn reset(&mut self) {
        self.converted = 0;
        self.last_timestamp = None;
    }

    fn events(&self) -> &ConverterEvents {
        &self.events
    }
}
