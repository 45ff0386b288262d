//! Telemetry record
//!
//! One fixed-size sample of vehicle state. The encoded form is exactly what
//! the parsed log stores: fields back to back in declaration order,
//! little-endian, no padding, no header.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Encoded size of one [`Telemetry`] record in bytes
pub const RECORD_SIZE: usize = 4 + 3 * 8 * 3 + 4 * 8 + 3 * 8 + 4 + 4 + 1 + 1 + 1;

/// A single telemetry sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Capture time in milliseconds since session start
    pub timestamp: u32,
    /// Position (m)
    pub position: [f64; 3],
    /// Velocity (m/s)
    pub velocity: [f64; 3],
    /// Acceleration (m/s^2)
    pub acceleration: [f64; 3],
    /// Attitude quaternion (W, X, Y, Z)
    pub quaternion: [f64; 4],
    /// Attitude as roll, pitch, yaw (rad)
    pub euler: [f64; 3],
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

impl Telemetry {
    /// Encode into the parsed-log layout
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut offset = 0;

        LittleEndian::write_u32(&mut buf[offset..], self.timestamp);
        offset += 4;
        for value in self
            .position
            .iter()
            .chain(&self.velocity)
            .chain(&self.acceleration)
            .chain(&self.quaternion)
            .chain(&self.euler)
        {
            LittleEndian::write_f64(&mut buf[offset..], *value);
            offset += 8;
        }
        LittleEndian::write_u32(&mut buf[offset..], self.rx_count);
        LittleEndian::write_u32(&mut buf[offset + 4..], self.tx_count);
        offset += 8;
        buf[offset] = self.fsm;
        buf[offset + 1] = self.sensor;
        buf[offset + 2] = self.ejection;

        buf
    }

    /// Decode one record from the parsed-log layout
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut offset = 4;
        let mut next = || {
            let value = LittleEndian::read_f64(&buf[offset..]);
            offset += 8;
            value
        };

        let position = [next(), next(), next()];
        let velocity = [next(), next(), next()];
        let acceleration = [next(), next(), next()];
        let quaternion = [next(), next(), next(), next()];
        let euler = [next(), next(), next()];

        let tail = 4 + 16 * 8;
        Self {
            timestamp: LittleEndian::read_u32(&buf[0..4]),
            position,
            velocity,
            acceleration,
            quaternion,
            euler,
            rx_count: LittleEndian::read_u32(&buf[tail..]),
            tx_count: LittleEndian::read_u32(&buf[tail + 4..]),
            fsm: buf[tail + 8],
            sensor: buf[tail + 9],
            ejection: buf[tail + 10],
        }
    }
}

/// Roll, pitch and yaw (rad) of a W, X, Y, Z quaternion
///
/// Pitch is clamped to ±90° at the gimbal-lock singularity.
pub fn quaternion_to_euler(q: [f64; 4]) -> [f64; 3] {
    let [w, x, y, z] = q;

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));

    let sin_pitch = 2.0 * (w * y - z * x);
    let pitch = if sin_pitch.abs() >= 1.0 {
        std::f64::consts::FRAC_PI_2.copysign(sin_pitch)
    } else {
        sin_pitch.asin()
    };

    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    [roll, pitch, yaw]
}
