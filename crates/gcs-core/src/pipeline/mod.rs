//! Parser / converter pipeline
//!
//! A [`Parser`] turns a byte stream into packets, a [`Converter`] turns
//! packets into [`Telemetry`]. Both report results through event buses so the
//! stages never call each other directly; the owner wires them together.
//!
//! Implementations are protocol specific. The crate ships one reference
//! protocol in [`envelope`].

pub mod envelope;
mod registry;

pub use registry::{PacketDecoder, PacketRegistry};

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::event::EventBus;
use crate::telemetry::Telemetry;

/// A validated protocol unit
pub trait Packet: Any + Send + Sync + fmt::Debug {
    /// Protocol-specific packet identifier
    fn id(&self) -> u8;

    /// Encode the packet payload (without framing)
    fn serialize(&self) -> Vec<u8>;

    /// Access to the concrete type for converters
    fn as_any(&self) -> &dyn Any;
}

/// Events raised by a [`Parser`]
#[derive(Debug, Default, Clone)]
pub struct ParserEvents {
    /// A complete frame was recognized
    pub packet_received: EventBus<Arc<dyn Packet>>,
    /// A frame failed its integrity check; carries the offending bytes
    pub validation_failed: EventBus<Vec<u8>>,
}

/// Events raised by a [`Converter`]
#[derive(Debug, Default, Clone)]
pub struct ConverterEvents {
    /// A packet was converted into telemetry
    pub telemetry: EventBus<Telemetry>,
}

/// Byte stream to packet stage
pub trait Parser: Send {
    /// Feed received bytes; complete frames are published as they appear
    fn push_data(&mut self, data: &[u8]);

    /// Drop any partially accumulated frame
    fn reset(&mut self);

    /// Event buses of this parser
    fn events(&self) -> &ParserEvents;
}

/// Packet to telemetry stage
pub trait Converter: Send {
    /// Convert a packet, publishing telemetry on success
    fn convert(&mut self, packet: &dyn Packet);

    /// Clear accumulated calibration / filter state
    fn reset(&mut self);

    /// Event buses of this converter
    fn events(&self) -> &ConverterEvents;
}
