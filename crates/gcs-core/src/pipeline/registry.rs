//! Packet registry
//!
//! Maps packet ids to payload decoders. The application builds one registry
//! at startup and hands it to the parsers that need it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::Packet;
use crate::error::FrameError;

/// Decodes a frame payload into a packet
pub type PacketDecoder = fn(&[u8]) -> Result<Arc<dyn Packet>, FrameError>;

/// Explicit id → decoder table
#[derive(Default, Clone)]
pub struct PacketRegistry {
    decoders: HashMap<u8, PacketDecoder>,
}

impl PacketRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder, replacing any previous one for `id`
    pub fn register(&mut self, id: u8, decoder: PacketDecoder) -> &mut Self {
        self.decoders.insert(id, decoder);
        self
    }

    /// Whether `id` has a decoder
    pub fn contains(&self, id: u8) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Decode `payload` with the decoder registered for `id`
    pub fn decode(&self, id: u8, payload: &[u8]) -> Result<Arc<dyn Packet>, FrameError> {
        let decoder = self
            .decoders
            .get(&id)
            .ok_or(FrameError::UnknownPacket(id))?;
        decoder(payload)
    }

    /// Number of registered packet kinds
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("PacketRegistry").field("ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug)]
    struct Ping(u8);

    impl Packet for Ping {
        fn id(&self) -> u8 {
            0x7F
        }

        fn serialize(&self) -> Vec<u8> {
            vec![self.0]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn decode_ping(payload: &[u8]) -> Result<Arc<dyn Packet>, FrameError> {
        match payload {
            [value] => Ok(Arc::new(Ping(*value))),
            _ => Err(FrameError::Truncated {
                expected: 1,
                actual: payload.len(),
            }),
        }
    }

    #[test]
    fn test_register_and_decode() {
        let mut registry = PacketRegistry::new();
        assert!(registry.is_empty());
        registry.register(0x7F, decode_ping);

        assert!(registry.contains(0x7F));
        let packet = registry.decode(0x7F, &[9]).unwrap();
        assert_eq!(packet.id(), 0x7F);
        assert_eq!(packet.serialize(), vec![9]);
    }

    #[test]
    fn test_unknown_id() {
        let registry = PacketRegistry::new();
        assert_eq!(
            registry.decode(0x10, &[]).unwrap_err(),
            FrameError::UnknownPacket(0x10)
        );
    }

    #[test]
    fn test_decoder_error_propagates() {
        let mut registry = PacketRegistry::new();
        registry.register(0x7F, decode_ping);
        assert!(matches!(
            registry.decode(0x7F, &[1, 2]),
            Err(FrameError::Truncated { expected: 1, actual: 2 })
        ));
    }
}
