use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use crate::peer_id::PeerId;

/// An outbound packet awaiting acknowledgement: the complete datagram (ack header plus payload)
///  and the sequence number it was stamped with.
///
/// A record has exactly one owner at any time - the in-flight window while the packet is
///  unacknowledged, then either nobody (it is dropped when the packet is confirmed) or the loss
///  handler (when the packet is considered lost).
#[derive(Eq, PartialEq)]
pub struct PacketRecord {
    pub sequence_id: u16,
    pub payload: Bytes,
}

impl PacketRecord {
    pub fn new(sequence_id: u16, payload: Bytes) -> PacketRecord {
        PacketRecord {
            sequence_id,
            payload,
        }
    }
}

impl Debug for PacketRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}:{}b}}", self.sequence_id, self.payload.len())
    }
}

/// A packet that was classified as lost, waiting for deferred delivery to the loss handler
#[derive(Debug)]
pub struct LostPacket {
    pub peer_id: PeerId,
    pub record: PacketRecord,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug() {
        let record = PacketRecord::new(5, Bytes::from_static(b"abc"));
        assert_eq!(format!("{:?}", record), "PCKT{5:3b}");
    }
}
