use std::fmt::{Display, Formatter};

/// Identifies a remote peer within one local endpoint. Ids are assigned by the transport when a
///  peer connects; they are small integers in `0..max_peer_count` and may be reused after a
///  peer disconnects.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PeerId(u16);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl PeerId {
    pub const fn from_raw(value: u16) -> PeerId {
        PeerId(value)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}
