use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut};

/// The acknowledgement header that prefixes every protocol-bearing datagram. All numbers are in
///  network byte order (BE):
///
/// ```ascii
/// 0: sent id (u16) - the sender's sequence number for this packet
/// 2: received id (u16) - the highest sequence number the sender has received from the receiver
/// 4: bitmask (u32) - bit k (1-based, LSB = bit 1) set if packet 'received id - k' was received
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct AckHeader {
    pub sent_id: u16,
    pub received_id: u16,
    pub bitmask: u32,
}

impl Debug for AckHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ACK{{{}:{}:{:032b}}}", self.sent_id, self.received_id, self.bitmask)
    }
}

impl AckHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<u16>() + size_of::<u32>();

    pub fn new(sent_id: u16, received_id: u16, bitmask: u32) -> AckHeader {
        AckHeader {
            sent_id,
            received_id,
            bitmask,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.sent_id);
        buf.put_u16(self.received_id);
        buf.put_u32(self.bitmask);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(anyhow::anyhow!("incomplete ack header: {} of {} bytes", buf.remaining(), Self::SERIALIZED_LEN));
        }

        Ok(AckHeader {
            sent_id: buf.get_u16(),
            received_id: buf.get_u16(),
            bitmask: buf.get_u32(),
        })
    }

    /// Advances the buffer past a header without interpreting it, e.g. for reading the payload of
    ///  a packet that was sent earlier
    pub fn skip(buf: &mut impl Buf) -> anyhow::Result<()> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(anyhow::anyhow!("incomplete ack header: {} of {} bytes", buf.remaining(), Self::SERIALIZED_LEN));
        }
        buf.advance(Self::SERIALIZED_LEN);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(AckHeader::new(0, 0, 0))]
    #[case::regular(AckHeader::new(17, 12, 0b1011))]
    #[case::max(AckHeader::new(u16::MAX, u16::MAX, u32::MAX))]
    #[case::wrapped(AckHeader::new(3, 65534, 0x8000_0001))]
    fn test_ser_deser(#[case] header: AckHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), AckHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = AckHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        AckHeader::new(0x0102, 0x0304, 0x0506_0708).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_deser_leaves_payload() {
        let mut buf = BytesMut::new();
        AckHeader::new(1, 2, 3).ser(&mut buf);
        buf.put_u32(99);

        let mut b: &[u8] = &buf;
        AckHeader::deser(&mut b).unwrap();
        assert_eq!(b.get_u32(), 99);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![1])]
    #[case::seven_bytes(vec![1, 2, 3, 4, 5, 6, 7])]
    fn test_deser_incomplete(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(AckHeader::deser(&mut b).is_err());
        assert!(AckHeader::skip(&mut b).is_err());
        assert_eq!(b.len(), raw.len());
    }

    #[test]
    fn test_skip() {
        let mut buf = BytesMut::new();
        AckHeader::new(1, 2, 3).ser(&mut buf);
        buf.put_u16(4711);

        let mut b: &[u8] = &buf;
        AckHeader::skip(&mut b).unwrap();
        assert_eq!(b.get_u16(), 4711);
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", AckHeader::new(5, 4, 0b101)), "ACK{5:4:00000000000000000000000000000101}");
    }
}
