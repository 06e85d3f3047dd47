use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Globally unique identifier of a message, assigned by the sending transport.
///
/// The `transport_id` half identifies the sending transport instance (chosen at random on
///  startup), the `sequence` half is a counter within that instance. Received packets carry
///  the id so both peers can look up per-message state without any connection handshake.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageId {
    pub transport_id: u64,
    pub sequence: u64,
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.sequence)
    }
}

impl MessageId {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u64>();

    pub fn new(transport_id: u64, sequence: u64) -> MessageId {
        MessageId { transport_id, sequence }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.transport_id);
        buf.put_u64(self.sequence);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let transport_id = buf.try_get_u64()?;
        let sequence = buf.try_get_u64()?;
        Ok(MessageId { transport_id, sequence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 99)]
    #[case(u64::MAX, 1)]
    #[case(0x1234_5678_9abc_def0, u64::MAX)]
    fn test_ser_roundtrip(#[case] transport_id: u64, #[case] sequence: u64) {
        let original = MessageId::new(transport_id, sequence);

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), MessageId::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MessageId::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_ser_is_big_endian() {
        let mut buf = BytesMut::new();
        MessageId::new(0x0102_0304_0506_0708, 2).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn test_deser_incomplete() {
        let mut b: &[u8] = &[0, 0, 0];
        assert!(MessageId::deser(&mut b).is_err());
    }

    #[test]
    fn test_ordering_is_by_transport_then_sequence() {
        assert!(MessageId::new(1, 9) < MessageId::new(2, 0));
        assert!(MessageId::new(1, 1) < MessageId::new(1, 2));
    }
}
