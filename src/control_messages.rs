use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::message_id::MessageId;
use crate::packet_header::{Opcode, PacketHeader};

/// Receiver-issued authorization for the sender to transmit message bytes up to `offset`,
///  using `priority` for the scheduled packets it authorizes.
///
/// Grants are idempotent: a duplicate or stale grant (offset at or below what the sender
///  already holds) is a no-op on the sender side.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlMessageGrant {
    pub id: MessageId,
    pub offset: u32,
    pub priority: u8,
}

impl ControlMessageGrant {
    pub fn ser(&self, buf: &mut BytesMut) {
        PacketHeader::new(Opcode::Grant).ser(buf);
        self.id.ser(buf);
        buf.put_u32(self.offset);
        buf.put_u8(self.priority);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageGrant> {
        let id = MessageId::deser(buf)?;
        let offset = buf.try_get_u32()?;
        let priority = buf.try_get_u8()?;
        Ok(ControlMessageGrant { id, offset, priority })
    }
}

/// Receiver-issued request to retransmit the byte range `[offset, offset+length)` at the
///  given priority, sent when its resend timer finds a gap below the granted range.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlMessageResend {
    pub id: MessageId,
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

impl ControlMessageResend {
    pub fn ser(&self, buf: &mut BytesMut) {
        PacketHeader::new(Opcode::Resend).ser(buf);
        self.id.ser(buf);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u8(self.priority);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageResend> {
        let id = MessageId::deser(buf)?;
        let offset = buf.try_get_u32()?;
        let length = buf.try_get_u32()?;
        let priority = buf.try_get_u8()?;
        Ok(ControlMessageResend { id, offset, length, priority })
    }
}

/// The remaining control packets (DONE, BUSY, PING, UNKNOWN, ERROR) carry nothing but the
///  message id they refer to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlMessageIdOnly {
    pub id: MessageId,
}

impl ControlMessageIdOnly {
    pub fn ser(&self, opcode: Opcode, buf: &mut BytesMut) {
        PacketHeader::new(opcode).ser(buf);
        self.id.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageIdOnly> {
        let id = MessageId::deser(buf)?;
        Ok(ControlMessageIdOnly { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1440, 3)]
    #[case(u32::MAX, 7)]
    fn test_grant_roundtrip(#[case] offset: u32, #[case] priority: u8) {
        let original = ControlMessageGrant { id: MessageId::new(8, 15), offset, priority };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut b).unwrap().opcode, Opcode::Grant);
        let deser = ControlMessageGrant::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_grant_golden_bytes() {
        let mut buf = BytesMut::new();
        ControlMessageGrant { id: MessageId::new(1, 2), offset: 0x0a0b_0c0d, priority: 3 }
            .ser(&mut buf);

        assert_eq!(
            buf.as_ref(),
            &[
                1, 1, // version, opcode
                0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, // id
                0x0a, 0x0b, 0x0c, 0x0d, // offset
                3, // priority
            ]
        );
    }

    #[rstest]
    #[case(0, 1440, 7)]
    #[case(2880, 1440, 0)]
    #[case(100, u32::MAX, 5)]
    fn test_resend_roundtrip(#[case] offset: u32, #[case] length: u32, #[case] priority: u8) {
        let original =
            ControlMessageResend { id: MessageId::new(3, 77), offset, length, priority };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut b).unwrap().opcode, Opcode::Resend);
        let deser = ControlMessageResend::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::done(Opcode::Done)]
    #[case::busy(Opcode::Busy)]
    #[case::ping(Opcode::Ping)]
    #[case::unknown(Opcode::Unknown)]
    #[case::error(Opcode::Error)]
    fn test_id_only_roundtrip(#[case] opcode: Opcode) {
        let original = ControlMessageIdOnly { id: MessageId::new(42, 43) };

        let mut buf = BytesMut::new();
        original.ser(opcode, &mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN + MessageId::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut b).unwrap().opcode, opcode);
        let deser = ControlMessageIdOnly::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_truncated() {
        let mut b: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        assert!(ControlMessageGrant::deser(&mut b).is_err());
        let mut b: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        assert!(ControlMessageResend::deser(&mut b).is_err());
        let mut b: &[u8] = &[0, 0];
        assert!(ControlMessageIdOnly::deser(&mut b).is_err());
    }
}
