use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::message_id::MessageId;

/// Packet type, transmitted as the second byte of every packet.
///
/// `Data` carries message payload from sender to receiver, everything else is a control
///  packet. `Grant`, `Resend`, `Done`, `Unknown` and `Error` flow from receiver to sender;
///  `Busy` and `Ping` can flow in either direction (see dispatch in the transport).
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Data = 0,
    Grant = 1,
    Done = 2,
    Resend = 3,
    Busy = 4,
    Ping = 5,
    Unknown = 6,
    Error = 7,
}

/// The common prefix shared by all packets: protocol version and opcode, each one byte,
///  followed by the opcode-specific header record. All multi-byte integers on the wire are
///  big-endian.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub opcode: Opcode,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    pub const SERIALIZED_LEN: usize = 2;

    pub fn new(opcode: Opcode) -> PacketHeader {
        PacketHeader { opcode }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.opcode.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }
        let opcode = Opcode::try_from(buf.try_get_u8()?)?;
        Ok(PacketHeader { opcode })
    }
}

/// Header record of a DATA packet, everything after the two-byte packet prefix. The payload
///  fragment follows immediately after the header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    pub id: MessageId,
    /// length of the complete message this packet is a fragment of
    pub total_length: u32,
    /// offset of this packet's payload within the message - always a multiple of the
    ///  per-packet payload capacity, so the receiver can derive the packet index from it
    pub offset: u32,
    /// the number of bytes the sender may transmit without a grant; the receiver adopts this
    ///  as the initial granted range when it first learns about the message
    pub unscheduled: u32,
    pub priority: u8,
    pub flags: u8,
}

impl DataHeader {
    /// receiver should not send a DONE acknowledgement for this message
    pub const FLAG_NO_ACK: u8 = 1 << 0;

    /// full length including the packet prefix
    pub const SERIALIZED_LEN: usize =
        PacketHeader::SERIALIZED_LEN + MessageId::SERIALIZED_LEN + 3 * size_of::<u32>() + 2;

    /// byte offset of the priority field from the start of the packet, for in-place patching
    const PRIORITY_OFFSET: usize =
        PacketHeader::SERIALIZED_LEN + MessageId::SERIALIZED_LEN + 3 * size_of::<u32>();

    /// Serializes the full packet header including the two-byte prefix.
    pub fn ser(&self, buf: &mut BytesMut) {
        PacketHeader::new(Opcode::Data).ser(buf);
        self.id.ser(buf);
        buf.put_u32(self.total_length);
        buf.put_u32(self.offset);
        buf.put_u32(self.unscheduled);
        buf.put_u8(self.priority);
        buf.put_u8(self.flags);
    }

    /// Deserializes the opcode-specific part, i.e. the packet prefix must already be consumed.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataHeader> {
        let id = MessageId::deser(buf)?;
        let total_length = buf.try_get_u32()?;
        let offset = buf.try_get_u32()?;
        let unscheduled = buf.try_get_u32()?;
        let priority = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        Ok(DataHeader { id, total_length, offset, unscheduled, priority, flags })
    }

    /// Patches the priority field of an already serialized DATA packet in place. Retransmitted
    ///  packets are sent at the priority the receiver requested, which is only known at
    ///  emission time.
    pub fn patch_priority(packet_buf: &mut BytesMut, priority: u8) {
        (&mut packet_buf[Self::PRIORITY_OFFSET..]).put_u8(priority);
    }
}
