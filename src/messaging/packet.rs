use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::member_id::{MemberId, MessageId};
use crate::util::buf::{put_len_prefixed, try_get_len_prefixed};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("buffer underflow - packet is truncated")]
    Truncated,
    #[error("not a groups packet: magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("group name is not valid UTF-8")]
    InvalidGroupName,
    #[error("sequence number {sequence} is out of range for a message of {total_count} packets")]
    SequenceOutOfRange { sequence: u32, total_count: u32 },
    #[error("checksum mismatch: packet says {expected:#010x}, actual {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("{0} unexpected bytes after the payload")]
    TrailingBytes(usize),
}

impl From<bytes::TryGetError> for DecodeError {
    fn from(_: bytes::TryGetError) -> Self {
        DecodeError::Truncated
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
    MemberAnnounce = 2,
    MemberLeaving = 3,
}

impl PacketKind {
    /// DATA and ACK refer to a specific packet of a message
    pub fn is_sequenced(&self) -> bool {
        matches!(self, PacketKind::Data | PacketKind::Ack)
    }
}

/// This is the unit of data on the wire, i.e. the payload of a single UDP datagram.
///
/// Layout - all numbers in network byte order (BE):
/// ```ascii
///  0: magic (u16) 0x4750 ("GP")
///  2: protocol version (u8)
///  3: packet kind (u8)
///  4: group name (varint length + UTF-8)
///  *: sender member id (u128)
///  *: message id (u128), nil for control packets
///  *: sequence number (u32), 0-based
///  *: total number of packets of the message (u32)
///  *: payload (varint length + bytes)
///  *: CRC-32 (iSCSI) of everything before it (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessagePacket {
    pub kind: PacketKind,
    pub group_name: String,
    pub sender: MemberId,
    pub message_id: MessageId,
    pub sequence: u32,
    pub total_count: u32,
    pub payload: Bytes,
}

impl MessagePacket {
    pub const MAGIC: u16 = 0x4750;
    pub const PROTOCOL_VERSION_1: u8 = 1;

    /// magic, version, kind, empty group name, ids, sequence, count, empty payload, checksum
    const MIN_ENCODED_LEN: usize = 2 + 1 + 1 + 1 + 16 + 16 + 4 + 4 + 1 + 4;

    pub fn data(group_name: &str, sender: MemberId, message_id: MessageId, sequence: u32, total_count: u32, chunk: Bytes) -> MessagePacket {
        MessagePacket {
            kind: PacketKind::Data,
            group_name: group_name.to_string(),
            sender,
            message_id,
            sequence,
            total_count,
            payload: chunk,
        }
    }

    /// the acknowledgement for a DATA packet, sent by `sender`
    pub fn ack_for(data: &MessagePacket, sender: MemberId) -> MessagePacket {
        MessagePacket {
            kind: PacketKind::Ack,
            group_name: data.group_name.clone(),
            sender,
            message_id: data.message_id,
            sequence: data.sequence,
            total_count: data.total_count,
            payload: Bytes::new(),
        }
    }

    pub fn announce(group_name: &str, sender: MemberId, data: &AnnounceData) -> MessagePacket {
        let mut payload = BytesMut::with_capacity(AnnounceData::SERIALIZED_LEN);
        data.ser(&mut payload);
        Self::control(PacketKind::MemberAnnounce, group_name, sender, payload.freeze())
    }

    pub fn leaving(group_name: &str, sender: MemberId) -> MessagePacket {
        Self::control(PacketKind::MemberLeaving, group_name, sender, Bytes::new())
    }

    fn control(kind: PacketKind, group_name: &str, sender: MemberId, payload: Bytes) -> MessagePacket {
        MessagePacket {
            kind,
            group_name: group_name.to_string(),
            sender,
            message_id: MessageId::NIL,
            sequence: 0,
            total_count: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_ENCODED_LEN + self.group_name.len() + self.payload.len() + 8);
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u16(Self::MAGIC);
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.kind.into());
        put_len_prefixed(buf, self.group_name.as_bytes());
        buf.put_u128(self.sender.as_u128());
        buf.put_u128(self.message_id.as_u128());
        buf.put_u32(self.sequence);
        buf.put_u32(self.total_count);
        put_len_prefixed(buf, &self.payload);

        let checksum = CHECKSUM.checksum(&buf[start..]);
        buf.put_u32(checksum);
    }

    pub fn decode(raw: &[u8]) -> Result<MessagePacket, DecodeError> {
        if raw.len() < Self::MIN_ENCODED_LEN {
            return Err(DecodeError::Truncated);
        }

        let mut buf = raw;
        let magic = buf.try_get_u16()?;
        if magic != Self::MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let (checked, mut checksum_buf) = raw.split_at(raw.len() - size_of::<u32>());
        let expected = checksum_buf.try_get_u32()?;
        let actual = CHECKSUM.checksum(checked);
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        let mut buf = &checked[3..];
        let raw_kind = buf.try_get_u8()?;
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| DecodeError::InvalidPacketType(raw_kind))?;

        let group_name = try_get_len_prefixed(&mut buf)
            .map_err(|_| DecodeError::Truncated)?;
        let group_name = String::from_utf8(group_name.to_vec())
            .map_err(|_| DecodeError::InvalidGroupName)?;

        let sender = MemberId::from_u128(buf.try_get_u128()?);
        let message_id = MessageId::from_u128(buf.try_get_u128()?);
        let sequence = buf.try_get_u32()?;
        let total_count = buf.try_get_u32()?;
        let payload = try_get_len_prefixed(&mut buf)
            .map_err(|_| DecodeError::Truncated)?;

        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }

        if kind.is_sequenced() && sequence >= total_count {
            return Err(DecodeError::SequenceOutOfRange { sequence, total_count });
        }

        Ok(MessagePacket {
            kind,
            group_name,
            sender,
            message_id,
            sequence,
            total_count,
            payload,
        })
    }

    /// the announce data of a MEMBER_ANNOUNCE packet
    pub fn announce_data(&self) -> Result<AnnounceData, DecodeError> {
        let mut buf = self.payload.as_ref();
        let data = AnnounceData::deser(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(data)
    }
}

/// This is the payload of a MEMBER_ANNOUNCE packet
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AnnounceData {
    /// the announcing member's wall clock time when the packet was created, in millis since epoch
    pub timestamp_millis: i64,
    /// incremented with every announce sent by a member
    pub counter: u64,
}

impl AnnounceData {
    pub const SERIALIZED_LEN: usize = 16;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.timestamp_millis);
        buf.put_u64(self.counter);
    }

    fn deser(buf: &mut impl Buf) -> Result<AnnounceData, DecodeError> {
        let timestamp_millis = buf.try_get_i64()?;
        let counter = buf.try_get_u64()?;
        Ok(AnnounceData {
            timestamp_millis,
            counter,
        })
    }
}
