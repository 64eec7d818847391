use std::fmt;

use bytes::Bytes;

use crate::error::FrameError;

/// Largest L2CAP SDU the receive path sizes buffers for.
pub const MAX_L2CAP_SDU: usize = 895;

/// ACL data header: handle/flags (2) + data length (2).
pub const ACL_HEADER_SIZE: usize = 4;

/// Basic L2CAP header: length (2) + channel id (2).
pub const L2CAP_HEADER_SIZE: usize = 4;

/// HCI packet types as carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Command = 0x01,
    Acl = 0x02,
    Sco = 0x03,
    Event = 0x04,
    Iso = 0x05,
}

impl PacketType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Command => "CMD",
            Self::Acl => "ACL",
            Self::Sco => "SCO",
            Self::Event => "EVT",
            Self::Iso => "ISO",
        }
    }

    /// Size of the inner HCI header that carries the packet length.
    pub const fn inner_header_len(self) -> usize {
        match self {
            Self::Command => 3,
            Self::Acl => ACL_HEADER_SIZE,
            Self::Sco => 3,
            Self::Event => 2,
            Self::Iso => 4,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::Acl),
            0x03 => Ok(Self::Sco),
            0x04 => Ok(Self::Event),
            0x05 => Ok(Self::Iso),
            other => Err(FrameError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A complete HCI packet, inner header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket {
    pub packet_type: PacketType,
    pub data: Bytes,
}

impl HciPacket {
    pub fn new(packet_type: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Event code for event packets.
    pub fn event_code(&self) -> Option<u8> {
        match self.packet_type {
            PacketType::Event => self.data.first().copied(),
            _ => None,
        }
    }
}

/// What the receive path asks the host to allocate for an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub packet_type: PacketType,
    /// Event code, for event packets.
    pub event_code: Option<u8>,
    /// Bytes the buffer should hold. May exceed `packet_len` for ACL start
    /// fragments, which are sized for the whole L2CAP SDU.
    pub size: usize,
    /// Bytes this packet will actually deliver.
    pub packet_len: usize,
}

/// Flags nibble of a first, automatically flushable, point-to-point ACL
/// fragment.
pub const ACL_FLAG_START: u16 = 0b0010;

/// True if the ACL handle/flags word marks the first fragment of an SDU.
///
/// The whole flags nibble is compared, so a non-flushable start (`0b00`)
/// or a broadcast fragment is sized by its HCI length alone.
pub fn acl_is_start(handle_flags: u16) -> bool {
    (handle_flags >> 12) & 0xF == ACL_FLAG_START
}

/// Bytes of body needed before a buffer can be sized.
///
/// `prefix` is what has been staged so far; ACL start fragments need two
/// extra bytes for the L2CAP length once the handle is known.
pub(crate) fn sizing_prefix_len(packet_type: PacketType, prefix: &[u8]) -> usize {
    match packet_type {
        PacketType::Acl if prefix.len() >= 2 => {
            let handle = u16::from_le_bytes([prefix[0], prefix[1]]);
            if acl_is_start(handle) {
                ACL_HEADER_SIZE + 2
            } else {
                ACL_HEADER_SIZE
            }
        }
        other => other.inner_header_len(),
    }
}

/// Size the receive buffer from the staged inner header.
///
/// Returns `None` if `prefix` is too short to hold the inner header.
pub(crate) fn size_packet(packet_type: PacketType, prefix: &[u8]) -> Option<BufferRequest> {
    if prefix.len() < packet_type.inner_header_len() {
        return None;
    }

    let mut event_code = None;
    let packet_len = match packet_type {
        PacketType::Acl => usize::from(u16::from_le_bytes([prefix[2], prefix[3]])) + 4,
        PacketType::Sco => usize::from(prefix[2]) + 3,
        PacketType::Event => {
            event_code = Some(prefix[0]);
            usize::from(prefix[1]) + 2
        }
        PacketType::Iso => usize::from(u16::from_le_bytes([prefix[2], prefix[3]]) & 0x3fff) + 4,
        PacketType::Command => usize::from(prefix[2]) + 3,
    };

    let size = match packet_type {
        PacketType::Acl => acl_buffer_size(prefix, packet_len),
        _ => packet_len,
    };

    Some(BufferRequest {
        packet_type,
        event_code,
        size,
        packet_len,
    })
}

/// Length of the HCI packet at the start of `data`, from its inner header.
///
/// Used to strip frame padding when the packet type is not one the receive
/// path sizes, such as commands seen on the controller side.
pub fn packet_len(packet_type: PacketType, data: &[u8]) -> Option<usize> {
    size_packet(packet_type, data).map(|req| req.packet_len)
}

fn acl_buffer_size(prefix: &[u8], packet_len: usize) -> usize {
    let handle = u16::from_le_bytes([prefix[0], prefix[1]]);
    if !acl_is_start(handle) {
        return packet_len;
    }

    if prefix.len() < ACL_HEADER_SIZE + 2 {
        // Start fragment too short to carry the L2CAP length.
        return MAX_L2CAP_SDU + ACL_HEADER_SIZE + L2CAP_HEADER_SIZE;
    }

    let l2cap_len = usize::from(u16::from_le_bytes([prefix[4], prefix[5]]));
    let need = l2cap_len + ACL_HEADER_SIZE + L2CAP_HEADER_SIZE;
    if l2cap_len > MAX_L2CAP_SDU || packet_len > need {
        tracing::warn!(
            l2cap_len,
            packet_len,
            header = %hex::encode(&prefix[..ACL_HEADER_SIZE + 2]),
            "suspicious L2CAP length in ACL start fragment"
        );
    }
    need.max(packet_len)
}
