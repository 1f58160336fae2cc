use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::packet::PacketKind;

/// Frame header: body length (2) + type (1) + flags (1) + identifier (1) +
/// reserved (1) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Largest body a single frame can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Largest packet length the 40-bit length field can announce. Direct
/// streams announce this value since their length is unknown.
pub const MAX_PACKET_LEN: u64 = (1 << 40) - 1;

/// Fixed part of a packet-header frame body: length (5) + packet type (1).
pub const PACKET_HEADER_MIN_LEN: usize = 6;

/// Largest header extension that fits in one packet-header frame.
pub const MAX_HEADER_EXTENSION: usize = MAX_BODY_LEN - PACKET_HEADER_MIN_LEN;

/// No flags set. No flags are currently defined.
pub const FLAG_NONE: u8 = 0;

/// Identifiers cycle through `1..=MAX_IDENTIFIER`; 0 marks frames that
/// belong to no packet.
pub const MAX_IDENTIFIER: u8 = 254;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    PacketHeader = 11,
    PacketEntity = 12,
    Cancel = 41,
    ReceiveReject = 42,
    Heartbeat = 81,
}

impl FrameType {
    /// Whether frames of this type must carry a packet identifier.
    pub fn is_packet_frame(self) -> bool {
        !matches!(self, FrameType::Heartbeat)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            11 => Ok(FrameType::PacketHeader),
            12 => Ok(FrameType::PacketEntity),
            41 => Ok(FrameType::Cancel),
            42 => Ok(FrameType::ReceiveReject),
            81 => Ok(FrameType::Heartbeat),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// The fixed 6-byte header in front of every frame.
///
/// Wire format (big-endian):
/// ```text
/// ┌───────────────┬──────────┬──────────┬──────────────┬──────────┐
/// │ Body len (2B) │ Type (1) │ Flags (1)│ Identifier(1)│ Rsvd (1) │
/// └───────────────┴──────────┴──────────┴──────────────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u16,
    pub frame_type: FrameType,
    pub flags: u8,
    pub identifier: u8,
}

impl FrameHeader {
    pub fn new(body_len: usize, frame_type: FrameType, identifier: u8) -> Result<Self> {
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self {
            body_len: body_len as u16,
            frame_type,
            flags: FLAG_NONE,
            identifier,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let len = self.body_len.to_be_bytes();
        [
            len[0],
            len[1],
            self.frame_type as u8,
            self.flags,
            self.identifier,
            0,
        ]
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Decode a complete header. Unknown type tags are a protocol violation.
    pub fn decode(src: &[u8; HEADER_SIZE]) -> Result<Self> {
        let body_len = u16::from_be_bytes([src[0], src[1]]);
        let frame_type = FrameType::try_from(src[2])?;
        let identifier = src[4];
        if frame_type.is_packet_frame() && !(1..=MAX_IDENTIFIER).contains(&identifier) {
            return Err(FrameError::InvalidIdentifier(identifier));
        }
        Ok(Self {
            body_len,
            frame_type,
            flags: src[3],
            identifier,
        })
    }
}

/// Contents of a packet-header frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub length: u64,
    pub kind: PacketKind,
    pub header_info: Option<Vec<u8>>,
}

impl PacketInfo {
    pub fn body_len(&self) -> usize {
        PACKET_HEADER_MIN_LEN + self.header_info.as_ref().map_or(0, Vec::len)
    }

    /// Encode `[length: 40 bits][type][extension...]`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.length > MAX_PACKET_LEN {
            return Err(FrameError::PacketTooLarge {
                len: self.length,
                max: MAX_PACKET_LEN,
            });
        }
        let extension = self.header_info.as_deref().unwrap_or_default();
        if extension.len() > MAX_HEADER_EXTENSION {
            return Err(FrameError::HeaderExtensionTooLarge {
                len: extension.len(),
                max: MAX_HEADER_EXTENSION,
            });
        }
        dst.reserve(self.body_len());
        dst.put_uint(self.length, 5);
        dst.put_u8(self.kind as u8);
        dst.put_slice(extension);
        Ok(())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < PACKET_HEADER_MIN_LEN {
            return Err(FrameError::MalformedHeader {
                len: src.len(),
                min: PACKET_HEADER_MIN_LEN,
            });
        }
        let length = src.get_uint(5);
        let kind = PacketKind::try_from(src.get_u8())?;
        let header_info = (!src.is_empty()).then(|| src.to_vec());
        Ok(Self {
            length,
            kind,
            header_info,
        })
    }
}
