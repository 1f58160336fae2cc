//! Frame wire format and per-frame state machines for pktwire.
//!
//! Every frame starts with a fixed 6-byte header:
//! - 2-byte big-endian body length (at most 65535)
//! - 1-byte frame type (packet header, entity, cancel, reject, heartbeat)
//! - 1-byte flags and 1-byte packet identifier
//! - 1 reserved byte
//!
//! A packet travels as one packet-header frame followed by entity frames
//! sharing its identifier. Frames of different packets may interleave.

pub mod codec;
pub mod error;
pub mod list;
pub mod packet;
pub mod receive;
pub mod send;

pub use codec::{
    FrameHeader, FrameType, PacketInfo, FLAG_NONE, HEADER_SIZE, MAX_BODY_LEN, MAX_HEADER_EXTENSION,
    MAX_IDENTIFIER, MAX_PACKET_LEN,
};
pub use error::{FrameError, Result};
pub use list::PriorityList;
pub use packet::{
    DirectSource, Entity, PacketId, PacketKind, PacketStream, ReceivePacket, ReceivedPacket, SendPacket,
};
pub use receive::ReceiveFrame;
pub use send::{Advance, SendFrame, StreamFault, PRIORITY_CONTROL, PRIORITY_DATA};
