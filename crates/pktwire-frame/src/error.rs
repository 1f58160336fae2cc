/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header carries a type tag this implementation does not know.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// A packet-header frame announced an unknown packet type.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// A frame body exceeds the 16-bit length field.
    #[error("frame body too large ({len} bytes, max {max})")]
    BodyTooLarge { len: usize, max: usize },

    /// A packet frame used the reserved identifier 0 or 255.
    #[error("invalid frame identifier {0}")]
    InvalidIdentifier(u8),

    /// Header extension bytes do not fit in a single header frame.
    #[error("header extension too large ({len} bytes, max {max})")]
    HeaderExtensionTooLarge { len: usize, max: usize },

    /// Packet length exceeds the 40-bit length field.
    #[error("packet too large ({len} bytes, max {max})")]
    PacketTooLarge { len: u64, max: u64 },

    /// A packet-header frame body is shorter than its fixed fields.
    #[error("malformed packet header ({len} bytes, need at least {min})")]
    MalformedHeader { len: usize, min: usize },

    /// An I/O error occurred while opening or moving packet data.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
