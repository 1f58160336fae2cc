//! Framed packet transport over non-blocking TCP.
//!
//! Packets (byte arrays, strings, files, live streams) are split into small
//! frames tagged with a one-byte identifier, so several packets can share one
//! socket. Sockets are driven by a readiness reactor; applications see
//! completion callbacks, never blocked threads.
//!
//! # Crate Structure
//!
//! - [`transport`]: transfer buffers, readiness multiplexers, socket adapter
//! - [`frame`]: wire format, packet types, frame state machines
//! - [`conn`]: connections, dispatch, scheduling (behind `conn` feature)

/// Re-export transport types.
pub mod transport {
    pub use pktwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pktwire_frame::*;
}

/// Re-export connection types (requires `conn` feature).
#[cfg(feature = "conn")]
pub mod conn {
    pub use pktwire_conn::*;
}

#[cfg(feature = "conn")]
pub use pktwire_conn::{
    connect, Connection, ConnectionConfig, ConnectionHandler, ConnectionListener, IoContext,
};
pub use pktwire_frame::{Entity, PacketId, PacketKind, ReceivedPacket, SendPacket};
