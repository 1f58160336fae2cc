//! Packet connections over framed TCP.
//!
//! This is the layer applications use. Start an [`IoContext`], set up a
//! [`Connection`] per socket with a [`ConnectionHandler`], then send packets
//! and receive them through callbacks.

pub mod connection;
pub mod connector;
pub mod context;
mod dispatch;
pub mod error;
pub mod listener;
pub mod reader;
pub mod schedule;
pub mod writer;

pub use connection::{Connection, ConnectionConfig, ConnectionHandler, ConnectionId};
pub use connector::{connect, connect_with_timeout};
pub use context::{IoContext, IoContextBuilder};
pub use error::{ConnError, Result};
pub use listener::ConnectionListener;
pub use reader::{PacketReader, PacketSource};
pub use schedule::{IdleTimeoutJob, ScheduleHandle, ScheduleJob, Scheduler, SchedulerConfig};
pub use writer::{PacketWriter, ReceivePacketProvider};
