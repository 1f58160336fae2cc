//! Non-blocking socket plumbing for pktwire.
//!
//! - [`TransferBuffer`]: fixed-capacity buffer with explicit fill/drain phases
//! - [`SelectorProvider`] and [`StealingProvider`]: readiness multiplexers
//!   behind the [`IoProvider`] trait
//! - [`SocketAdapter`]: moves buffers between a connected socket and the
//!   layer above through [`BufferProcessor`]
//!
//! This is the lowest layer of pktwire. Framing lives in `pktwire-frame`.

pub mod adapter;
pub mod buffer;
pub mod error;
mod interest;
pub mod selector;
pub mod stealing;
pub mod stream;
pub mod tcp;
pub mod traits;

pub use adapter::{now_millis, BufferProcessor, SocketAdapter};
pub use buffer::{Transfer, TransferBuffer, DEFAULT_BUFFER_SIZE};
pub use error::{Result, TransportError};
pub use selector::{SelectorConfig, SelectorProvider};
pub use stealing::{StealingConfig, StealingProvider};
pub use stream::IoSource;
pub use tcp::TcpAcceptor;
pub use traits::{IoEvent, IoProvider, IoTask, Readiness};
