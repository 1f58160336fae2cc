use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The readiness poller itself failed.
    #[error("poll failed: {0}")]
    Poll(std::io::Error),

    /// The socket was closed (EOF or local close).
    #[error("socket closed")]
    Closed,

    /// The multiplexer has been shut down.
    #[error("io provider shut down")]
    Shutdown,

    /// A readiness callback fired but there was no buffer to move.
    #[error("no transfer buffer provided")]
    EmptyBuffer,
}

pub type Result<T> = std::result::Result<T, TransportError>;
