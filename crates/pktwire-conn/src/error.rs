/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pktwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] pktwire_frame::FrameError),

    /// The I/O context was closed or never started.
    #[error("io context is closed")]
    ContextClosed,

    /// The connection is closed.
    #[error("connection closed: {0}")]
    Closed(String),

    /// I/O error outside the socket path (threads, files).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnError>;
