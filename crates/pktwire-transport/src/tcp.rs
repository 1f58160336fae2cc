use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Blocking TCP listener handing out connected sockets.
///
/// Accepted sockets are still blocking; wrapping them in an
/// [`IoSource`](crate::stream::IoSource) switches them to non-blocking mode.
pub struct TcpAcceptor {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind { addr, source: e })?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::Bind { addr, source: e })?;
        info!(%addr, "listening on tcp socket");
        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// The bound address (with the resolved port).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Connect to a listening TCP socket (blocking).
pub fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    connect_with_timeout(addr, None)
}

/// Connect, trying each resolved address in turn.
pub fn connect_with_timeout(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                debug!(%addr, "connected to tcp socket");
                return Ok(stream);
            }
            Err(source) => last = Some(TransportError::Connect { addr, source }),
        }
    }
    Err(last.unwrap_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address resolved to nothing",
        ))
    }))
}
