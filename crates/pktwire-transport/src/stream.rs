use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;

use crate::error::Result;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// A non-blocking connected socket registered with an [`IoProvider`].
///
/// Each source carries a process-unique id used as its poll token, so a
/// recycled descriptor can never be confused with an earlier registration.
///
/// Reads and writes go through `&IoSource`, letting the input and output
/// halves of a connection drive the same socket from different threads.
///
/// [`IoProvider`]: crate::traits::IoProvider
pub struct IoSource {
    id: u64,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl IoSource {
    /// Wrap a connected std socket, switching it to non-blocking mode.
    pub fn new(stream: std::net::TcpStream) -> Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Ok(Arc::new(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            stream: TcpStream::from_std(stream),
            peer_addr,
            local_addr,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Shut down both directions; errors on an already-dead socket are ignored.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for &IoSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for &IoSource {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

impl std::fmt::Debug for IoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSource")
            .field("id", &self.id)
            .field("fd", &self.raw_fd())
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::buffer::{Transfer, TransferBuffer};

    fn pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn sources_have_distinct_ids_and_addresses() {
        let (client, server) = pair();
        let a = IoSource::new(client).unwrap();
        let b = IoSource::new(server).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.peer_addr(), b.local_addr());
    }

    #[test]
    fn empty_socket_would_block_instead_of_eof() {
        let (client, _server) = pair();
        let source = IoSource::new(client).unwrap();
        let mut buf = TransferBuffer::new(16);
        buf.start_writing();
        let mut io = &*source;
        assert_eq!(buf.read_from_socket(&mut io).unwrap(), Transfer::WouldBlock);
    }

    #[test]
    fn peer_shutdown_reads_as_eof() {
        let (client, server) = pair();
        let source = IoSource::new(client).unwrap();
        drop(server);
        let mut buf = TransferBuffer::new(16);
        buf.start_writing();
        let mut io = &*source;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match buf.read_from_socket(&mut io).unwrap() {
                Transfer::Eof => break,
                Transfer::WouldBlock if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                other => panic!("expected eof, got {other:?}"),
            }
        }
    }
}
