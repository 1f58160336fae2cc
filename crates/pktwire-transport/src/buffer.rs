use std::io::{self, ErrorKind, Read, Write};

/// Default transfer buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Outcome of a single non-blocking socket transfer.
///
/// `WouldBlock` means no bytes could move right now and the caller should wait
/// for the next readiness signal; it is never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes were moved (possibly fewer than requested).
    Progress(usize),
    /// Nothing moved; retry on the next readiness event.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

impl Transfer {
    /// Number of bytes moved by this transfer.
    pub fn bytes(&self) -> usize {
        match self {
            Transfer::Progress(n) => *n,
            Transfer::WouldBlock | Transfer::Eof => 0,
        }
    }
}

/// Fixed-capacity byte container moved between sockets, packet streams and
/// frame state machines.
///
/// A buffer is either being *written* (filled, between [`start_writing`] and
/// [`finish_writing`]) or *read* (drained, after [`finish_writing`]). The
/// configured [`limit`] bounds how many bytes the next fill may accept.
///
/// [`start_writing`]: TransferBuffer::start_writing
/// [`finish_writing`]: TransferBuffer::finish_writing
/// [`limit`]: TransferBuffer::limit
pub struct TransferBuffer {
    data: Box<[u8]>,
    position: usize,
    end: usize,
    limit: usize,
    consume_remaining: bool,
}

impl TransferBuffer {
    /// Create a buffer that must be completely filled/drained per transfer.
    pub fn new(capacity: usize) -> Self {
        Self::with_mode(capacity, true)
    }

    /// Create a buffer with explicit completion mode.
    ///
    /// With `consume_remaining == false` a socket transfer that moved any
    /// bytes counts as complete even if space remains.
    pub fn with_mode(capacity: usize, consume_remaining: bool) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            end: capacity,
            limit: capacity,
            consume_remaining,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bound the next fill to at most `limit` bytes (clamped to capacity).
    pub fn limit(&mut self, limit: usize) {
        self.limit = limit.min(self.data.len());
    }

    /// The currently configured fill bound.
    pub fn current_limit(&self) -> usize {
        self.limit
    }

    /// Enter the writing phase: clear and open `limit` bytes for filling.
    pub fn start_writing(&mut self) {
        self.position = 0;
        self.end = self.limit;
    }

    /// Leave the writing phase: expose the filled bytes for draining.
    pub fn finish_writing(&mut self) {
        self.end = self.position;
        self.position = 0;
    }

    /// Bytes still writable (writing phase) or readable (reading phase).
    pub fn remaining(&self) -> usize {
        self.end - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.end
    }

    /// Whether socket transfers must move every remaining byte before the
    /// buffer is handed back to its processor.
    pub fn needs_full_transfer(&self) -> bool {
        self.consume_remaining
    }

    /// The unread bytes of a buffer in the reading phase.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.end]
    }

    /// Copy bytes into the buffer; returns how many were accepted.
    pub fn read_from_slice(&mut self, src: &[u8]) -> usize {
        let size = src.len().min(self.remaining());
        if size == 0 {
            return 0;
        }
        self.data[self.position..self.position + size].copy_from_slice(&src[..size]);
        self.position += size;
        size
    }

    /// Copy bytes out of the buffer; returns how many were produced.
    pub fn write_to_slice(&mut self, dst: &mut [u8]) -> usize {
        let size = dst.len().min(self.remaining());
        if size == 0 {
            return 0;
        }
        dst[..size].copy_from_slice(&self.data[self.position..self.position + size]);
        self.position += size;
        size
    }

    /// Fill every remaining byte from a blocking source (packet stream).
    ///
    /// A source that ends early yields `UnexpectedEof`.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut produced = 0usize;
        while self.has_remaining() {
            match src.read(&mut self.data[self.position..self.end]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    self.position += n;
                    produced += n;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(produced)
    }

    /// Drain every remaining byte into a blocking sink (packet stream).
    pub fn write_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        let mut consumed = 0usize;
        while self.has_remaining() {
            match dst.write(&self.data[self.position..self.end]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    self.position += n;
                    consumed += n;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(consumed)
    }

    /// Fill from a non-blocking socket until full or the socket runs dry.
    pub fn read_from_socket<S: Read + ?Sized>(&mut self, socket: &mut S) -> io::Result<Transfer> {
        let mut produced = 0usize;
        while self.has_remaining() {
            match socket.read(&mut self.data[self.position..self.end]) {
                Ok(0) => return Ok(Transfer::Eof),
                Ok(n) => {
                    self.position += n;
                    produced += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(progress(produced, self.has_remaining()))
    }

    /// Drain into a non-blocking socket until empty or the socket is full.
    pub fn write_to_socket<S: Write + ?Sized>(&mut self, socket: &mut S) -> io::Result<Transfer> {
        let mut consumed = 0usize;
        while self.has_remaining() {
            match socket.write(&self.data[self.position..self.end]) {
                Ok(0) => break,
                Ok(n) => {
                    self.position += n;
                    consumed += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(progress(consumed, self.has_remaining()))
    }

    /// Advance over up to `size` bytes of zero filler in the writing phase.
    ///
    /// Used after cancellation to satisfy a frame length already declared on
    /// the wire.
    pub fn fill_empty(&mut self, size: usize) -> usize {
        let fill = size.min(self.remaining());
        self.data[self.position..self.position + fill].fill(0);
        self.position += fill;
        fill
    }

    /// Skip up to `size` unread bytes in the reading phase.
    pub fn set_empty(&mut self, size: usize) -> usize {
        let skip = size.min(self.remaining());
        self.position += skip;
        skip
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("capacity", &self.data.len())
            .field("position", &self.position)
            .field("end", &self.end)
            .field("limit", &self.limit)
            .finish()
    }
}

fn progress(moved: usize, has_remaining: bool) -> Transfer {
    if moved == 0 && has_remaining {
        Transfer::WouldBlock
    } else {
        Transfer::Progress(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn limit_is_clamped_to_capacity() {
        let mut buf = TransferBuffer::new(8);
        buf.limit(1024);
        assert_eq!(buf.current_limit(), 8);
        buf.limit(4);
        buf.start_writing();
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn write_then_read_phase() {
        let mut buf = TransferBuffer::new(16);
        buf.start_writing();
        assert_eq!(buf.read_from_slice(b"hello"), 5);
        buf.finish_writing();

        assert_eq!(buf.as_slice(), b"hello");
        let mut out = [0u8; 3];
        assert_eq!(buf.write_to_slice(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn partial_fill_from_slice_stops_at_limit() {
        let mut buf = TransferBuffer::new(16);
        buf.limit(3);
        buf.start_writing();
        assert_eq!(buf.read_from_slice(b"abcdef"), 3);
        assert!(!buf.has_remaining());
        assert_eq!(buf.read_from_slice(b"x"), 0);
    }

    #[test]
    fn read_from_source_fills_everything() {
        let mut buf = TransferBuffer::new(4);
        buf.start_writing();
        let mut src = Cursor::new(b"abcdefgh".to_vec());
        assert_eq!(buf.read_from(&mut src).unwrap(), 4);
        buf.finish_writing();
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn read_from_short_source_is_unexpected_eof() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        let mut src = Cursor::new(b"abc".to_vec());
        let err = buf.read_from(&mut src).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn socket_read_distinguishes_would_block_from_eof() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        let mut dry = DrySocket;
        assert_eq!(buf.read_from_socket(&mut dry).unwrap(), Transfer::WouldBlock);

        let mut closed = Cursor::new(Vec::<u8>::new());
        assert_eq!(buf.read_from_socket(&mut closed).unwrap(), Transfer::Eof);
    }

    #[test]
    fn socket_read_reports_partial_progress() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        let mut socket = TrickleSocket {
            chunks: vec![b"ab".to_vec(), b"c".to_vec()],
        };
        assert_eq!(buf.read_from_socket(&mut socket).unwrap(), Transfer::Progress(3));
        assert!(buf.has_remaining());
    }

    #[test]
    fn socket_write_drains_buffer() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        buf.read_from_slice(b"payload");
        buf.finish_writing();

        let mut sink = Vec::new();
        assert_eq!(buf.write_to_socket(&mut sink).unwrap(), Transfer::Progress(7));
        assert_eq!(sink, b"payload");
        assert!(!buf.has_remaining());
    }

    #[test]
    fn fill_empty_zeroes_and_advances() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        buf.read_from_slice(b"stale-da");
        buf.start_writing();
        buf.read_from_slice(b"ab");
        assert_eq!(buf.fill_empty(100), 6);
        buf.finish_writing();
        assert_eq!(buf.as_slice(), b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn set_empty_skips_unread_bytes() {
        let mut buf = TransferBuffer::new(8);
        buf.start_writing();
        buf.read_from_slice(b"discard!");
        buf.finish_writing();
        assert_eq!(buf.set_empty(3), 3);
        assert_eq!(buf.as_slice(), b"card!");
    }

    struct DrySocket;

    impl Read for DrySocket {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::WouldBlock))
        }
    }

    struct TrickleSocket {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for TrickleSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }
}
