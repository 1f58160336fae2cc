use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer::{Transfer, TransferBuffer};
use crate::error::{Result, TransportError};
use crate::stream::IoSource;
use crate::traits::{IoEvent, IoProvider, IoTask, Readiness};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Supplies and consumes the buffers one direction of a [`SocketAdapter`]
/// moves.
///
/// Receive side: `provide_buffer` returns a buffer already in its writing
/// phase; the adapter fills it from the socket and hands it back flipped.
/// Send side: `provide_buffer` returns a filled, flipped buffer (or `None`
/// when there is nothing to send) that the adapter drains to the socket.
pub trait BufferProcessor: Send + Sync {
    fn provide_buffer(&self) -> Option<TransferBuffer>;

    /// A buffer finished its transfer. Return `true` to arm the next one.
    /// On the receive side `false` closes the connection.
    fn on_consume_completed(&self, buffer: TransferBuffer) -> bool;

    /// A transfer failed. Return `true` to close the connection.
    fn on_consume_failed(&self, error: &TransportError) -> bool;
}

struct Shared {
    source: Arc<IoSource>,
    provider: Arc<dyn IoProvider>,
    closed: AtomicBool,
    tasks: Mutex<Vec<Weak<ChannelTask>>>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Shared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(source = self.source.id(), "closing socket adapter");
        self.provider.unregister(&self.source);
        self.source.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks.iter().filter_map(Weak::upgrade) {
            task.detach();
        }
        let on_closed = self.on_closed.lock().take();
        if let Some(on_closed) = on_closed {
            on_closed();
        }
    }
}

/// One direction of socket I/O.
struct ChannelTask {
    readiness: Readiness,
    shared: Arc<Shared>,
    processor: Mutex<Option<Arc<dyn BufferProcessor>>>,
    attached: Mutex<Option<TransferBuffer>>,
    last_active: AtomicU64,
    me: Weak<ChannelTask>,
}

impl ChannelTask {
    fn new(readiness: Readiness, shared: Arc<Shared>) -> Arc<Self> {
        let task = Arc::new_cyclic(|me| Self {
            readiness,
            shared: Arc::clone(&shared),
            processor: Mutex::new(None),
            attached: Mutex::new(None),
            last_active: AtomicU64::new(now_millis()),
            me: me.clone(),
        });
        shared.tasks.lock().push(Arc::downgrade(&task));
        task
    }

    fn detach(&self) {
        self.processor.lock().take();
        self.attached.lock().take();
    }

    fn arm(self: &Arc<Self>) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let task: Arc<dyn IoTask> = Arc::clone(self) as Arc<dyn IoTask>;
        self.shared
            .provider
            .register(&self.shared.source, self.readiness, task)
    }

    fn close_connection(&self) {
        self.shared.close();
    }

    fn run(self: &Arc<Self>) {
        let Some(processor) = self.processor.lock().clone() else {
            return;
        };
        let attached = self.attached.lock().take();
        let Some(mut buffer) = attached.or_else(|| processor.provide_buffer()) else {
            // Nothing to send; the sender re-arms when new data is queued.
            return;
        };

        let mut io = &*self.shared.source;
        let outcome = match self.readiness {
            Readiness::Read => buffer.read_from_socket(&mut io),
            Readiness::Write => buffer.write_to_socket(&mut io),
        };

        match outcome {
            Ok(Transfer::Eof) => {
                debug!(source = self.shared.source.id(), "peer closed stream");
                self.close_connection();
            }
            Ok(transfer) => {
                if transfer.bytes() > 0 {
                    self.last_active.store(now_millis(), Ordering::Release);
                }
                trace!(
                    source = self.shared.source.id(),
                    direction = ?self.readiness,
                    bytes = transfer.bytes(),
                    "socket transfer"
                );
                let unfinished = buffer.has_remaining()
                    && (transfer == Transfer::WouldBlock || buffer.needs_full_transfer());
                if unfinished {
                    *self.attached.lock() = Some(buffer);
                    self.rearm_or_close();
                    return;
                }
                if self.readiness == Readiness::Read {
                    buffer.finish_writing();
                }
                if processor.on_consume_completed(buffer) {
                    self.rearm_or_close();
                } else if self.readiness == Readiness::Read {
                    debug!(source = self.shared.source.id(), "receiver stopped");
                    self.close_connection();
                }
            }
            Err(err) => {
                let err = TransportError::Io(err);
                error!(source = self.shared.source.id(), error = %err, "socket transfer failed");
                if processor.on_consume_failed(&err) {
                    self.close_connection();
                }
            }
        }
    }

    fn rearm_or_close(self: &Arc<Self>) {
        if let Err(err) = self.arm() {
            if !matches!(err, TransportError::Closed) {
                error!(error = %err, "failed to re-arm socket task");
            }
            self.close_connection();
        }
    }
}

impl IoTask for ChannelTask {
    fn on_event(&self, event: IoEvent) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        match event {
            IoEvent::Readable | IoEvent::Writable => me.run(),
            IoEvent::Closed => me.close_connection(),
        }
    }
}

/// Binds a connected [`IoSource`] to an [`IoProvider`], exposing buffer-level
/// send and receive.
pub struct SocketAdapter {
    shared: Arc<Shared>,
    input: Arc<ChannelTask>,
    output: Arc<ChannelTask>,
}

impl SocketAdapter {
    /// `on_closed` runs exactly once, on whichever thread closes the adapter.
    pub fn new(
        source: Arc<IoSource>,
        provider: Arc<dyn IoProvider>,
        on_closed: Box<dyn FnOnce() + Send>,
    ) -> Self {
        let shared = Arc::new(Shared {
            source,
            provider,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::with_capacity(2)),
            on_closed: Mutex::new(Some(on_closed)),
        });
        let input = ChannelTask::new(Readiness::Read, Arc::clone(&shared));
        let output = ChannelTask::new(Readiness::Write, Arc::clone(&shared));
        Self {
            shared,
            input,
            output,
        }
    }

    pub fn source(&self) -> &Arc<IoSource> {
        &self.shared.source
    }

    pub fn set_receiver(&self, processor: Arc<dyn BufferProcessor>) {
        *self.input.processor.lock() = Some(processor);
    }

    pub fn set_sender(&self, processor: Arc<dyn BufferProcessor>) {
        *self.output.processor.lock() = Some(processor);
    }

    /// Arm the next read.
    pub fn request_receive(&self) -> Result<()> {
        self.input.arm()
    }

    /// Arm the next write.
    pub fn request_send(&self) -> Result<()> {
        self.output.arm()
    }

    pub fn last_read_time(&self) -> u64 {
        self.input.last_active.load(Ordering::Acquire)
    }

    pub fn last_write_time(&self) -> u64 {
        self.output.last_active.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for SocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketAdapter")
            .field("source", &self.shared.source)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::selector::{SelectorConfig, SelectorProvider};

    struct Collect {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl BufferProcessor for Collect {
        fn provide_buffer(&self) -> Option<TransferBuffer> {
            let mut buf = TransferBuffer::with_mode(64, false);
            buf.start_writing();
            Some(buf)
        }

        fn on_consume_completed(&self, buffer: TransferBuffer) -> bool {
            let _ = self.tx.send(buffer.as_slice().to_vec());
            true
        }

        fn on_consume_failed(&self, _error: &TransportError) -> bool {
            true
        }
    }

    struct SendOnce {
        payload: Mutex<Option<Vec<u8>>>,
        done: mpsc::Sender<()>,
    }

    impl BufferProcessor for SendOnce {
        fn provide_buffer(&self) -> Option<TransferBuffer> {
            let payload = self.payload.lock().take()?;
            let mut buf = TransferBuffer::new(payload.len());
            buf.start_writing();
            buf.read_from_slice(&payload);
            buf.finish_writing();
            Some(buf)
        }

        fn on_consume_completed(&self, _buffer: TransferBuffer) -> bool {
            let _ = self.done.send(());
            false
        }

        fn on_consume_failed(&self, _error: &TransportError) -> bool {
            true
        }
    }

    struct TakeOne {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl BufferProcessor for TakeOne {
        fn provide_buffer(&self) -> Option<TransferBuffer> {
            let mut buf = TransferBuffer::with_mode(64, false);
            buf.start_writing();
            Some(buf)
        }

        fn on_consume_completed(&self, buffer: TransferBuffer) -> bool {
            let _ = self.tx.send(buffer.as_slice().to_vec());
            false
        }

        fn on_consume_failed(&self, _error: &TransportError) -> bool {
            true
        }
    }

    fn setup() -> (Arc<dyn IoProvider>, Arc<IoSource>, std::net::TcpStream) {
        let provider: Arc<dyn IoProvider> =
            Arc::new(SelectorProvider::new(SelectorConfig::default()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (provider, IoSource::new(server).unwrap(), client)
    }

    #[test]
    fn receives_bytes_continuously() {
        let (provider, source, mut client) = setup();
        let adapter = SocketAdapter::new(source, provider, Box::new(|| {}));
        let (tx, rx) = mpsc::channel();
        adapter.set_receiver(Arc::new(Collect { tx }));
        adapter.request_receive().unwrap();

        client.write_all(b"first").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"first");
        client.write_all(b"second").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"second");
        assert!(adapter.last_read_time() > 0);
        adapter.close();
    }

    #[test]
    fn sends_provided_buffer() {
        let (provider, source, mut client) = setup();
        let adapter = SocketAdapter::new(source, provider, Box::new(|| {}));
        let (done, finished) = mpsc::channel();
        adapter.set_sender(Arc::new(SendOnce {
            payload: Mutex::new(Some(b"outbound".to_vec())),
            done,
        }));
        adapter.request_send().unwrap();

        finished.recv_timeout(Duration::from_secs(2)).unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"outbound");
        adapter.close();
    }

    #[test]
    fn peer_eof_closes_once() {
        let (provider, source, client) = setup();
        let (closed_tx, closed_rx) = mpsc::channel();
        let adapter = SocketAdapter::new(
            source,
            provider,
            Box::new(move || {
                let _ = closed_tx.send(());
            }),
        );
        let (tx, _rx) = mpsc::channel();
        adapter.set_receiver(Arc::new(Collect { tx }));
        adapter.request_receive().unwrap();

        drop(client);
        closed_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(adapter.is_closed());
        adapter.close();
        assert!(closed_rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(matches!(adapter.request_receive(), Err(TransportError::Closed)));
    }

    #[test]
    fn stopped_receiver_closes_adapter() {
        let (provider, source, mut client) = setup();
        let (closed_tx, closed_rx) = mpsc::channel();
        let adapter = SocketAdapter::new(
            source,
            provider,
            Box::new(move || {
                let _ = closed_tx.send(());
            }),
        );
        let (tx, rx) = mpsc::channel();
        adapter.set_receiver(Arc::new(TakeOne { tx }));
        adapter.request_receive().unwrap();

        client.write_all(b"last").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"last");
        closed_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(adapter.is_closed());
    }
}
