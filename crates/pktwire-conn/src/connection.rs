use std::fmt;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use pktwire_frame::{
    FrameError, PacketId, PacketKind, ReceivePacket, ReceivedPacket, SendPacket, MAX_BODY_LEN,
};
use pktwire_transport::{BufferProcessor, IoSource, SocketAdapter, DEFAULT_BUFFER_SIZE};
use tracing::{debug, info, warn};

use crate::context::IoContext;
use crate::dispatch::{DispatchListener, ReceiveDispatcher, SendDispatcher};
use crate::error::{ConnError, Result};
use crate::schedule::{IdleTimeoutJob, ScheduleHandle, ScheduleJob};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection key, displayed as `conn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Application callbacks for one connection. Every method has a default.
///
/// Callbacks run on I/O or scheduler threads with no connection lock held,
/// so calling back into the [`Connection`] (for example to reply) is fine.
/// Long-running work belongs on another thread.
pub trait ConnectionHandler: Send + Sync {
    fn on_received_packet(&self, connection: &Connection, packet: ReceivedPacket) {
        let _ = (connection, packet);
    }

    /// A sent packet left the connection: fully written (`ok`), cancelled,
    /// or dropped because the connection closed.
    fn on_packet_sent(&self, connection: &Connection, id: PacketId, ok: bool) {
        let _ = (connection, id, ok);
    }

    /// An inbound packet was cancelled by the peer or lost on close.
    fn on_receive_failed(&self, connection: &Connection, kind: PacketKind, length: u64) {
        let _ = (connection, kind, length);
    }

    fn on_heartbeat(&self, connection: &Connection) {
        let _ = connection;
    }

    fn on_channel_closed(&self, connection: &Connection) {
        let _ = connection;
    }

    /// Where to store an inbound file packet. `None` refuses it.
    fn create_new_receive_file(&self, length: u64, header_info: Option<&[u8]>) -> Option<PathBuf> {
        let _ = (length, header_info);
        None
    }

    /// Where to write an inbound live stream. `None` refuses it.
    fn create_new_receive_direct_output_stream(
        &self,
        length: u64,
        header_info: Option<&[u8]>,
    ) -> Option<Box<dyn Write + Send>> {
        let _ = (length, header_info);
        None
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound transfer buffer.
    pub send_buffer_size: usize,
    /// Capacity of the inbound transfer buffer.
    pub receive_buffer_size: usize,
    /// Largest entity frame body. Defaults to the send buffer size.
    pub max_entity_body: Option<usize>,
    /// Packets whose frames may interleave on the wire.
    pub max_in_flight_packets: usize,
    /// Send a heartbeat after this long without traffic.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            max_entity_body: None,
            max_in_flight_packets: 1,
            idle_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn entity_body_limit(&self) -> usize {
        self.max_entity_body
            .unwrap_or(self.send_buffer_size)
            .clamp(1, MAX_BODY_LEN)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    context: IoContext,
    handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    adapter: Arc<SocketAdapter>,
    send: Arc<SendDispatcher>,
    receive: Arc<ReceiveDispatcher>,
    // Keyed by the job's address so one job is scheduled at most once.
    jobs: Mutex<Vec<(usize, ScheduleHandle)>>,
    closed: AtomicBool,
    // Held while the socket is open; cleared on close.
    keepalive: Mutex<Option<Arc<ConnectionInner>>>,
    me: Weak<ConnectionInner>,
}

impl ConnectionInner {
    fn handle(&self) -> Option<Connection> {
        self.me.upgrade().map(|inner| Connection { inner })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs once, after the socket adapter closed.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, handle) in self.jobs.lock().drain(..) {
            handle.cancel();
        }
        self.send.close();
        self.receive.close();
        info!(connection = %self.id, "connection closed");
        if let Some(connection) = self.handle() {
            self.handler.on_channel_closed(&connection);
        }
        let keepalive = self.keepalive.lock().take();
        drop(keepalive);
    }
}

impl DispatchListener for ConnectionInner {
    fn on_packet_sent(&self, id: PacketId, ok: bool) {
        if let Some(connection) = self.handle() {
            self.handler.on_packet_sent(&connection, id, ok);
        }
    }

    fn create_receive_packet(&self, kind: PacketKind, length: u64, header_info: Option<&[u8]>) -> Option<ReceivePacket> {
        let owned = header_info.map(<[u8]>::to_vec);
        match kind {
            PacketKind::Bytes => Some(ReceivePacket::bytes(length, owned)),
            PacketKind::String => Some(ReceivePacket::string(length, owned)),
            PacketKind::File => self
                .handler
                .create_new_receive_file(length, header_info)
                .map(|path| ReceivePacket::file(length, owned, path)),
            PacketKind::Stream => self
                .handler
                .create_new_receive_direct_output_stream(length, header_info)
                .map(|writer| ReceivePacket::direct(length, owned, writer)),
        }
    }

    fn on_received_packet(&self, packet: ReceivedPacket) {
        if let Some(connection) = self.handle() {
            self.handler.on_received_packet(&connection, packet);
        }
    }

    fn on_receive_failed(&self, kind: PacketKind, length: u64) {
        if let Some(connection) = self.handle() {
            self.handler.on_receive_failed(&connection, kind, length);
        }
    }

    fn on_heartbeat(&self) {
        debug!(connection = %self.id, "heartbeat received");
        if let Some(connection) = self.handle() {
            self.handler.on_heartbeat(&connection);
        }
    }

    fn on_protocol_error(&self, error: &FrameError) {
        warn!(connection = %self.id, %error, "closing connection after protocol error");
        self.adapter.close();
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.adapter.close();
    }
}

/// A framed packet connection over one TCP socket.
///
/// Cheap to clone; clones share the connection. The connection stays alive
/// until it is closed, locally or by the peer, even if every handle is
/// dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Bind a connected socket to `ctx` and start receiving.
    pub fn setup(
        ctx: &IoContext,
        stream: TcpStream,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let provider = ctx.provider()?;
        let source = IoSource::new(stream)?;
        let peer_addr = source.peer_addr();
        let local_addr = source.local_addr();

        let inner = Arc::new_cyclic(|me: &Weak<ConnectionInner>| {
            let on_closed = {
                let me = me.clone();
                Box::new(move || {
                    if let Some(inner) = me.upgrade() {
                        inner.teardown();
                    }
                })
            };
            let adapter = Arc::new(SocketAdapter::new(source, provider, on_closed));
            let listener: Weak<dyn DispatchListener> = me.clone();
            let send = Arc::new(SendDispatcher::new(
                Arc::downgrade(&adapter),
                listener.clone(),
                config.send_buffer_size,
                config.max_in_flight_packets,
                config.entity_body_limit(),
            ));
            let receive = Arc::new(ReceiveDispatcher::new(listener, config.receive_buffer_size));
            ConnectionInner {
                id: ConnectionId::next(),
                context: ctx.clone(),
                handler,
                config,
                peer_addr,
                local_addr,
                adapter,
                send,
                receive,
                jobs: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                keepalive: Mutex::new(None),
                me: me.clone(),
            }
        });

        inner
            .adapter
            .set_sender(Arc::clone(&inner.send) as Arc<dyn BufferProcessor>);
        inner
            .adapter
            .set_receiver(Arc::clone(&inner.receive) as Arc<dyn BufferProcessor>);
        *inner.keepalive.lock() = Some(Arc::clone(&inner));

        let connection = Self { inner };
        if let Err(err) = connection.inner.adapter.request_receive() {
            connection.close();
            return Err(err.into());
        }
        if let Some(timeout) = connection.inner.config.idle_timeout {
            if let Err(err) = connection.schedule(Arc::new(IdleTimeoutJob::new(timeout))) {
                connection.close();
                return Err(err);
            }
        }
        info!(
            connection = %connection.id(),
            peer = ?connection.peer_addr(),
            "connection established"
        );
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Queue a packet. Its outcome arrives through
    /// [`ConnectionHandler::on_packet_sent`].
    pub fn send(&self, packet: SendPacket) -> PacketId {
        let id = packet.id();
        self.inner.send.send(packet);
        id
    }

    pub fn send_str(&self, text: &str) -> PacketId {
        self.send(SendPacket::string(text))
    }

    /// Cancel a packet that is queued or partly sent. Returns `false` when
    /// the packet is unknown or already finished.
    pub fn cancel(&self, id: PacketId) -> bool {
        self.inner.send.cancel(id)
    }

    /// Queue a heartbeat frame unless other traffic is already queued.
    pub fn send_heartbeat(&self) -> bool {
        self.inner.send.send_heartbeat()
    }

    /// Run `job` on the context scheduler until it stops itself or the
    /// connection closes. Scheduling a job that is still running is a no-op.
    pub fn schedule(&self, job: Arc<dyn ScheduleJob>) -> Result<()> {
        if self.is_closed() {
            return Err(ConnError::Closed(self.id().to_string()));
        }
        let key = Arc::as_ptr(&job) as *const () as usize;
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|(_, handle)| !handle.is_done());
        if jobs.iter().any(|(k, _)| *k == key) {
            debug!(connection = %self.id(), "job already scheduled");
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let delay = job.initial_delay();
        let handle = self.inner.context.scheduler()?.schedule(delay, move || {
            let inner = weak.upgrade()?;
            if inner.is_closed() {
                return None;
            }
            job.fire(&Connection { inner })
        })?;
        jobs.push((key, handle));
        Ok(())
    }

    /// Jobs scheduled on this connection that may still run.
    pub fn scheduled_jobs(&self) -> usize {
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|(_, handle)| !handle.is_done());
        jobs.len()
    }

    /// Milliseconds since the epoch of the last inbound bytes.
    pub fn last_read_time(&self) -> u64 {
        self.inner.adapter.last_read_time()
    }

    /// Milliseconds since the epoch of the last outbound bytes.
    pub fn last_write_time(&self) -> u64 {
        self.inner.adapter.last_write_time()
    }

    pub fn last_active_time(&self) -> u64 {
        self.last_read_time().max(self.last_write_time())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.inner.adapter.is_closed()
    }

    /// Close the socket and fail everything still queued or in flight.
    pub fn close(&self) {
        self.inner.adapter.close();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
