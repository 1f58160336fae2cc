//! Send and receive dispatchers: the buffer processors that sit between a
//! [`SocketAdapter`] and the frame producer/consumer.
//!
//! Connection-local state lives behind one lock per direction. Listener
//! callbacks run after that lock is released.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pktwire_frame::{FrameError, PacketId, PacketKind, ReceivePacket, ReceivedPacket, SendPacket};
use pktwire_transport::{BufferProcessor, SocketAdapter, TransferBuffer, TransportError};
use tracing::{debug, error, warn};

use crate::reader::{PacketReader, PacketSource};
use crate::writer::{PacketWriter, ReceivePacketProvider};

/// Where dispatchers report what happened on the wire.
pub(crate) trait DispatchListener: Send + Sync {
    fn on_packet_sent(&self, id: PacketId, ok: bool);

    /// Storage for an announced packet; `None` refuses it.
    fn create_receive_packet(&self, kind: PacketKind, length: u64, header_info: Option<&[u8]>) -> Option<ReceivePacket>;

    fn on_received_packet(&self, packet: ReceivedPacket);

    fn on_receive_failed(&self, kind: PacketKind, length: u64);

    fn on_heartbeat(&self);

    /// The inbound stream broke the frame protocol.
    fn on_protocol_error(&self, error: &FrameError);
}

struct Outbox<'a> {
    queue: &'a mut VecDeque<SendPacket>,
    completed: &'a mut Vec<(PacketId, bool)>,
}

impl PacketSource for Outbox<'_> {
    fn take_packet(&mut self) -> Option<SendPacket> {
        self.queue.pop_front()
    }

    fn completed(&mut self, packet: SendPacket, ok: bool) {
        self.completed.push((packet.id(), ok));
    }
}

struct SendState {
    queue: VecDeque<SendPacket>,
    reader: PacketReader,
    sending: bool,
    closed: bool,
    spare: Option<TransferBuffer>,
}

impl SendState {
    fn with_outbox<R>(&mut self, completed: &mut Vec<(PacketId, bool)>, f: impl FnOnce(&mut PacketReader, &mut Outbox<'_>) -> R) -> R {
        let mut outbox = Outbox {
            queue: &mut self.queue,
            completed,
        };
        f(&mut self.reader, &mut outbox)
    }

    /// Mark the direction busy. Returns whether a write must be armed.
    fn start_sending(&mut self) -> bool {
        if self.sending || self.closed {
            return false;
        }
        self.sending = true;
        true
    }
}

pub(crate) struct SendDispatcher {
    state: Mutex<SendState>,
    buffer_size: usize,
    adapter: Weak<SocketAdapter>,
    listener: Weak<dyn DispatchListener>,
}

impl SendDispatcher {
    pub(crate) fn new(
        adapter: Weak<SocketAdapter>,
        listener: Weak<dyn DispatchListener>,
        buffer_size: usize,
        max_in_flight: usize,
        max_entity_body: usize,
    ) -> Self {
        Self {
            state: Mutex::new(SendState {
                queue: VecDeque::new(),
                reader: PacketReader::new(max_in_flight, max_entity_body),
                sending: false,
                closed: false,
                spare: None,
            }),
            buffer_size,
            adapter,
            listener,
        }
    }

    pub(crate) fn send(&self, packet: SendPacket) {
        let id = packet.id();
        let kick = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                debug!(packet = %id, "send on closed connection");
                self.deliver(vec![(id, false)]);
                return;
            }
            state.queue.push_back(packet);
            state.start_sending()
        };
        if kick {
            self.kick();
        }
    }

    /// Cancel a queued or in-flight packet. Returns whether it was found.
    pub(crate) fn cancel(&self, id: PacketId) -> bool {
        let mut completed = Vec::new();
        let (found, kick) = {
            let mut state = self.state.lock();
            let found = match state.queue.iter().position(|p| p.id() == id) {
                Some(index) => {
                    if let Some(mut packet) = state.queue.remove(index) {
                        packet.close();
                        completed.push((id, false));
                    }
                    true
                }
                None => state.with_outbox(&mut completed, |reader, outbox| reader.cancel(id, outbox)),
            };
            let kick = found && state.reader.has_pending() && state.start_sending();
            (found, kick)
        };
        self.deliver(completed);
        if kick {
            self.kick();
        }
        found
    }

    /// Queue a heartbeat if the connection has nothing else to say.
    pub(crate) fn send_heartbeat(&self) -> bool {
        let (queued, kick) = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let queue_is_empty = state.queue.is_empty();
            let queued = state.reader.request_send_heartbeat(queue_is_empty);
            (queued, queued && state.start_sending())
        };
        if kick {
            self.kick();
        }
        queued
    }

    /// Fail everything queued or in flight.
    pub(crate) fn close(&self) {
        let mut completed = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.sending = false;
            state.spare = None;
            state.with_outbox(&mut completed, |reader, outbox| reader.close(outbox));
            for mut packet in state.queue.drain(..) {
                packet.close();
                completed.push((packet.id(), false));
            }
        }
        self.deliver(completed);
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn kick(&self) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        if let Err(err) = adapter.request_send() {
            debug!(error = %err, "write not armed");
            self.state.lock().sending = false;
        }
    }

    fn deliver(&self, completed: Vec<(PacketId, bool)>) {
        if completed.is_empty() {
            return;
        }
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        for (id, ok) in completed {
            listener.on_packet_sent(id, ok);
        }
    }
}

impl BufferProcessor for SendDispatcher {
    fn provide_buffer(&self) -> Option<TransferBuffer> {
        let mut completed = Vec::new();
        let buffer = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let mut buffer = state
                .spare
                .take()
                .unwrap_or_else(|| TransferBuffer::new(self.buffer_size));
            let filled = state.with_outbox(&mut completed, |reader, outbox| {
                reader.request_take_packet(outbox);
                reader.fill_data(&mut buffer, outbox)
            });
            if filled {
                Some(buffer)
            } else {
                state.sending = false;
                state.spare = Some(buffer);
                None
            }
        };
        self.deliver(completed);
        buffer
    }

    fn on_consume_completed(&self, buffer: TransferBuffer) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.spare = Some(buffer);
        let more = state.reader.has_pending() || !state.queue.is_empty();
        if !more {
            state.sending = false;
        }
        more
    }

    fn on_consume_failed(&self, error: &TransportError) -> bool {
        error!(%error, "send failed; closing connection");
        true
    }
}

enum Inbound {
    Received(ReceivedPacket),
    Failed(PacketKind, u64),
    Heartbeat,
}

struct Inbox<'a> {
    listener: Option<&'a dyn DispatchListener>,
    events: &'a mut Vec<Inbound>,
}

impl ReceivePacketProvider for Inbox<'_> {
    fn take_packet(&mut self, kind: PacketKind, length: u64, header_info: Option<&[u8]>) -> Option<ReceivePacket> {
        self.listener?.create_receive_packet(kind, length, header_info)
    }

    fn completed_packet(&mut self, packet: ReceivePacket, ok: bool) {
        let (kind, length) = (packet.kind(), packet.length());
        if !ok {
            self.events.push(Inbound::Failed(kind, length));
            return;
        }
        match packet.close() {
            Ok(received) => self.events.push(Inbound::Received(received)),
            Err(err) => {
                warn!(%kind, len = length, error = %err, "failed to finish receive packet");
                self.events.push(Inbound::Failed(kind, length));
            }
        }
    }

    fn on_heartbeat(&mut self) {
        self.events.push(Inbound::Heartbeat);
    }
}

struct ReceiveState {
    writer: PacketWriter,
    spare: Option<TransferBuffer>,
    closed: bool,
}

pub(crate) struct ReceiveDispatcher {
    state: Mutex<ReceiveState>,
    buffer_size: usize,
    listener: Weak<dyn DispatchListener>,
}

impl ReceiveDispatcher {
    pub(crate) fn new(listener: Weak<dyn DispatchListener>, buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(ReceiveState {
                writer: PacketWriter::new(),
                spare: None,
                closed: false,
            }),
            buffer_size,
            listener,
        }
    }

    /// Fail every partially received packet.
    pub(crate) fn close(&self) {
        let listener = self.listener.upgrade();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.spare = None;
            let mut inbox = Inbox {
                listener: listener.as_deref(),
                events: &mut events,
            };
            state.writer.close(&mut inbox);
        }
        if let Some(listener) = listener {
            dispatch(listener.as_ref(), events);
        }
    }
}

fn dispatch(listener: &dyn DispatchListener, events: Vec<Inbound>) {
    for event in events {
        match event {
            Inbound::Received(packet) => listener.on_received_packet(packet),
            Inbound::Failed(kind, length) => listener.on_receive_failed(kind, length),
            Inbound::Heartbeat => listener.on_heartbeat(),
        }
    }
}

impl BufferProcessor for ReceiveDispatcher {
    fn provide_buffer(&self) -> Option<TransferBuffer> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let mut buffer = state
            .spare
            .take()
            .unwrap_or_else(|| TransferBuffer::with_mode(self.buffer_size, false));
        state.writer.prepare(&mut buffer);
        Some(buffer)
    }

    fn on_consume_completed(&self, mut buffer: TransferBuffer) -> bool {
        let listener = self.listener.upgrade();
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let mut inbox = Inbox {
                listener: listener.as_deref(),
                events: &mut events,
            };
            let result = state.writer.consume(&mut buffer, &mut inbox);
            state.spare = Some(buffer);
            result
        };

        let Some(listener) = listener else {
            warn!("receive listener dropped; closing connection");
            return false;
        };
        dispatch(listener.as_ref(), events);
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "protocol violation; closing connection");
                listener.on_protocol_error(&err);
                false
            }
        }
    }

    fn on_consume_failed(&self, error: &TransportError) -> bool {
        error!(%error, "receive failed; closing connection");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::Duration;

    use pktwire_frame::{Entity, FrameHeader, FrameType, HEADER_SIZE};
    use pktwire_transport::{IoProvider, IoSource, SelectorConfig, SelectorProvider};

    use super::*;

    #[derive(Debug)]
    enum Event {
        Sent(PacketId, bool),
        Received(ReceivedPacket),
        Failed(PacketKind),
        Heartbeat,
        ProtocolError,
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<Event>>,
    }

    impl Recorder {
        fn emit(&self, event: Event) {
            let _ = self.tx.lock().send(event);
        }
    }

    impl DispatchListener for Recorder {
        fn on_packet_sent(&self, id: PacketId, ok: bool) {
            self.emit(Event::Sent(id, ok));
        }

        fn create_receive_packet(&self, kind: PacketKind, length: u64, header_info: Option<&[u8]>) -> Option<ReceivePacket> {
            let header_info = header_info.map(<[u8]>::to_vec);
            match kind {
                PacketKind::String => Some(ReceivePacket::string(length, header_info)),
                PacketKind::Bytes => Some(ReceivePacket::bytes(length, header_info)),
                _ => None,
            }
        }

        fn on_received_packet(&self, packet: ReceivedPacket) {
            self.emit(Event::Received(packet));
        }

        fn on_receive_failed(&self, kind: PacketKind, _length: u64) {
            self.emit(Event::Failed(kind));
        }

        fn on_heartbeat(&self) {
            self.emit(Event::Heartbeat);
        }

        fn on_protocol_error(&self, _error: &FrameError) {
            self.emit(Event::ProtocolError);
        }
    }

    struct Fixture {
        adapter: Arc<SocketAdapter>,
        send: Arc<SendDispatcher>,
        receive: Arc<ReceiveDispatcher>,
        events: mpsc::Receiver<Event>,
        peer: TcpStream,
        _listener: Arc<Recorder>,
    }

    fn fixture() -> Fixture {
        let provider: Arc<dyn IoProvider> = Arc::new(
            SelectorProvider::new(SelectorConfig::default()).expect("selector should start"),
        );
        let server = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let peer = TcpStream::connect(server.local_addr().expect("listener should have addr"))
            .expect("client should connect");
        let (stream, _) = server.accept().expect("listener should accept");
        let source = IoSource::new(stream).expect("source should wrap stream");
        let adapter = Arc::new(SocketAdapter::new(source, provider, Box::new(|| {})));

        let (tx, events) = mpsc::channel();
        let recorder = Arc::new(Recorder { tx: Mutex::new(tx) });
        let weak: Weak<dyn DispatchListener> = Arc::downgrade(&recorder) as Weak<dyn DispatchListener>;
        let send = Arc::new(SendDispatcher::new(Arc::downgrade(&adapter), weak.clone(), 4096, 1, 4096));
        let receive = Arc::new(ReceiveDispatcher::new(weak, 4096));
        adapter.set_sender(Arc::clone(&send) as Arc<dyn BufferProcessor>);
        adapter.set_receiver(Arc::clone(&receive) as Arc<dyn BufferProcessor>);
        adapter.request_receive().expect("receive should arm");

        Fixture {
            adapter,
            send,
            receive,
            events,
            peer,
            _listener: recorder,
        }
    }

    fn next(events: &mpsc::Receiver<Event>) -> Event {
        events
            .recv_timeout(Duration::from_secs(2))
            .expect("event should arrive")
    }

    fn read_frame(peer: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_SIZE];
        peer.read_exact(&mut header).expect("header should arrive");
        let header = FrameHeader::decode(&header).expect("header should decode");
        let mut body = vec![0u8; header.body_len as usize];
        peer.read_exact(&mut body).expect("body should arrive");
        (header, body)
    }

    #[test]
    fn send_writes_frames_and_reports_completion() {
        let mut fx = fixture();
        let packet = SendPacket::string("hi");
        let id = packet.id();
        fx.send.send(packet);

        let (header, _) = read_frame(&mut fx.peer);
        assert_eq!(header.frame_type, FrameType::PacketHeader);
        let (entity, body) = read_frame(&mut fx.peer);
        assert_eq!(entity.frame_type, FrameType::PacketEntity);
        assert_eq!(body, b"hi");
        assert!(matches!(next(&fx.events), Event::Sent(sent, true) if sent == id));
        assert_eq!(fx.send.queued(), 0);
        fx.adapter.close();
    }

    #[test]
    fn heartbeat_reaches_peer() {
        let mut fx = fixture();
        assert!(fx.send.send_heartbeat());
        let (header, body) = read_frame(&mut fx.peer);
        assert_eq!(header.frame_type, FrameType::Heartbeat);
        assert!(body.is_empty());
        fx.adapter.close();
    }

    #[test]
    fn receive_reassembles_inbound_packet() {
        let mut fx = fixture();
        let mut wire = Vec::new();
        let mut info = bytes::BytesMut::new();
        pktwire_frame::PacketInfo {
            length: 5,
            kind: PacketKind::String,
            header_info: None,
        }
        .encode(&mut info)
        .expect("info should encode");
        wire.extend(FrameHeader::new(info.len(), FrameType::PacketHeader, 1).unwrap().to_bytes());
        wire.extend_from_slice(&info);
        wire.extend(FrameHeader::new(5, FrameType::PacketEntity, 1).unwrap().to_bytes());
        wire.extend_from_slice(b"hello");
        wire.extend(FrameHeader::new(0, FrameType::Heartbeat, 0).unwrap().to_bytes());
        fx.peer.write_all(&wire).expect("peer should write");

        match next(&fx.events) {
            Event::Received(packet) => assert_eq!(packet.entity, Entity::String("hello".into())),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next(&fx.events), Event::Heartbeat));
        fx.adapter.close();
    }

    #[test]
    fn unknown_frame_type_reports_protocol_error() {
        let mut fx = fixture();
        fx.peer.write_all(&[0, 0, 99, 0, 1, 0]).expect("peer should write");
        assert!(matches!(next(&fx.events), Event::ProtocolError));
        fx.adapter.close();
    }

    #[test]
    fn close_fails_queued_and_partial_packets() {
        let mut fx = fixture();
        let mut info = bytes::BytesMut::new();
        pktwire_frame::PacketInfo {
            length: 100,
            kind: PacketKind::Bytes,
            header_info: None,
        }
        .encode(&mut info)
        .expect("info should encode");
        let mut wire = FrameHeader::new(info.len(), FrameType::PacketHeader, 3)
            .unwrap()
            .to_bytes()
            .to_vec();
        wire.extend_from_slice(&info);
        fx.peer.write_all(&wire).expect("peer should write");
        std::thread::sleep(Duration::from_millis(100));

        fx.adapter.close();
        fx.receive.close();
        assert!(matches!(next(&fx.events), Event::Failed(PacketKind::Bytes)));

        fx.send.close();
        let late = SendPacket::bytes(vec![1, 2, 3]);
        let id = late.id();
        fx.send.send(late);
        assert!(matches!(next(&fx.events), Event::Sent(sent, false) if sent == id));
    }

    #[test]
    fn cancel_removes_queued_packet() {
        let fx = fixture();
        {
            let mut state = fx.send.state.lock();
            state.sending = true;
        }
        let packet = SendPacket::bytes(vec![0u8; 10]);
        let id = packet.id();
        fx.send.send(packet);
        assert_eq!(fx.send.queued(), 1);
        assert!(fx.send.cancel(id));
        assert_eq!(fx.send.queued(), 0);
        assert!(matches!(next(&fx.events), Event::Sent(sent, false) if sent == id));
        assert!(!fx.send.cancel(id));
        fx.adapter.close();
    }
}
