//! Plumbing shared by the networked commands: a handler that forwards
//! connection events to the command thread, context startup, and the
//! background accept loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use pktwire_conn::{
    Connection, ConnectionConfig, ConnectionHandler, ConnectionId, ConnectionListener, IoContext,
};
use pktwire_frame::{Entity, PacketId, PacketKind, ReceivedPacket, SendPacket};
use pktwire_transport::StealingConfig;

use crate::cmd::ConnArgs;
use crate::exit::{conn_error, CliError, CliResult, INTERNAL};

#[derive(Debug)]
pub enum SessionEvent {
    Received {
        connection: ConnectionId,
        packet: ReceivedPacket,
    },
    Sent {
        id: PacketId,
        ok: bool,
    },
    ReceiveFailed {
        connection: ConnectionId,
        kind: PacketKind,
    },
    Closed(ConnectionId),
}

pub struct SessionHandler {
    events: Sender<SessionEvent>,
    save_dir: Option<PathBuf>,
    echo: bool,
}

impl SessionHandler {
    pub fn new(events: Sender<SessionEvent>) -> Self {
        Self {
            events,
            save_dir: None,
            echo: false,
        }
    }

    pub fn with_save_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.save_dir = dir;
        self
    }

    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }
}

/// The packet an echo server sends back for `packet`, if any.
pub fn echo_reply(packet: &ReceivedPacket) -> Option<SendPacket> {
    let reply = match &packet.entity {
        Entity::String(text) => SendPacket::string(text.clone()),
        Entity::Bytes(data) => SendPacket::bytes(data.clone()),
        Entity::File(_) | Entity::Stream => return None,
    };
    Some(match &packet.header_info {
        Some(info) => reply.with_header_info(info.clone()),
        None => reply,
    })
}

impl ConnectionHandler for SessionHandler {
    fn on_received_packet(&self, connection: &Connection, packet: ReceivedPacket) {
        if self.echo {
            match echo_reply(&packet) {
                Some(reply) => {
                    tracing::info!(
                        connection = %connection.id(),
                        kind = %packet.kind,
                        size = packet.length,
                        "echoing packet"
                    );
                    connection.send(reply);
                }
                None => tracing::warn!(kind = %packet.kind, "packet kind not echoed"),
            }
        }
        let _ = self.events.send(SessionEvent::Received {
            connection: connection.id(),
            packet,
        });
    }

    fn on_packet_sent(&self, _connection: &Connection, id: PacketId, ok: bool) {
        let _ = self.events.send(SessionEvent::Sent { id, ok });
    }

    fn on_receive_failed(&self, connection: &Connection, kind: PacketKind, length: u64) {
        tracing::warn!(connection = %connection.id(), %kind, len = length, "receive failed");
        let _ = self.events.send(SessionEvent::ReceiveFailed {
            connection: connection.id(),
            kind,
        });
    }

    fn on_channel_closed(&self, connection: &Connection) {
        let _ = self.events.send(SessionEvent::Closed(connection.id()));
    }

    fn create_new_receive_file(&self, _length: u64, header_info: Option<&[u8]>) -> Option<PathBuf> {
        let dir = self.save_dir.as_ref()?;
        let name = header_info
            .and_then(|info| std::str::from_utf8(info).ok())
            .and_then(|name| std::path::Path::new(name).file_name())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("packet-{}.bin", pktwire_transport::now_millis())));
        Some(dir.join(name))
    }
}

pub fn start_context(args: &ConnArgs) -> CliResult<IoContext> {
    let builder = IoContext::builder();
    let builder = match args.stealing {
        Some(workers) => builder.stealing(StealingConfig {
            workers: workers.max(1),
            ..StealingConfig::default()
        }),
        None => builder,
    };
    builder
        .start()
        .map_err(|err| conn_error("io context failed to start", err))
}

/// Accept connections on a background thread until the process exits.
pub fn spawn_accept_loop(
    listener: ConnectionListener,
    handler: Arc<SessionHandler>,
) -> CliResult<()> {
    thread::Builder::new()
        .name("pktwire-accept".to_string())
        .spawn(move || loop {
            match listener.accept(Arc::clone(&handler) as Arc<dyn ConnectionHandler>) {
                Ok(connection) => {
                    tracing::info!(
                        connection = %connection.id(),
                        peer = ?connection.peer_addr(),
                        "peer connected"
                    );
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|err| CliError::new(INTERNAL, format!("accept thread failed: {err}")))
}

pub fn bind(ctx: &IoContext, addr: &str, config: ConnectionConfig) -> CliResult<ConnectionListener> {
    let listener = ConnectionListener::bind(ctx, addr)
        .map_err(|err| conn_error("bind failed", err))?
        .with_config(config);
    tracing::info!(addr = %listener.local_addr(), "listening");
    Ok(listener)
}

pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::unbounded()
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
