//! Minimal echo server: accepts connections and sends every string or
//! byte packet straight back.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send 127.0.0.1:7070 --data hello --wait

use std::sync::Arc;

use pktwire::{Connection, ConnectionHandler, ConnectionListener, Entity, IoContext, ReceivedPacket, SendPacket};

struct Echo;

impl ConnectionHandler for Echo {
    fn on_received_packet(&self, connection: &Connection, packet: ReceivedPacket) {
        eprintln!("{}: received {} packet, {} bytes", connection.id(), packet.kind, packet.length);
        let reply = match packet.entity {
            Entity::String(text) => SendPacket::string(text),
            Entity::Bytes(data) => SendPacket::bytes(data),
            _ => return,
        };
        connection.send(reply);
    }

    fn on_channel_closed(&self, connection: &Connection) {
        eprintln!("{}: disconnected", connection.id());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = IoContext::start()?;
    let listener = ConnectionListener::bind(&ctx, "127.0.0.1:7070")?;
    eprintln!("Listening on {}", listener.local_addr());

    let handler: Arc<dyn ConnectionHandler> = Arc::new(Echo);
    loop {
        let connection = listener.accept(Arc::clone(&handler))?;
        eprintln!("Peer connected: {} from {:?}", connection.id(), connection.peer_addr());
    }
}
