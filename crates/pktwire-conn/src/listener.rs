use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use pktwire_transport::{TcpAcceptor, TransportError};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionHandler};
use crate::context::IoContext;
use crate::error::Result;

/// Accepts TCP connections and sets each one up on an [`IoContext`].
pub struct ConnectionListener {
    acceptor: TcpAcceptor,
    context: IoContext,
    config: ConnectionConfig,
}

impl ConnectionListener {
    /// Bind to the first address `addr` resolves to.
    pub fn bind(ctx: &IoContext, addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = resolve(addr)?;
        Ok(Self {
            acceptor: TcpAcceptor::bind(addr)?,
            context: ctx.clone(),
            config: ConnectionConfig::default(),
        })
    }

    /// Override the config applied to accepted connections.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Block for the next connection and start it with `handler`.
    pub fn accept(&self, handler: Arc<dyn ConnectionHandler>) -> Result<Connection> {
        let (stream, peer) = self.acceptor.accept()?;
        debug!(%peer, "accepted tcp connection");
        Connection::setup(&self.context, stream, handler, self.config.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }
}

impl std::fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

pub(crate) fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(TransportError::Io)?
        .next()
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
            .into()
        })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use pktwire_frame::ReceivedPacket;

    use super::*;
    use crate::connector::connect;

    struct Forward {
        tx: parking_lot::Mutex<mpsc::Sender<String>>,
    }

    impl ConnectionHandler for Forward {
        fn on_received_packet(&self, _connection: &Connection, packet: ReceivedPacket) {
            if let Some(text) = packet.as_str() {
                let _ = self.tx.lock().send(text.to_string());
            }
        }
    }

    struct Quiet;
    impl ConnectionHandler for Quiet {}

    #[test]
    fn accept_returns_connection() {
        let ctx = IoContext::start().expect("context should start");
        let listener = ConnectionListener::bind(&ctx, "127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr();

        let (tx, rx) = mpsc::channel();
        let server = thread::spawn(move || {
            let handler = Arc::new(Forward {
                tx: parking_lot::Mutex::new(tx),
            });
            listener.accept(handler).expect("listener should accept")
        });

        let client = connect(&ctx, addr, Arc::new(Quiet), ConnectionConfig::default())
            .expect("client should connect");
        let accepted = server.join().expect("server thread should complete");
        assert_ne!(accepted.id(), client.id());
        assert_eq!(accepted.peer_addr(), client.local_addr());

        client.send_str("over tcp");
        let text = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("packet should arrive");
        assert_eq!(text, "over tcp");

        client.close();
        accepted.close();
        ctx.close();
    }

    #[test]
    fn bind_rejects_unresolvable_address() {
        let ctx = IoContext::start().expect("context should start");
        assert!(ConnectionListener::bind(&ctx, Vec::<SocketAddr>::new().as_slice()).is_err());
        ctx.close();
    }
}
