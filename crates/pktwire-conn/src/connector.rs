use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, ConnectionConfig, ConnectionHandler};
use crate::context::IoContext;
use crate::error::Result;

/// Connect to `addr` and set the socket up on `ctx`.
pub fn connect(
    ctx: &IoContext,
    addr: impl ToSocketAddrs,
    handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
) -> Result<Connection> {
    connect_with_timeout(ctx, addr, None, handler, config)
}

/// Connect with a bound on how long the TCP handshake may take.
pub fn connect_with_timeout(
    ctx: &IoContext,
    addr: impl ToSocketAddrs,
    timeout: Option<Duration>,
    handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
) -> Result<Connection> {
    // Fail before touching the network.
    ctx.provider()?;
    let stream = pktwire_transport::tcp::connect_with_timeout(addr, timeout)?;
    Connection::setup(ctx, stream, handler, config)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::error::ConnError;

    struct Quiet;
    impl ConnectionHandler for Quiet {}

    #[test]
    fn connect_refused_is_transport_error() {
        let ctx = IoContext::start().expect("context should start");
        let addr = {
            let scratch = TcpListener::bind("127.0.0.1:0").expect("scratch listener should bind");
            scratch.local_addr().expect("scratch listener should have addr")
        };
        let result = connect(&ctx, addr, Arc::new(Quiet), ConnectionConfig::default());
        assert!(matches!(result, Err(ConnError::Transport(_))));
        ctx.close();
    }

    #[test]
    fn connect_on_closed_context_fails_fast() {
        let ctx = IoContext::start().expect("context should start");
        ctx.close();
        let result = connect_with_timeout(
            &ctx,
            "127.0.0.1:9",
            Some(Duration::from_millis(100)),
            Arc::new(Quiet),
            ConnectionConfig::default(),
        );
        assert!(matches!(result, Err(ConnError::ContextClosed)));
    }
}
