use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::cmd::session::{
    bind, event_channel, install_ctrlc_handler, spawn_accept_loop, start_context, SessionEvent,
    SessionHandler,
};
use crate::cmd::EchoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

const TICK: Duration = Duration::from_millis(200);

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let config = args.conn.connection_config()?;
    let ctx = start_context(&args.conn)?;
    let listener = bind(&ctx, &args.addr, config)?;

    let (tx, rx) = event_channel();
    spawn_accept_loop(listener, Arc::new(SessionHandler::new(tx).echoing()))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(SessionEvent::Closed(connection)) => {
                tracing::info!(%connection, "peer disconnected");
            }
            Ok(SessionEvent::Sent { id, ok: false }) => {
                tracing::warn!(packet = %id, "echo reply not delivered");
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ctx.close();
    Ok(SUCCESS)
}
