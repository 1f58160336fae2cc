use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::cmd::session::{
    bind, event_channel, install_ctrlc_handler, spawn_accept_loop, start_context, SessionEvent,
    SessionHandler,
};
use crate::cmd::ListenArgs;
use crate::exit::{io_error, CliResult, SUCCESS};
use crate::output::{print_packet, OutputFormat};

const TICK: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    if let Some(dir) = &args.save_dir {
        std::fs::create_dir_all(dir)
            .map_err(|err| io_error(&format!("failed creating {}", dir.display()), err))?;
    }
    let config = args.conn.connection_config()?;
    let ctx = start_context(&args.conn)?;
    let listener = bind(&ctx, &args.addr, config)?;

    let (tx, rx) = event_channel();
    let handler = SessionHandler::new(tx).with_save_dir(args.save_dir.clone());
    spawn_accept_loop(listener, Arc::new(handler))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(SessionEvent::Received { connection, packet }) => {
                print_packet(&packet, connection, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Ok(SessionEvent::Closed(connection)) => {
                tracing::info!(%connection, "peer disconnected");
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ctx.close();
    Ok(SUCCESS)
}
