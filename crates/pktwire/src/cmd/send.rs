use std::fs;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use pktwire_conn::{connect_with_timeout, ConnectionId};
use pktwire_frame::{PacketId, ReceivedPacket, SendPacket};

use crate::cmd::session::{event_channel, start_context, SessionEvent, SessionHandler};
use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{conn_error, frame_error, io_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_packet, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let config = args.conn.connection_config()?;
    let packet = build_packet(&args)?;

    let ctx = start_context(&args.conn)?;
    let (tx, rx) = event_channel();
    let connection = connect_with_timeout(
        &ctx,
        args.addr.as_str(),
        Some(wait_timeout),
        Arc::new(SessionHandler::new(tx)),
        config,
    )
    .map_err(|err| conn_error("connect failed", err))?;

    let id = connection.send(packet);
    tracing::debug!(packet = %id, connection = %connection.id(), "packet queued");
    let outcome = await_outcome(&rx, id, args.wait, Instant::now() + wait_timeout);

    connection.close();
    ctx.close();

    if let Some((connection, packet)) = outcome? {
        print_packet(&packet, connection, format);
    }
    Ok(SUCCESS)
}

fn build_packet(args: &SendArgs) -> CliResult<SendPacket> {
    let packet = if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        SendPacket::string(json.clone())
    } else if let Some(data) = &args.data {
        SendPacket::string(data.clone())
    } else if let Some(path) = &args.bytes {
        let data = fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        SendPacket::bytes(data)
    } else if let Some(path) = &args.file {
        SendPacket::file(path)
            .map_err(|err| frame_error(&format!("failed opening {}", path.display()), err))?
    } else {
        SendPacket::string(String::new())
    };

    Ok(match &args.header_info {
        Some(info) => packet.with_header_info(info.clone().into_bytes()),
        None => packet,
    })
}

/// Wait until packet `id` is delivered and, when `want_response` is set,
/// until one packet comes back. Events may arrive in either order.
fn await_outcome(
    rx: &Receiver<SessionEvent>,
    id: PacketId,
    want_response: bool,
    deadline: Instant,
) -> CliResult<Option<(ConnectionId, ReceivedPacket)>> {
    let mut delivered = false;
    let mut response = None;

    while !(delivered && (response.is_some() || !want_response)) {
        match rx.recv_deadline(deadline) {
            Ok(SessionEvent::Sent { id: sent, ok }) if sent == id => {
                if !ok {
                    return Err(CliError::new(FAILURE, format!("packet {id} was not delivered")));
                }
                delivered = true;
            }
            Ok(SessionEvent::Received { connection, packet }) => {
                if want_response && response.is_none() {
                    response = Some((connection, packet));
                }
            }
            Ok(SessionEvent::Closed(_)) => {
                let what = if delivered { "response" } else { "delivery" };
                return Err(CliError::new(FAILURE, format!("connection closed before {what}")));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                let what = if delivered { "response" } else { "delivery" };
                return Err(CliError::new(TIMEOUT, format!("timed out waiting for {what}")));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(FAILURE, "event channel closed"));
            }
        }
    }
    Ok(response)
}
