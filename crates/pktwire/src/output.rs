use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use pktwire_conn::ConnectionId;
use pktwire_frame::{Entity, ReceivedPacket};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput {
    connection: String,
    kind: String,
    length: u64,
    header_info: Option<String>,
    payload: String,
    timestamp: String,
}

pub fn print_packet(packet: &ReceivedPacket, connection: ConnectionId, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PacketOutput {
                connection: connection.to_string(),
                kind: packet.kind.to_string(),
                length: packet.length,
                header_info: packet.header_info.as_deref().map(preview),
                payload: entity_preview(&packet.entity),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "SIZE", "CONNECTION", "PAYLOAD"])
                .add_row(vec![
                    packet.kind.to_string(),
                    packet.length.to_string(),
                    connection.to_string(),
                    entity_preview(&packet.entity),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "kind={} size={} connection={} payload={}",
                packet.kind,
                packet.length,
                connection,
                entity_preview(&packet.entity)
            );
        }
        OutputFormat::Raw => match &packet.entity {
            Entity::Bytes(data) => print_raw(data),
            Entity::String(text) => print_raw(text.as_bytes()),
            Entity::File(path) => println!("{}", path.display()),
            Entity::Stream => {}
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn entity_preview(entity: &Entity) -> String {
    match entity {
        Entity::Bytes(data) => preview(data),
        Entity::String(text) => text.clone(),
        Entity::File(path) => path.display().to_string(),
        Entity::Stream => "<stream>".to_string(),
    }
}

fn preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", data.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn previews_by_entity() {
        assert_eq!(entity_preview(&Entity::String("hi".into())), "hi");
        assert_eq!(entity_preview(&Entity::Bytes(vec![0xff, 0xfe].into())), "<binary 2 bytes>");
        assert_eq!(entity_preview(&Entity::File(PathBuf::from("/tmp/x"))), "/tmp/x");
        assert_eq!(entity_preview(&Entity::Stream), "<stream>");
    }
}
