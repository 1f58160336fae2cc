use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use pktwire_conn::ConnectionConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod session;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an echo server.
    Echo(EchoArgs),
    /// Send a single packet.
    Send(SendArgs),
    /// Listen and print received packets.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Connection tuning shared by every networked command.
#[derive(Args, Debug, Clone)]
pub struct ConnArgs {
    /// Transfer buffer size in bytes, both directions.
    #[arg(long, default_value_t = pktwire_transport::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Packets whose frames may interleave on the wire.
    #[arg(long, default_value_t = 1)]
    pub max_in_flight: usize,
    /// Send a heartbeat after this much silence (e.g. 5s, 500ms).
    #[arg(long)]
    pub idle_timeout: Option<String>,
    /// Use the work-stealing reactor with this many workers.
    #[arg(long, value_name = "N")]
    pub stealing: Option<usize>,
}

impl ConnArgs {
    pub fn connection_config(&self) -> CliResult<ConnectionConfig> {
        if self.buffer_size == 0 {
            return Err(CliError::new(USAGE, "--buffer-size must be greater than zero"));
        }
        let idle_timeout = self.idle_timeout.as_deref().map(parse_duration).transpose()?;
        Ok(ConnectionConfig {
            send_buffer_size: self.buffer_size,
            receive_buffer_size: self.buffer_size,
            max_in_flight_packets: self.max_in_flight,
            idle_timeout,
            ..ConnectionConfig::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to bind (e.g. 127.0.0.1:7070).
    pub addr: String,
    #[command(flatten)]
    pub conn: ConnArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to.
    pub addr: String,
    /// JSON payload, sent as a string packet.
    #[arg(long, conflicts_with_all = ["data", "bytes", "file"])]
    pub json: Option<String>,
    /// String payload.
    #[arg(long, conflicts_with_all = ["json", "bytes", "file"])]
    pub data: Option<String>,
    /// Byte payload, read from this path into memory.
    #[arg(long, conflicts_with_all = ["json", "data", "file"])]
    pub bytes: Option<PathBuf>,
    /// Send this file as a file packet.
    #[arg(long, conflicts_with_all = ["json", "data", "bytes"])]
    pub file: Option<PathBuf>,
    /// Header info attached to the packet.
    #[arg(long)]
    pub header_info: Option<String>,
    /// Wait for one response packet and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for delivery and response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    #[command(flatten)]
    pub conn: ConnArgs,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind.
    pub addr: String,
    /// Exit after receiving N packets.
    #[arg(long)]
    pub count: Option<usize>,
    /// Accept file packets into this directory.
    #[arg(long, value_name = "DIR")]
    pub save_dir: Option<PathBuf>,
    #[command(flatten)]
    pub conn: ConnArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn conn_args_build_config() {
        let args = ConnArgs {
            buffer_size: 1024,
            max_in_flight: 3,
            idle_timeout: Some("250ms".into()),
            stealing: None,
        };
        let config = args.connection_config().expect("config should build");
        assert_eq!(config.send_buffer_size, 1024);
        assert_eq!(config.receive_buffer_size, 1024);
        assert_eq!(config.max_in_flight_packets, 3);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
    }
}
