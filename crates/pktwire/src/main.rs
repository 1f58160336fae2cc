mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "pktwire", version, about = "Framed packet transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "PKTWIRE_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "pktwire",
            "send",
            "127.0.0.1:7070",
            "--data",
            "hello",
            "--header-info",
            "greeting",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.addr, "127.0.0.1:7070");
                assert_eq!(args.header_info.as_deref(), Some("greeting"));
                assert_eq!(args.conn.buffer_size, 4096);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "pktwire",
            "send",
            "127.0.0.1:7070",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_listen_with_stealing_reactor() {
        let cli = Cli::try_parse_from([
            "pktwire",
            "listen",
            "127.0.0.1:0",
            "--count",
            "3",
            "--stealing",
            "2",
            "--idle-timeout",
            "500ms",
        ])
        .expect("listen args should parse");
        match cli.command {
            Command::Listen(args) => {
                assert_eq!(args.count, Some(3));
                assert_eq!(args.conn.stealing, Some(2));
                assert_eq!(args.conn.idle_timeout.as_deref(), Some("500ms"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_level_accepts_off() {
        let cli = Cli::try_parse_from(["pktwire", "--log-level", "off", "version"])
            .expect("version args should parse");
        assert!(matches!(cli.log_level, LogLevel::Off));
        assert!(matches!(cli.command, Command::Version(_)));
    }
}
