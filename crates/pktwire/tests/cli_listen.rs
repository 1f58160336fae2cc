#![cfg(all(unix, feature = "cli"))]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn free_addr() -> SocketAddr {
    let scratch = TcpListener::bind("127.0.0.1:0").expect("scratch listener should bind");
    scratch.local_addr().expect("scratch listener should have addr")
}

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "pktwire-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_listener(addr: SocketAddr, timeout: Duration) {
    let start = Instant::now();
    loop {
        if std::net::TcpStream::connect(addr).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("listener at {addr} never came up");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn send(addr: SocketAddr, extra: &[&str]) {
    let status = Command::new(env!("CARGO_BIN_EXE_pktwire"))
        .arg("--log-level")
        .arg("error")
        .arg("send")
        .arg(addr.to_string())
        .args(extra)
        .status()
        .expect("send should run");
    assert!(status.success());
}

#[test]
fn listen_prints_count_packets_then_exits() {
    let addr = free_addr();
    let listen = Command::new(env!("CARGO_BIN_EXE_pktwire"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("listen")
        .arg(addr.to_string())
        .arg("--count")
        .arg("2")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen should start");
    wait_for_listener(addr, Duration::from_secs(3));

    send(addr, &["--data", "first"]);
    send(addr, &["--data", "second"]);

    let output = listen.wait_with_output().expect("listen should exit");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let payloads: Vec<String> = stdout
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("line should be json");
            value["payload"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(payloads, ["first", "second"]);
}

#[test]
fn listen_saves_file_packets() {
    let dir = unique_temp_dir("files");
    let source = dir.join("report.txt");
    std::fs::write(&source, b"file packet contents").expect("source should be writable");
    let inbox = dir.join("inbox");

    let addr = free_addr();
    let listen = Command::new(env!("CARGO_BIN_EXE_pktwire"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("raw")
        .arg("listen")
        .arg(addr.to_string())
        .arg("--count")
        .arg("1")
        .arg("--save-dir")
        .arg(&inbox)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen should start");
    wait_for_listener(addr, Duration::from_secs(3));

    let source_arg = source.to_string_lossy().into_owned();
    send(addr, &["--file", &source_arg, "--header-info", "saved.txt"]);

    let output = listen.wait_with_output().expect("listen should exit");
    assert!(output.status.success());
    let saved = inbox.join("saved.txt");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), saved.display().to_string());
    assert_eq!(
        std::fs::read(&saved).expect("saved file should exist"),
        b"file packet contents"
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_reports_crate_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_pktwire"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("pktwire {}", env!("CARGO_PKG_VERSION")));
}
