use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command;
use predicates::prelude::*;

/// Listeners must be up within this long after process start.
const READY_TIMEOUT: Duration = Duration::from_secs(2);

const COSTS: [&str; 6] = ["1", "1.5", "1.0", "0.2", "52", "23"];
const NODE_COSTS: [&str; 4] = [
    "{}",
    r#"{"a": 1}"#,
    r#"{"a": 1.1}"#,
    r#"{"a": 1.3, "b": 5.6, "c": 0.2}"#,
];
const LISTENER_FLAGS: [&str; 3] = ["--tcp-listener", "--ws-listener", "--udp-listener"];

fn receptor() -> Command {
    let mut cmd = Command::cargo_bin("receptor").expect("receptor binary");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Running daemon, killed on drop.
struct Daemon {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(level: &str, args: &[&str]) -> Daemon {
    let mut child = std::process::Command::cargo_bin("receptor")
        .expect("receptor binary")
        .env_remove("RUST_LOG")
        .args(["--log-level", level])
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn receptor");
    let stderr = child.stderr.take().expect("piped stderr");
    let (tx, lines) = mpsc::channel();
    // Keeps draining after the test stops listening so the daemon never
    // blocks on a full pipe.
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });
    Daemon { child, lines }
}

/// Next log line containing `needle`.
fn wait_for_line(daemon: &Daemon, needle: &str) -> String {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = daemon
            .lines
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("no {needle:?} log line in time"));
        if line.contains(needle) {
            return line;
        }
    }
}

/// Waits for a `listener ready` log line and returns its kind and address.
fn wait_for_listener(daemon: &Daemon) -> (String, SocketAddr) {
    let line = wait_for_line(daemon, "listener ready");
    let field = |name: &str| {
        line.split_whitespace()
            .find_map(|token| token.strip_prefix(name))
            .map(str::to_string)
            .expect("field in listener log line")
    };
    let addr = field("addr=").parse().expect("listener address");
    (field("kind="), addr)
}

/// Whether the kernel socket table shows `port` bound for `kind`. `None`
/// where `/proc/net` is unavailable.
fn socket_table_lists(kind: &str, port: u16) -> Option<bool> {
    let tables: &[&str] = match kind {
        "udp" => &["/proc/net/udp", "/proc/net/udp6"],
        _ => &["/proc/net/tcp", "/proc/net/tcp6"],
    };
    let mut readable = false;
    for table in tables {
        let Ok(contents) = std::fs::read_to_string(table) else {
            continue;
        };
        readable = true;
        for row in contents.lines().skip(1) {
            let fields: Vec<&str> = row.split_whitespace().collect();
            let (Some(local), Some(state)) = (fields.get(1), fields.get(3)) else {
                continue;
            };
            let Some(Ok(bound)) = local.rsplit(':').next().map(|p| u16::from_str_radix(p, 16)) else {
                continue;
            };
            // 0A is TCP LISTEN; UDP has no listening state.
            if bound == port && (kind == "udp" || *state == "0A") {
                return Some(true);
            }
        }
    }
    readable.then_some(false)
}

fn assert_listening(kind: &str, addr: SocketAddr) {
    let port = addr.port();
    assert!(port > 0, "ephemeral port was not resolved");
    if let Some(listed) = socket_table_lists(kind, port) {
        assert!(listed, "{kind} port {port} missing from the socket table");
    }
    match kind {
        "tcp" | "ws" => {
            TcpStream::connect(("127.0.0.1", port)).expect("listener refused connection");
        }
        "udp" => {
            assert!(
                UdpSocket::bind(("0.0.0.0", port)).is_err(),
                "udp port {port} is not bound"
            );
        }
        other => panic!("unexpected listener kind {other}"),
    }
}

fn assert_starts_listening(flag: &str, options: &[&str]) {
    let mut args = vec!["--node", "id=test", flag, "port=0"];
    args.extend_from_slice(options);
    let daemon = spawn_daemon("info", &args);
    let (kind, addr) = wait_for_listener(&daemon);
    assert_eq!(format!("--{kind}-listener"), flag);
    assert_listening(&kind, addr);
}

#[test]
fn help_arg_prints_help() {
    receptor()
        .arg("--help")
        .assert()
        .stdout(predicate::str::contains("--tcp-listener"))
        .success();
}

#[test]
fn version_arg_prints_version() {
    receptor()
        .arg("--version")
        .assert()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .success();
}

#[test]
fn missing_node_causes_failure() {
    receptor().args(["--tcp-listener", "port=0"]).assert().failure();
}

#[test]
fn negative_cost_prints_single_error_line() {
    for flag in LISTENER_FLAGS {
        receptor()
            .args(["--node", "id=test", flag, "port=0", "cost=-1"])
            .assert()
            .stdout("Error: connection cost must be positive\n")
            .failure();
    }
}

#[test]
fn zero_peer_cost_rejected() {
    receptor()
        .args(["--node", "id=test", "--peer", "address=127.0.0.1:1", "cost=0"])
        .assert()
        .stdout("Error: connection cost must be positive\n")
        .failure();
}

#[test]
fn malformed_option_rejected() {
    receptor()
        .args(["--node", "id=test", "--tcp-listener", "port"])
        .assert()
        .stdout(predicate::str::starts_with("Error: "))
        .failure();
}

#[test]
fn tcp_listener_with_port_zero_listens() {
    assert_starts_listening("--tcp-listener", &[]);
}

#[test]
fn listeners_accept_costs() {
    for flag in LISTENER_FLAGS {
        for cost in COSTS {
            let option = format!("cost={cost}");
            assert_starts_listening(flag, &[option.as_str()]);
        }
    }
}

#[test]
fn listeners_accept_nodecosts() {
    for flag in LISTENER_FLAGS {
        for nodecost in NODE_COSTS {
            let option = format!("nodecost={nodecost}");
            assert_starts_listening(flag, &[option.as_str()]);
        }
    }
}

#[test]
fn repeated_listener_flags_open_separate_listeners() {
    let daemon = spawn_daemon(
        "info",
        &["--node", "id=test", "--tcp-listener", "port=0", "--tcp-listener", "port=0", "cost=2"],
    );
    let (_, first) = wait_for_listener(&daemon);
    let (_, second) = wait_for_listener(&daemon);
    assert_ne!(first.port(), second.port());
    assert_listening("tcp", first);
    assert_listening("tcp", second);
}

#[test]
fn unused_nodecost_entries_logged_at_debug() {
    let daemon = spawn_daemon(
        "debug",
        &["--node", "id=test", "--udp-listener", "port=0", r#"nodecost={"ghost": 2.5}"#],
    );
    let line = wait_for_line(&daemon, "nodecost entries unused");
    assert!(line.contains("ghost"), "unexpected log line: {line}");
}
