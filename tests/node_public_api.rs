//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node facade
//! over real loopback sockets: startup, local services, the control API and
//! shutdown.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use receptor::{
    ControlConfig, FailureKind, ListenerConfig, MeshConfig, Node, NodeConfig, ServiceConfig,
    TransportKind, UnitBody,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

fn loopback_listener(kind: TransportKind) -> ListenerConfig {
    let mut listener = ListenerConfig::new(kind, 0);
    listener.bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    listener
}

fn service(tokens: &[&str]) -> ServiceConfig {
    let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    ServiceConfig::parse(&tokens).expect("service config")
}

#[tokio::test]
async fn node_start_and_identity() {
    let mut config = NodeConfig::new("alpha");
    config.listeners.push(loopback_listener(TransportKind::Tcp));
    config.listeners.push(loopback_listener(TransportKind::Udp));
    config.listeners.push(loopback_listener(TransportKind::Ws));
    let node = Node::start(config).await.expect("start failed");

    assert_eq!(node.node_id(), "alpha");
    let addrs = node.listen_addrs();
    assert_eq!(addrs.len(), 3);
    assert_eq!(addrs[0].kind, TransportKind::Tcp);
    assert_eq!(addrs[1].kind, TransportKind::Udp);
    assert_eq!(addrs[2].kind, TransportKind::Ws);
    assert!(addrs.iter().all(|a| a.addr.port() > 0), "ports should be resolved");

    // Bound before start returned.
    TcpStream::connect(addrs[0].addr).await.expect("tcp listener not accepting");
    TcpStream::connect(addrs[2].addr).await.expect("ws listener not accepting");

    timeout(TEST_TIMEOUT, node.shutdown()).await.expect("shutdown hung");
}

#[tokio::test]
async fn invalid_configuration_rejected() {
    let mut config = NodeConfig::new("alpha");
    let mut listener = loopback_listener(TransportKind::Udp);
    listener.cost = -1.0;
    config.listeners.push(listener);
    let err = Node::start(config).await.err().expect("negative cost accepted");
    assert_eq!(err.to_string(), "connection cost must be positive");

    let config = NodeConfig::new("has space");
    assert!(Node::start(config).await.is_err());
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let mut config = NodeConfig::new("first");
    config.listeners.push(loopback_listener(TransportKind::Tcp));
    let first = Node::start(config).await.expect("start failed");
    let taken = first.listen_addrs()[0].addr;

    let mut config = NodeConfig::new("second");
    let mut listener = loopback_listener(TransportKind::Tcp);
    listener.port = taken.port();
    config.listeners.push(listener);
    let err = Node::start(config).await.err().expect("port conflict accepted");
    assert!(format!("{err:#}").contains("failed to bind tcp listener"));

    first.shutdown().await;
}

#[tokio::test]
async fn local_echo_service_round_trip() {
    let mut config = NodeConfig::new("alpha");
    config.services.push(service(&["name=echo", "sink=echo", "tag:role=test"]));
    let node = Node::start(config).await.expect("start failed");
    let mut inbox = node
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    let id = node
        .send("client", "alpha", "echo", b"ping".to_vec())
        .await
        .expect("send failed");
    let reply = timeout(SHORT_TIMEOUT, inbox.recv())
        .await
        .expect("no echo reply")
        .expect("inbox closed");
    assert_eq!(reply.src_node, "alpha");
    assert_eq!(reply.src_service, "echo");
    assert_ne!(reply.message_id, id);
    assert_eq!(reply.body, UnitBody::Echo(b"ping".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn local_missing_service_reports_failure() {
    let node = Node::start(NodeConfig::new("alpha")).await.expect("start failed");
    let mut inbox = node
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    node.send("client", "alpha", "ghost", b"x".to_vec())
        .await
        .expect("send failed");
    let notice = timeout(SHORT_TIMEOUT, inbox.recv())
        .await
        .expect("no failure notice")
        .expect("inbox closed");
    match notice.body {
        UnitBody::Failure(failure) => {
            assert_eq!(failure.kind, FailureKind::UnreachableService);
            assert_eq!(failure.service, "ghost");
        }
        other => panic!("expected failure notice, got {other:?}"),
    }
    assert_eq!(node.status().counters.unreachable_service, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn duplicate_service_registration_fails() {
    let node = Node::start(NodeConfig::new("alpha")).await.expect("start failed");
    node.register_service("inbox", BTreeMap::new())
        .await
        .expect("first registration failed");
    assert!(node.register_service("inbox", BTreeMap::new()).await.is_err());
    assert!(node.register_service("bad name", BTreeMap::new()).await.is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn local_services_resolve_locally() {
    let mut config = NodeConfig::new("alpha");
    config.services.push(service(&["name=logger", "sink=log"]));
    let node = Node::start(config).await.expect("start failed");

    timeout(SHORT_TIMEOUT, async {
        while node.resolve_service("logger").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("service never appeared in the directory");

    let resolved = node.resolve_service("logger").expect("resolved");
    assert_eq!(resolved.node, "alpha");
    assert_eq!(resolved.cost, 0.0);
    assert!(node.resolve_service("nothing").is_none());
    assert!(node.send_to_service("client", "nothing", vec![]).await.is_err());

    node.shutdown().await;
}

async fn ask(
    write: &mut OwnedWriteHalf,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    command: &str,
) -> serde_json::Value {
    write
        .write_all(format!("{command}\n").as_bytes())
        .await
        .expect("write failed");
    let line = timeout(SHORT_TIMEOUT, lines.next_line())
        .await
        .expect("no response")
        .expect("read failed")
        .expect("connection closed");
    serde_json::from_str(&line).expect("response is not json")
}

#[tokio::test]
async fn control_api_answers_json_lines() {
    let mut config = NodeConfig::new("alpha");
    config.listeners.push(loopback_listener(TransportKind::Tcp));
    config.control.push(ControlConfig {
        port: Some(0),
        filename: None,
    });
    let node = Node::start(config).await.expect("start failed");
    let control = node.control_addrs()[0];
    assert!(control.ip().is_loopback());

    let stream = TcpStream::connect(control).await.expect("control connect failed");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let status = ask(&mut write, &mut lines, "status").await;
    assert_eq!(status["node_id"], "alpha");
    assert_eq!(status["listeners"][0]["kind"], "tcp");
    assert!(status["counters"]["no_route"].is_u64());

    let config = ask(&mut write, &mut lines, "config").await;
    assert_eq!(config["node_id"], "alpha");

    let routes = ask(&mut write, &mut lines, "routes").await;
    assert!(routes["routes"].as_object().expect("routes object").is_empty());

    assert!(ask(&mut write, &mut lines, "peers").await.as_array().expect("peers array").is_empty());
    assert!(ask(&mut write, &mut lines, "graph").await["alpha"].is_object());

    let unknown = ask(&mut write, &mut lines, "reboot").await;
    assert!(unknown["error"].as_str().expect("error string").contains("reboot"));

    // Connection survives an unknown command.
    assert!(ask(&mut write, &mut lines, "services").await["entries"].is_object());

    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_bounded() {
    let mut config = NodeConfig::new("alpha");
    config.listeners.push(loopback_listener(TransportKind::Tcp));
    config.listeners.push(loopback_listener(TransportKind::Udp));
    let node = Node::start(config).await.expect("start failed");
    let addr = node.listen_addrs()[0].addr;

    // An idle client that never handshakes must not stall shutdown.
    let _idle = TcpStream::connect(addr).await.expect("connect failed");
    timeout(TEST_TIMEOUT, node.shutdown()).await.expect("shutdown hung");
}

/// A length-prefixed handshake frame as a TCP peer would send it.
fn handshake_bytes(node_id: &str) -> Vec<u8> {
    let mut body = vec![0x01];
    body.extend_from_slice(format!("receptor/1 id={node_id}\n").as_bytes());
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

#[tokio::test]
async fn silent_peer_closed_after_idle_timeout() {
    let mut config = NodeConfig::new("alpha");
    config.listeners.push(loopback_listener(TransportKind::Tcp));
    config.mesh = MeshConfig {
        keepalive_interval: Duration::from_millis(100),
        ..MeshConfig::default()
    };
    let node = Node::start(config).await.expect("start failed");
    let addr = node.listen_addrs()[0].addr;

    // Handshakes, then never sends another frame.
    let mut mute = TcpStream::connect(addr).await.expect("connect failed");
    mute.write_all(&handshake_bytes("mute")).await.expect("write failed");

    timeout(SHORT_TIMEOUT, async {
        while !node.peers().iter().any(|p| p.node_id == "mute") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never established");

    timeout(SHORT_TIMEOUT, async {
        while !node.peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle session was not closed");

    node.shutdown().await;
}
