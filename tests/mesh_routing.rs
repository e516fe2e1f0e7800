//! Multi-node routing tests.
//!
//! Small meshes on loopback: direct links over each transport, a three-node
//! line with a node torn down, and failure notices crossing the mesh.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use receptor::{
    Delivery, FailureKind, ListenerConfig, MeshConfig, Node, NodeConfig, PeerConfig,
    ServiceConfig, TransportKind, UnitBody,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn loopback_listener(kind: TransportKind, cost: f64) -> ListenerConfig {
    let mut listener = ListenerConfig::new(kind, 0);
    listener.bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    listener.cost = cost;
    listener
}

fn peer(kind: TransportKind, addr: SocketAddr, cost: f64) -> PeerConfig {
    let mut peer = PeerConfig::new(kind, addr.to_string());
    peer.cost = cost;
    peer
}

async fn listening_node(id: &str, kind: TransportKind, cost: f64) -> (Node, SocketAddr) {
    let mut config = NodeConfig::new(id);
    config.listeners.push(loopback_listener(kind, cost));
    let node = Node::start(config).await.expect("start failed");
    let addr = node.listen_addrs()[0].addr;
    (node, addr)
}

async fn dialing_node(id: &str, peers: Vec<PeerConfig>) -> Node {
    let mut config = NodeConfig::new(id);
    config.peers = peers;
    Node::start(config).await.expect("start failed")
}

/// Tunables short enough for eviction and redial to happen within a test.
fn fast_mesh() -> MeshConfig {
    MeshConfig {
        routing_refresh: Duration::from_millis(100),
        service_refresh: Duration::from_millis(100),
        eviction_horizon: Duration::from_millis(600),
        redial_initial: Duration::from_millis(50),
        redial_max: Duration::from_millis(200),
        ..MeshConfig::default()
    }
}

async fn start_with_mesh(mut config: NodeConfig, mesh: MeshConfig) -> Node {
    config.mesh = mesh;
    Node::start(config).await.expect("start failed")
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn next_delivery(inbox: &mut mpsc::Receiver<Delivery>) -> Delivery {
    timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("no delivery")
        .expect("inbox closed")
}

fn failure_kind(delivery: &Delivery) -> FailureKind {
    match &delivery.body {
        UnitBody::Failure(failure) => failure.kind,
        other => panic!("expected failure notice, got {other:?}"),
    }
}

#[tokio::test]
async fn two_nodes_over_tcp_are_direct_next_hops() {
    let (b, addr) = listening_node("b", TransportKind::Tcp, 2.5).await;
    let a = dialing_node("a", vec![peer(TransportKind::Tcp, addr, 2.5)]).await;

    wait_until("a to route to b", || a.routes().lookup("b").is_some()).await;
    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;

    let routes = a.routes();
    let route = routes.lookup("b").expect("route a->b");
    assert_eq!(route.next_hop, "b");
    assert_eq!(route.cost, 2.5);
    assert_eq!(route.hops, 1);

    let routes = b.routes();
    let route = routes.lookup("a").expect("route b->a");
    assert_eq!(route.next_hop, "a");
    assert_eq!(route.cost, 2.5);

    let peers = a.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, "b");
    assert_eq!(peers[0].kind, TransportKind::Tcp);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn listener_nodecost_overrides_link_cost() {
    let mut config = NodeConfig::new("b");
    let mut listener = loopback_listener(TransportKind::Ws, 1.0);
    listener.node_cost.insert("a".into(), 4.0);
    config.listeners.push(listener);
    let b = Node::start(config).await.expect("start failed");
    let addr = b.listen_addrs()[0].addr;
    let a = dialing_node("a", vec![peer(TransportKind::Ws, addr, 4.0)]).await;

    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;
    assert_eq!(b.routes().lookup("a").expect("route").cost, 4.0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn line_topology_routes_through_middle_and_fails_without_it() {
    let (b, addr) = listening_node("b", TransportKind::Tcp, 1.0).await;
    let a = dialing_node("a", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;
    let c = dialing_node("c", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;

    let mut inbox = c
        .register_service("inbox", BTreeMap::new())
        .await
        .expect("register failed");
    let mut client = a
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    wait_until("a to route to c", || a.routes().lookup("c").is_some()).await;
    let routes = a.routes();
    let route = routes.lookup("c").expect("route a->c");
    assert_eq!(route.next_hop, "b");
    assert_eq!(route.cost, 2.0);
    assert_eq!(route.hops, 2);

    // Stable route: delivered exactly once.
    a.send("client", "c", "inbox", b"over the line".to_vec())
        .await
        .expect("send failed");
    let delivery = next_delivery(&mut inbox).await;
    assert_eq!(delivery.src_node, "a");
    assert_eq!(delivery.src_service, "client");
    assert_eq!(delivery.body, UnitBody::Data(b"over the line".to_vec()));
    assert!(
        timeout(Duration::from_millis(300), inbox.recv()).await.is_err(),
        "message delivered twice"
    );

    b.shutdown().await;
    wait_until("a to lose c", || a.routes().lookup("c").is_none()).await;

    a.send("client", "c", "inbox", b"lost".to_vec())
        .await
        .expect("send failed");
    let notice = next_delivery(&mut client).await;
    assert_eq!(failure_kind(&notice), FailureKind::NoRoute);
    assert!(a.status().counters.no_route >= 1);

    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn missing_remote_service_reports_unreachable() {
    let (b, addr) = listening_node("b", TransportKind::Tcp, 1.0).await;
    let a = dialing_node("a", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;
    let mut client = a
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    wait_until("a to route to b", || a.routes().lookup("b").is_some()).await;
    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;

    a.send("client", "b", "ghost", b"anyone?".to_vec())
        .await
        .expect("send failed");
    let notice = next_delivery(&mut client).await;
    assert_eq!(notice.src_node, "b");
    match notice.body {
        UnitBody::Failure(failure) => {
            assert_eq!(failure.kind, FailureKind::UnreachableService);
            assert_eq!(failure.service, "ghost");
            assert_eq!(failure.node, "b");
        }
        other => panic!("expected failure notice, got {other:?}"),
    }
    assert_eq!(b.status().counters.unreachable_service, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn echo_over_udp() {
    let mut config = NodeConfig::new("b");
    config.listeners.push(loopback_listener(TransportKind::Udp, 1.0));
    let tokens = vec!["name=echo".to_string(), "sink=echo".to_string()];
    config.services.push(ServiceConfig::parse(&tokens).expect("service config"));
    let b = Node::start(config).await.expect("start failed");
    let addr = b.listen_addrs()[0].addr;

    let a = dialing_node("a", vec![peer(TransportKind::Udp, addr, 1.0)]).await;
    let mut client = a
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;
    wait_until("a to learn b's echo", || a.resolve_service("echo").is_some()).await;

    a.send_to_service("client", "echo", b"marco".to_vec())
        .await
        .expect("send failed");
    let reply = next_delivery(&mut client).await;
    assert_eq!(reply.src_node, "b");
    assert_eq!(reply.body, UnitBody::Echo(b"marco".to_vec()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn service_resolution_prefers_cheaper_node() {
    let mut config = NodeConfig::new("hub");
    let mut listener = loopback_listener(TransportKind::Tcp, 1.0);
    listener.node_cost.insert("far".into(), 5.0);
    config.listeners.push(listener);
    let hub = Node::start(config).await.expect("start failed");
    let addr = hub.listen_addrs()[0].addr;
    let near = dialing_node("near", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;
    let far = dialing_node("far", vec![peer(TransportKind::Tcp, addr, 5.0)]).await;
    let _near_rx = near
        .register_service("db", BTreeMap::new())
        .await
        .expect("register failed");
    let _far_rx = far
        .register_service("db", BTreeMap::new())
        .await
        .expect("register failed");

    wait_until("hub to see both advertisers", || {
        hub.services()
            .entries
            .get("db")
            .is_some_and(|nodes| nodes.len() == 2)
    })
    .await;
    wait_until("hub to route to both", || {
        let routes = hub.routes();
        routes.lookup("near").is_some() && routes.lookup("far").is_some_and(|r| r.cost == 5.0)
    })
    .await;
    assert_eq!(hub.resolve_service("db").expect("resolved").node, "near");

    near.shutdown().await;
    far.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn hop_limit_enforced_along_path() {
    let mut config = NodeConfig::new("b");
    config.listeners.push(loopback_listener(TransportKind::Tcp, 1.0));
    let b = start_with_mesh(config, MeshConfig { max_hops: 1, ..MeshConfig::default() }).await;
    let addr = b.listen_addrs()[0].addr;
    let a = dialing_node("a", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;
    let c = dialing_node("c", vec![peer(TransportKind::Tcp, addr, 1.0)]).await;
    let mut inbox = c
        .register_service("inbox", BTreeMap::new())
        .await
        .expect("register failed");
    let mut client = a
        .register_service("client", BTreeMap::new())
        .await
        .expect("register failed");

    wait_until("a to route to c", || a.routes().lookup("c").is_some()).await;
    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;

    a.send("client", "c", "inbox", b"too far".to_vec())
        .await
        .expect("send failed");
    let notice = next_delivery(&mut client).await;
    assert_eq!(notice.src_node, "b");
    assert_eq!(failure_kind(&notice), FailureKind::HopLimitExceeded);
    assert_eq!(b.status().counters.hop_limit_exceeded, 1);
    assert!(
        timeout(Duration::from_millis(300), inbox.recv()).await.is_err(),
        "message crossed the hop limit"
    );

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn silent_origin_evicted_with_its_services() {
    let mut config = NodeConfig::new("b");
    config.listeners.push(loopback_listener(TransportKind::Tcp, 1.0));
    let b = start_with_mesh(config, fast_mesh()).await;
    let addr = b.listen_addrs()[0].addr;

    let mut config = NodeConfig::new("a");
    config.peers.push(peer(TransportKind::Tcp, addr, 1.0));
    let a = start_with_mesh(config, fast_mesh()).await;
    let mut config = NodeConfig::new("c");
    config.peers.push(peer(TransportKind::Tcp, addr, 1.0));
    config.services.push(
        ServiceConfig::parse(&["name=store".to_string(), "sink=discard".to_string()])
            .expect("service config"),
    );
    let c = start_with_mesh(config, fast_mesh()).await;

    wait_until("a to learn c and its service", || {
        a.graph().contains_key("c") && a.resolve_service("store").is_some()
    })
    .await;

    c.shutdown().await;
    wait_until("a to evict c", || {
        !a.graph().contains_key("c") && !a.services().entries.contains_key("store")
    })
    .await;
    assert!(a.routes().lookup("c").is_none());
    // Live origins keep refreshing and survive the sweep.
    assert!(a.graph().contains_key("b"));
    assert!(a.routes().lookup("b").is_some());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dialer_reconnects_after_peer_restart() {
    let mut config = NodeConfig::new("b");
    config.listeners.push(loopback_listener(TransportKind::Tcp, 1.0));
    let b = start_with_mesh(config.clone(), fast_mesh()).await;
    let addr = b.listen_addrs()[0].addr;

    let mut dialer = NodeConfig::new("a");
    dialer.peers.push(peer(TransportKind::Tcp, addr, 1.0));
    let a = start_with_mesh(dialer, fast_mesh()).await;
    wait_until("a to route to b", || a.routes().lookup("b").is_some()).await;

    b.shutdown().await;
    wait_until("a to lose b", || a.peers().is_empty()).await;

    config.listeners[0].port = addr.port();
    let b = start_with_mesh(config, fast_mesh()).await;
    wait_until("a to redial b", || {
        a.peers().iter().any(|p| p.node_id == "b") && a.routes().lookup("b").is_some()
    })
    .await;
    wait_until("b to route to a", || b.routes().lookup("a").is_some()).await;

    a.shutdown().await;
    b.shutdown().await;
}
