//! # High-Level Node API
//!
//! A [`Node`] wires the components of a mesh router together and owns their
//! tasks.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = NodeConfig::new("alpha");
//! config.listeners.push(ListenerConfig::new(TransportKind::Tcp, 0));
//! config.peers.push(PeerConfig::new(TransportKind::Tcp, "10.0.0.2:4000"));
//!
//! let node = Node::start(config).await?;
//! let mut inbox = node.register_service("inbox", BTreeMap::new()).await?;
//! node.send("inbox", "beta", "echo", b"hello".to_vec()).await?;
//! while let Some(delivery) = inbox.recv().await {
//!     println!("{:?}", delivery.body);
//! }
//! node.shutdown().await;
//! ```
//!
//! ## Component Integration
//!
//! - **Listeners**: one accept loop per configured listener; links feed
//!   inbound sessions
//! - **Dialers**: one redial supervisor per configured peer
//! - **Router**: routing core actor (graph, gossip, forwarding table)
//! - **Dispatcher**: unit-message forwarding and local delivery
//! - **Control**: loopback JSON-lines inspection endpoints
//!
//! ## Startup Order
//!
//! All listener and control sockets are bound before any task is spawned, so
//! a bind failure aborts startup without leaving half a node running.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, TransportKind};
use crate::control::ControlListener;
use crate::dispatch::Dispatcher;
use crate::messages::{is_valid_node_id, is_valid_service_name, NodeId};
use crate::router::Router;
use crate::routing::{ForwardingTable, GraphSnapshot};
use crate::services::{Delivery, Resolution, ServiceDirectory, ServiceRegistry, Sink};
use crate::session::{
    run_dialer, spawn_session, CostPolicy, Direction, PeerInfo, SessionContext, SessionRegistry,
};
use crate::telemetry::{Counters, CountersSnapshot};
use crate::transport::{Link, Listener};

/// Upper bound on waiting for tasks during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepted links waiting for a session task.
const LINK_INTAKE_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListenAddr {
    pub kind: TransportKind,
    pub addr: SocketAddr,
}

/// Everything the control API reports.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub uptime_secs: u64,
    pub listeners: Vec<ListenAddr>,
    pub peers: Vec<PeerInfo>,
    pub routes: ForwardingTable,
    pub services: ServiceDirectory,
    pub local_services: BTreeMap<String, BTreeMap<String, String>>,
    pub counters: CountersSnapshot,
}

/// Read side of a running node, shared with the control servers.
pub struct NodeShared {
    config: NodeConfig,
    started: std::time::Instant,
    listen_addrs: Vec<ListenAddr>,
    registry: SessionRegistry,
    router: Router,
    services: Arc<ServiceRegistry>,
    counters: Arc<Counters>,
}

impl NodeShared {
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn listen_addrs(&self) -> &[ListenAddr] {
        &self.listen_addrs
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry.sessions().iter().map(|s| s.info()).collect()
    }

    pub fn routes(&self) -> Arc<ForwardingTable> {
        self.router.view().routes.clone()
    }

    pub fn graph(&self) -> Arc<GraphSnapshot> {
        self.router.view().graph.clone()
    }

    pub fn services(&self) -> Arc<ServiceDirectory> {
        self.router.view().services.clone()
    }

    pub fn status(&self) -> NodeStatus {
        let view = self.router.view();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            listeners: self.listen_addrs.clone(),
            peers: self.peers(),
            routes: (*view.routes).clone(),
            services: (*view.services).clone(),
            local_services: self.services.listing(),
            counters: self.counters.snapshot(),
        }
    }
}

pub struct Node {
    shared: Arc<NodeShared>,
    dispatcher: Arc<Dispatcher>,
    control_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Node {
    /// Validates `config`, binds every socket, then starts all tasks.
    ///
    /// # Errors
    /// Returns the configuration error as-is, or a bind failure with the
    /// offending address as context.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            let bound = Listener::bind(listener).await.with_context(|| {
                format!(
                    "failed to bind {} listener on {}:{}",
                    listener.kind, listener.bind_addr, listener.port
                )
            })?;
            if !listener.node_cost.is_empty() {
                let nodes: Vec<&str> = listener.node_cost.keys().map(String::as_str).collect();
                debug!(
                    kind = %listener.kind,
                    addr = %bound.local_addr(),
                    ?nodes,
                    "nodecost entries unused until a matching peer connects"
                );
            }
            listeners.push(bound);
        }
        let mut controls = Vec::new();
        for control in &config.control {
            controls.extend(ControlListener::bind(control).await?);
        }

        let local = config.node_id.clone();
        let mesh = Arc::new(config.mesh.clone());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());
        let registry = SessionRegistry::new(local.clone());
        let router = Router::spawn(
            local.clone(),
            mesh.clone(),
            registry.clone(),
            counters.clone(),
            cancel.child_token(),
            &tracker,
        );
        let services = Arc::new(ServiceRegistry::default());
        let dispatcher = Arc::new(Dispatcher::new(
            local.clone(),
            &mesh,
            services.clone(),
            registry.clone(),
            router.subscribe(),
            counters.clone(),
        ));

        for service in &config.services {
            services.register(&service.name, Sink::from(service.sink), service.tags.clone())?;
            router.register_service(&service.name, service.tags.clone()).await?;
        }

        let ctx = SessionContext {
            local_id: local.clone(),
            mesh,
            registry: registry.clone(),
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            counters: counters.clone(),
            cancel: cancel.child_token(),
            tracker: tracker.clone(),
        };

        let listen_addrs = listeners
            .iter()
            .map(|l| ListenAddr {
                kind: l.config().kind,
                addr: l.local_addr(),
            })
            .collect();
        for listener in listeners {
            spawn_intake(listener, &ctx);
        }
        for peer in &config.peers {
            tracker.spawn(run_dialer(peer.clone(), ctx.clone()));
        }

        let shared = Arc::new(NodeShared {
            config,
            started: std::time::Instant::now(),
            listen_addrs,
            registry,
            router,
            services,
            counters,
        });
        let control_addrs = controls.iter().filter_map(|c| c.local_addr()).collect();
        for control in controls {
            control.spawn(shared.clone(), cancel.child_token(), &tracker);
        }

        info!(node = %local, "node started");
        Ok(Self {
            shared,
            dispatcher,
            control_addrs,
            cancel,
            tracker,
        })
    }

    pub fn node_id(&self) -> &str {
        self.shared.node_id()
    }

    /// Resolved addresses of all listeners, in configuration order.
    pub fn listen_addrs(&self) -> Vec<ListenAddr> {
        self.shared.listen_addrs().to_vec()
    }

    /// Bound TCP control endpoints.
    pub fn control_addrs(&self) -> &[SocketAddr] {
        &self.control_addrs
    }

    pub fn shared(&self) -> Arc<NodeShared> {
        self.shared.clone()
    }

    /// Registers a local service backed by a channel and starts advertising
    /// it. Unit messages addressed to it arrive on the returned receiver.
    pub async fn register_service(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let rx = self.shared.services.register_channel(name, tags.clone())?;
        self.shared.router.register_service(name, tags).await?;
        Ok(rx)
    }

    /// Sends `payload` from the local `src_service` to `dst_service` on
    /// `dst_node`. Failures come back as failure notices on `src_service`.
    pub async fn send(
        &self,
        src_service: &str,
        dst_node: &str,
        dst_service: &str,
        payload: Vec<u8>,
    ) -> Result<u64> {
        if !is_valid_node_id(dst_node) {
            anyhow::bail!("invalid destination node id {dst_node:?}");
        }
        if !is_valid_service_name(dst_service) {
            anyhow::bail!("invalid destination service name {dst_service:?}");
        }
        Ok(self
            .dispatcher
            .originate(src_service, dst_node, dst_service, payload)
            .await)
    }

    /// Sends to whichever node [`Node::resolve_service`] picks for `service`.
    pub async fn send_to_service(
        &self,
        src_service: &str,
        service: &str,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let resolved = self
            .resolve_service(service)
            .with_context(|| format!("service {service:?} is not advertised by any reachable node"))?;
        self.send(src_service, &resolved.node, &resolved.service, payload)
            .await
    }

    pub fn resolve_service(&self, service: &str) -> Option<Resolution> {
        let view = self.shared.router.view();
        view.services.resolve(service, self.node_id(), &view.routes)
    }

    pub fn routes(&self) -> Arc<ForwardingTable> {
        self.shared.routes()
    }

    pub fn graph(&self) -> Arc<GraphSnapshot> {
        self.shared.graph()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers()
    }

    pub fn services(&self) -> Arc<ServiceDirectory> {
        self.shared.services()
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status()
    }

    /// Stops accepting, closes every session and waits (bounded) for all
    /// tasks to finish.
    pub async fn shutdown(&self) {
        info!(node = %self.node_id(), "shutting down");
        self.cancel.cancel();
        self.shared.registry.close_all();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(pending = self.tracker.len(), "tasks still running after shutdown timeout");
        }
        debug!(node = %self.node_id(), "shutdown complete");
    }
}

/// Turns links accepted by `listener` into inbound sessions.
fn spawn_intake(listener: Listener, ctx: &SessionContext) {
    let policy = CostPolicy::from(listener.config());
    let (links_tx, mut links_rx) = mpsc::channel::<Link>(LINK_INTAKE_SIZE);
    listener.spawn_accept_loop(links_tx, ctx.cancel.child_token(), &ctx.tracker);

    let ctx = ctx.clone();
    ctx.tracker.clone().spawn(async move {
        loop {
            let link = tokio::select! {
                link = links_rx.recv() => match link {
                    Some(link) => link,
                    None => break,
                },
                _ = ctx.cancel.cancelled() => break,
            };
            debug!(kind = %link.kind, remote = %link.remote_addr, "inbound link accepted");
            // Detached: the tracker owns the session task.
            drop(spawn_session(link, policy.clone(), Direction::Inbound, &ctx));
        }
    });
}
