//! # Routing Core
//!
//! The single task that owns the graph, the forwarding table and the remote
//! service table. Everything else talks to it through a [`Router`] handle.
//!
//! ## Architecture
//!
//! ```text
//! sessions ──(PeerUp/PeerDown/Advertisement)──► mpsc ──► RouterActor
//!                                                           │
//!            SessionRegistry ◄──(flood frames by node id)───┤
//!                                                           │
//! dispatcher, node API ◄──── watch<Arc<MeshView>> ◄─────────┘
//! ```
//!
//! Readers never block the actor: they clone the current [`MeshView`], which
//! is replaced wholesale after every recomputation.
//!
//! ## Timers
//!
//! | Timer | Default | Effect |
//! |-------|---------|--------|
//! | advertise coalescing | 100 ms | one local routing advertisement per burst of link changes |
//! | recompute debounce | 50 ms | one Dijkstra run per burst of graph changes |
//! | eviction sweep | 1 s | drop origins silent for the eviction horizon |
//! | routing refresh | 10 s | re-advertise local links |
//! | service refresh | 30 s | re-advertise local services |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::MeshConfig;
use crate::gossip::{Admission, GossipEngine};
use crate::messages::{Advertisement, Frame, NodeId};
use crate::routing::{ForwardingTable, GraphSnapshot, RoutingTable};
use crate::services::ServiceDirectory;
use crate::session::SessionRegistry;
use crate::telemetry::{bump, Counters};

/// Depth of the router's command queue.
pub const ROUTER_QUEUE_SIZE: usize = 1024;

/// How often silent origins are looked for.
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Debounce windows stretch at most this many times before firing anyway.
const MAX_DELAY_FACTOR: u32 = 10;

/// Consistent snapshot of everything the routing core derives.
#[derive(Clone, Debug, Default)]
pub struct MeshView {
    pub routes: Arc<ForwardingTable>,
    pub graph: Arc<GraphSnapshot>,
    pub services: Arc<ServiceDirectory>,
}

enum Command {
    PeerUp {
        session_id: u64,
        node: NodeId,
        cost: f64,
    },
    PeerDown {
        session_id: u64,
    },
    Advertisement {
        from: NodeId,
        ad: Advertisement,
    },
    RegisterService {
        name: String,
        tags: BTreeMap<String, String>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Handle to the routing core.
#[derive(Clone)]
pub struct Router {
    cmd_tx: mpsc::Sender<Command>,
    view: watch::Receiver<Arc<MeshView>>,
}

impl Router {
    pub fn spawn(
        local: NodeId,
        mesh: Arc<MeshConfig>,
        registry: SessionRegistry,
        counters: Arc<Counters>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ROUTER_QUEUE_SIZE);
        let (view_tx, view) = watch::channel(Arc::new(MeshView::default()));
        let mut actor = RouterActor {
            table: RoutingTable::new(local.clone()),
            gossip: GossipEngine::new(local),
            advertise: Debouncer::new(mesh.coalesce_window),
            recompute: Debouncer::new(mesh.recompute_debounce),
            mesh,
            registry,
            counters,
            sessions: HashMap::new(),
            view_tx,
        };
        actor.advertise_routing();
        actor.publish_view();
        tracker.spawn(actor.run(cmd_rx, cancel));
        Self { cmd_tx, view }
    }

    pub async fn peer_up(&self, session_id: u64, node: NodeId, cost: f64) {
        self.post(Command::PeerUp {
            session_id,
            node,
            cost,
        })
        .await;
    }

    pub async fn peer_down(&self, session_id: u64) {
        self.post(Command::PeerDown { session_id }).await;
    }

    /// Hands over an advertisement received from the peer `from`.
    pub async fn advertisement(&self, from: &str, ad: Advertisement) {
        self.post(Command::Advertisement {
            from: from.to_string(),
            ad,
        })
        .await;
    }

    /// Starts advertising a local service.
    pub async fn register_service(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterService {
                name: name.to_string(),
                tags,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("router actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router actor closed"))?
    }

    pub fn view(&self) -> Arc<MeshView> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MeshView>> {
        self.view.clone()
    }

    async fn post(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            trace!("router actor closed, command dropped");
        }
    }
}

// ============================================================================
// Debouncing
// ============================================================================

/// Trailing-edge debounce: each trigger pushes the deadline out by `window`,
/// but never past `MAX_DELAY_FACTOR × window` after the first trigger.
struct Debouncer {
    window: Duration,
    max_delay: Duration,
    first: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            max_delay: window * MAX_DELAY_FACTOR,
            first: None,
            deadline: None,
        }
    }

    fn trigger(&mut self, now: Instant) {
        let first = *self.first.get_or_insert(now);
        self.deadline = Some((now + self.window).min(first + self.max_delay));
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn take(&mut self) {
        self.first = None;
        self.deadline = None;
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Router Actor (owns state)
// ============================================================================

struct RouterActor {
    mesh: Arc<MeshConfig>,
    table: RoutingTable,
    gossip: GossipEngine,
    registry: SessionRegistry,
    counters: Arc<Counters>,
    /// Established sessions: id → (remote, link cost).
    sessions: HashMap<u64, (NodeId, f64)>,
    advertise: Debouncer,
    recompute: Debouncer,
    view_tx: watch::Sender<Arc<MeshView>>,
}

impl RouterActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let start = Instant::now();
        let mut routing_refresh =
            tokio::time::interval_at(start + self.mesh.routing_refresh, self.mesh.routing_refresh);
        routing_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut service_refresh =
            tokio::time::interval_at(start + self.mesh.service_refresh, self.mesh.service_refresh);
        service_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::PeerUp { session_id, node, cost }) => {
                            self.handle_peer_up(session_id, node, cost);
                        }
                        Some(Command::PeerDown { session_id }) => {
                            self.handle_peer_down(session_id);
                        }
                        Some(Command::Advertisement { from, ad }) => {
                            self.handle_advertisement(&from, ad);
                        }
                        Some(Command::RegisterService { name, tags, reply }) => {
                            let _ = reply.send(self.handle_register_service(&name, tags));
                        }
                        None => {
                            debug!("router handles dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = sleep_until_deadline(self.advertise.deadline()) => {
                    self.advertise.take();
                    self.advertise_routing();
                }
                _ = sleep_until_deadline(self.recompute.deadline()) => {
                    self.recompute.take();
                    self.publish_view();
                }
                _ = sweep.tick() => self.evict_stale(),
                _ = routing_refresh.tick() => self.advertise_routing(),
                _ = service_refresh.tick() => {
                    for ad in self.gossip.reissue_services() {
                        self.registry.broadcast(&Frame::Service(ad), &[]);
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("router actor cancelled");
                    break;
                }
            }
        }
    }

    fn handle_peer_up(&mut self, session_id: u64, node: NodeId, cost: f64) {
        debug!(peer = %node, session = session_id, cost, "peer up");
        self.sessions.insert(session_id, (node.clone(), cost));
        self.sync_local_edges();

        // Full sync so the new peer does not wait for the next refresh.
        let mut frames = Vec::new();
        if let Some(ad) = self.gossip.last_routing() {
            frames.push(Frame::Routing(ad.clone()));
        }
        frames.extend(self.table.advertisements().into_iter().map(Frame::Routing));
        frames.extend(self.gossip.known_service_ads().into_iter().map(Frame::Service));
        let count = frames.len();
        for frame in frames {
            if let Err(e) = self.registry.send(&node, frame) {
                debug!(peer = %node, error = %e, "full sync interrupted");
                return;
            }
        }
        trace!(peer = %node, frames = count, "full sync queued");
    }

    fn handle_peer_down(&mut self, session_id: u64) {
        if let Some((node, _)) = self.sessions.remove(&session_id) {
            debug!(peer = %node, session = session_id, "peer down");
            self.sync_local_edges();
        }
    }

    /// Rebuilds local edges from established sessions, keeping the cheapest
    /// session per remote.
    fn sync_local_edges(&mut self) {
        let mut edges: BTreeMap<NodeId, f64> = BTreeMap::new();
        for (node, cost) in self.sessions.values() {
            edges
                .entry(node.clone())
                .and_modify(|held| *held = held.min(*cost))
                .or_insert(*cost);
        }
        if self.table.set_local_edges(edges) {
            let now = Instant::now();
            self.advertise.trigger(now);
            self.recompute.trigger(now);
        }
    }

    fn handle_advertisement(&mut self, from: &str, ad: Advertisement) {
        match self.gossip.admit(&ad) {
            Admission::Duplicate => {
                bump(&self.counters.advertisements_suppressed);
                trace!(peer = %from, origin = %ad.origin(), epoch = ad.epoch(), "duplicate advertisement");
            }
            Admission::Own { bumped } => {
                bump(&self.counters.advertisements_suppressed);
                if bumped {
                    debug!(peer = %from, epoch = ad.epoch(), "own advertisement ahead of local epoch, re-advertising");
                    self.advertise.trigger(Instant::now());
                    for service in self.gossip.reissue_services() {
                        self.registry.broadcast(&Frame::Service(service), &[]);
                    }
                }
            }
            Admission::Fresh => {
                let now = Instant::now();
                let applied = match &ad {
                    Advertisement::Routing(routing) => self.table.apply(routing, now),
                    Advertisement::Service(service) => self.gossip.apply_service(service, now),
                };
                if !applied {
                    bump(&self.counters.advertisements_suppressed);
                    trace!(peer = %from, origin = %ad.origin(), epoch = ad.epoch(), "stale advertisement");
                    return;
                }
                bump(&self.counters.advertisements_accepted);
                trace!(peer = %from, origin = %ad.origin(), epoch = ad.epoch(), "advertisement accepted");
                self.recompute.trigger(now);

                let origin = ad.origin().to_string();
                self.registry.broadcast(&ad.into_frame(), &[from, origin.as_str()]);
            }
        }
    }

    fn handle_register_service(
        &mut self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        if self.gossip.hosts(name) {
            anyhow::bail!("service {name:?} already advertised");
        }
        let ad = self.gossip.add_local_service(name, tags);
        info!(service = %name, epoch = ad.epoch, "advertising service");
        self.registry.broadcast(&Frame::Service(ad), &[]);
        self.recompute.trigger(Instant::now());
        Ok(())
    }

    fn advertise_routing(&mut self) {
        let ad = self.gossip.issue_routing(self.table.local_edges().clone());
        trace!(epoch = ad.epoch, neighbors = ad.neighbors.len(), "advertising links");
        self.registry.broadcast(&Frame::Routing(ad), &[]);
    }

    fn evict_stale(&mut self) {
        let now = Instant::now();
        let horizon = self.mesh.eviction_horizon;
        let evicted = self.table.evict_stale(horizon, now);
        let mut changed = !evicted.is_empty();
        for origin in &evicted {
            info!(origin = %origin, ?horizon, "origin silent, evicted");
            self.gossip.forget_origin(origin);
        }
        if self.gossip.evict_stale_services(horizon, now) > 0 {
            changed = true;
        }
        if changed {
            self.recompute.trigger(now);
        }
    }

    fn publish_view(&mut self) {
        let routes = self.table.recompute();
        debug!(generation = routes.generation, routes = routes.len(), "forwarding table recomputed");
        let view = MeshView {
            routes,
            graph: Arc::new(self.table.graph()),
            services: Arc::new(self.gossip.directory()),
        };
        self.view_tx.send_replace(Arc::new(view));
    }
}
