//! # Peer Sessions
//!
//! A session is the logical connection to exactly one remote node, running on
//! top of a [`Link`] of any transport.
//!
//! ## State Machine
//!
//! ```text
//! connecting ──► handshaking ──► established ──► closing ──► closed
//!      ▲                                                       │
//!      └──────────── backoff (outbound sessions only) ─────────┘
//! ```
//!
//! ## Tasks
//!
//! | Task | Owns | Work |
//! |------|------|------|
//! | inbound | [`LinkReader`] | decode, liveness deadline, hand frames to router/dispatcher |
//! | outbound | [`LinkWriter`] | drain the [`SendQueue`], keepalive pings when idle |
//!
//! A wrapper task awaits the inbound task's join handle, so a panic anywhere
//! in a session is contained, logged and followed by the same cleanup as a
//! normal close. Outbound sessions are additionally supervised by
//! [`run_dialer`], which redials with exponential backoff.
//!
//! ## Send Queue
//!
//! Bounded. When full, the oldest queued unit message makes room; control
//! frames are never dropped, and a queue full of control frames means the
//! remote is not reading, so the session is closed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ListenerConfig, MeshConfig, PeerConfig};
use crate::dispatch::Dispatcher;
use crate::error::{FrameError, SessionError};
use crate::messages::{Advertisement, Frame, Handshake, NodeId, PROTOCOL_VERSION};
use crate::router::Router;
use crate::telemetry::{bump, Counters};
use crate::transport::{self, Link, LinkReader, LinkWriter, TransportKind};

/// Time the outbound task gets to flush after the session starts closing.
const OUTBOUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Send Queue
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Merged into a queued advertisement from the same origin.
    Coalesced,
    /// Queued after evicting the oldest queued unit message.
    DroppedOldest,
    /// The new unit message itself was dropped: everything queued is control.
    DroppedNew,
}

/// Identity of an advertisement for coalescing: a newer one replaces an
/// older one still waiting in the queue.
fn same_advertisement(queued: &Frame, new: &Frame) -> bool {
    match (queued, new) {
        (Frame::Routing(a), Frame::Routing(b)) => a.origin == b.origin,
        (Frame::Service(a), Frame::Service(b)) => a.origin == b.origin && a.service == b.service,
        _ => false,
    }
}

fn advertisement_epoch(frame: &Frame) -> Option<u64> {
    match frame {
        Frame::Routing(ad) => Some(ad.epoch),
        Frame::Service(ad) => Some(ad.epoch),
        _ => None,
    }
}

struct QueueInner {
    frames: VecDeque<Frame>,
    /// Queued frames that count against capacity (everything but advertisements).
    bounded: usize,
    closed: bool,
}

/// Single-consumer frame queue.
///
/// Unit messages and keepalives are bounded by `capacity`. Advertisements
/// are coalesced to one queued frame per origin (per origin and service for
/// service advertisements), so they are bounded by the size of the mesh and
/// a full sync never saturates the queue.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                bounded: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, frame: Frame) -> Result<Pushed, SessionError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(SessionError::PeerClosed);
        }
        let outcome = if let Some(epoch) = advertisement_epoch(&frame) {
            match inner.frames.iter_mut().find(|queued| same_advertisement(queued, &frame)) {
                Some(queued) => {
                    if advertisement_epoch(queued).is_some_and(|held| held < epoch) {
                        *queued = frame;
                    }
                    Pushed::Coalesced
                }
                None => {
                    inner.frames.push_back(frame);
                    Pushed::Queued
                }
            }
        } else if inner.bounded < self.capacity {
            inner.frames.push_back(frame);
            inner.bounded += 1;
            Pushed::Queued
        } else if let Some(oldest_unit) = inner.frames.iter().position(|f| !f.is_control()) {
            inner.frames.remove(oldest_unit);
            inner.frames.push_back(frame);
            Pushed::DroppedOldest
        } else if !frame.is_control() {
            Pushed::DroppedNew
        } else {
            inner.closed = true;
            drop(inner);
            self.notify.notify_one();
            return Err(SessionError::ControlSaturated);
        };
        drop(inner);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Next frame, or `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if inner.closed {
                    return None;
                }
                if let Some(frame) = inner.frames.pop_front() {
                    if advertisement_epoch(&frame).is_none() {
                        inner.bounded -= 1;
                    }
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Established Session
// ============================================================================

/// Cost selection for a link whose remote id is not known yet.
#[derive(Clone, Debug, PartialEq)]
pub struct CostPolicy {
    pub default: f64,
    pub overrides: BTreeMap<NodeId, f64>,
}

impl CostPolicy {
    pub fn fixed(cost: f64) -> Self {
        Self {
            default: cost,
            overrides: BTreeMap::new(),
        }
    }

    pub fn for_remote(&self, remote: &str) -> f64 {
        self.overrides.get(remote).copied().unwrap_or(self.default)
    }
}

impl From<&ListenerConfig> for CostPolicy {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            default: config.cost,
            overrides: config.node_cost.clone(),
        }
    }
}

/// Shared view of one established session.
pub struct PeerSession {
    pub id: u64,
    pub remote: NodeId,
    pub cost: f64,
    pub kind: TransportKind,
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    queue: SendQueue,
    state: Mutex<SessionState>,
    last_inbound: Mutex<Instant>,
    dropped: AtomicU64,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

/// Serializable description of a session for the control API.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    pub session_id: u64,
    pub node_id: NodeId,
    pub cost: f64,
    pub kind: TransportKind,
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub queued: usize,
    pub dropped: u64,
    pub idle_ms: u64,
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        remote: NodeId,
        cost: f64,
        kind: TransportKind,
        direction: Direction,
        remote_addr: SocketAddr,
        capacity: usize,
        cancel: CancellationToken,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            id,
            remote,
            cost,
            kind,
            direction,
            remote_addr,
            queue: SendQueue::new(capacity),
            state: Mutex::new(SessionState::Handshaking),
            last_inbound: Mutex::new(Instant::now()),
            dropped: AtomicU64::new(0),
            cancel,
            counters,
        }
    }

    #[cfg(test)]
    pub(crate) fn established(remote: &str, direction: Direction, capacity: usize) -> Arc<Self> {
        let session = Self::new(
            next_session_id(),
            remote.to_string(),
            1.0,
            TransportKind::Tcp,
            direction,
            SocketAddr::from(([127, 0, 0, 1], 1)),
            capacity,
            CancellationToken::new(),
            Arc::new(Counters::default()),
        );
        session.set_state(SessionState::Established);
        Arc::new(session)
    }

    /// Enqueues a frame for the outbound task.
    pub fn send(&self, frame: Frame) -> Result<(), SessionError> {
        match self.queue.push(frame) {
            Ok(Pushed::Queued | Pushed::Coalesced) => Ok(()),
            Ok(Pushed::DroppedOldest | Pushed::DroppedNew) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                bump(&self.counters.frames_dropped);
                trace!(peer = %self.remote, session = self.id, "send queue full, unit message dropped");
                Ok(())
            }
            Err(SessionError::ControlSaturated) => {
                warn!(peer = %self.remote, session = self.id, "send queue saturated with control frames, closing");
                self.close();
                Err(SessionError::ControlSaturated)
            }
            Err(e) => Err(e),
        }
    }

    /// Moves the session to `closing`; both tasks wind down.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Closed {
            *state = SessionState::Closing;
        }
        drop(state);
        self.queue.close();
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Handshaking | SessionState::Established)
    }

    fn touch(&self) {
        *self.last_inbound.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Node id of the side that opened the transport connection.
    fn dialer<'a>(&'a self, local: &'a str) -> &'a str {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => &self.remote,
        }
    }

    pub fn info(&self) -> PeerInfo {
        let idle = self
            .last_inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        PeerInfo {
            session_id: self.id,
            node_id: self.remote.clone(),
            cost: self.cost,
            kind: self.kind,
            direction: self.direction,
            remote_addr: self.remote_addr,
            state: self.state(),
            queued: self.queue.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            idle_ms: idle.as_millis() as u64,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Established sessions keyed by remote node id; at most one per remote.
#[derive(Clone)]
pub struct SessionRegistry {
    local: NodeId,
    sessions: Arc<RwLock<HashMap<NodeId, Arc<PeerSession>>>>,
}

impl SessionRegistry {
    pub fn new(local: impl Into<NodeId>) -> Self {
        Self {
            local: local.into(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers an established session. When one to the same remote
    /// already exists, the session dialed by the lexicographically lower
    /// node id survives so that both ends keep the same link. Returns the
    /// displaced session, if any, which the caller must close.
    pub fn insert(&self, session: Arc<PeerSession>) -> Result<Option<Arc<PeerSession>>, SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&session.remote)
            && existing.is_open()
        {
            let preferred = self.local.as_str().min(session.remote.as_str());
            let new_preferred = session.dialer(&self.local) == preferred;
            let old_preferred = existing.dialer(&self.local) == preferred;
            if old_preferred && !new_preferred {
                return Err(SessionError::Duplicate);
            }
        }
        Ok(sessions.insert(session.remote.clone(), session))
    }

    pub fn get(&self, node: &str) -> Option<Arc<PeerSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }

    /// Removes the session with this id if it is still the registered one.
    pub fn remove(&self, session_id: u64) -> Option<Arc<PeerSession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let key = sessions
            .iter()
            .find(|(_, s)| s.id == session_id)
            .map(|(k, _)| k.clone())?;
        sessions.remove(&key)
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        let mut all: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.remote.cmp(&b.remote));
        all
    }

    pub fn send(&self, node: &str, frame: Frame) -> Result<(), SessionError> {
        let session = self.get(node).ok_or(SessionError::PeerClosed)?;
        session.send(frame)
    }

    /// Sends `frame` to every established peer not listed in `except`.
    pub fn broadcast(&self, frame: &Frame, except: &[&str]) {
        for session in self.sessions() {
            if except.contains(&session.remote.as_str()) {
                continue;
            }
            if let Err(e) = session.send(frame.clone()) {
                debug!(peer = %session.remote, error = %e, "broadcast send failed");
            }
        }
    }

    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
        }
    }
}

// ============================================================================
// Session Tasks
// ============================================================================

/// Everything a session needs from the rest of the node.
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: NodeId,
    pub mesh: Arc<MeshConfig>,
    pub registry: SessionRegistry,
    pub router: Router,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<Counters>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The handshake completed and the session was registered.
    pub established: bool,
    pub result: Result<(), SessionError>,
}

/// Runs a session over `link` until it closes. Cleanup (registry removal,
/// router notification) happens here, also after a panic.
pub fn spawn_session(
    link: Link,
    cost: CostPolicy,
    direction: Direction,
    ctx: &SessionContext,
) -> JoinHandle<SessionOutcome> {
    let ctx = ctx.clone();
    let id = next_session_id();
    ctx.tracker.clone().spawn(async move {
        let established = Arc::new(AtomicBool::new(false));
        let inner = tokio::spawn(run_session(
            id,
            link,
            cost,
            direction,
            ctx.clone(),
            established.clone(),
        ));
        let result = match inner.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(session = id, "session task panicked");
                Err(SessionError::Panicked)
            }
            Err(_) => Err(SessionError::PeerClosed),
        };

        if let Some(session) = ctx.registry.remove(id) {
            session.close();
            session.set_state(SessionState::Closed);
        }
        ctx.router.peer_down(id).await;

        match &result {
            Err(SessionError::Frame(e)) if e.is_protocol_violation() => {
                bump(&ctx.counters.protocol_violations)
            }
            Err(SessionError::Protocol(_) | SessionError::Handshake(_)) => {
                bump(&ctx.counters.protocol_violations)
            }
            Err(SessionError::Frame(_) | SessionError::Idle(_) | SessionError::HandshakeTimeout) => {
                bump(&ctx.counters.transport_errors)
            }
            _ => {}
        }

        SessionOutcome {
            established: established.load(Ordering::Acquire),
            result,
        }
    })
}

async fn handshake(
    local_id: &str,
    reader: &mut dyn LinkReader,
    writer: &mut dyn LinkWriter,
) -> Result<NodeId, SessionError> {
    writer.write(Frame::Handshake(Handshake::new(local_id))).await?;
    let hs = match reader.read().await? {
        Some(Frame::Handshake(hs)) => hs,
        Some(other) => {
            return Err(SessionError::Protocol(format!(
                "expected handshake, got {:?} frame",
                other.tag()
            )));
        }
        None => return Err(SessionError::PeerClosed),
    };
    if hs.version != PROTOCOL_VERSION {
        return Err(SessionError::Handshake(format!(
            "unsupported protocol version {} (want {})",
            hs.version, PROTOCOL_VERSION
        )));
    }
    if hs.node_id == local_id {
        return Err(SessionError::Handshake(format!(
            "remote claims our own node id {local_id:?}"
        )));
    }
    Ok(hs.node_id)
}

async fn run_session(
    id: u64,
    link: Link,
    cost: CostPolicy,
    direction: Direction,
    ctx: SessionContext,
    established: Arc<AtomicBool>,
) -> Result<(), SessionError> {
    let Link {
        kind,
        remote_addr,
        mut reader,
        mut writer,
    } = link;
    debug!(session = id, %kind, %remote_addr, ?direction, "handshaking");

    let exchange = tokio::time::timeout(
        ctx.mesh.handshake_timeout,
        handshake(&ctx.local_id, reader.as_mut(), writer.as_mut()),
    );
    let outcome = tokio::select! {
        outcome = exchange => outcome,
        _ = ctx.cancel.cancelled() => return Ok(()),
    };
    let remote = match outcome {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            warn!(session = id, %remote_addr, error = %e, "handshake failed");
            writer.close().await;
            return Err(e);
        }
        Err(_) => {
            warn!(session = id, %remote_addr, "handshake timed out");
            writer.close().await;
            return Err(SessionError::HandshakeTimeout);
        }
    };

    let link_cost = cost.for_remote(&remote);
    let session = Arc::new(PeerSession::new(
        id,
        remote.clone(),
        link_cost,
        kind,
        direction,
        remote_addr,
        ctx.mesh.send_queue_capacity,
        ctx.cancel.child_token(),
        ctx.counters.clone(),
    ));

    match ctx.registry.insert(session.clone()) {
        Ok(Some(displaced)) => {
            debug!(peer = %remote, kept = id, closed = displaced.id, "replacing duplicate session");
            displaced.close();
        }
        Ok(None) => {}
        Err(e) => {
            debug!(peer = %remote, session = id, "duplicate session to peer, closing");
            writer.close().await;
            return Err(e);
        }
    }
    session.set_state(SessionState::Established);
    established.store(true, Ordering::Release);
    info!(peer = %remote, session = id, %kind, cost = link_cost, ?direction, "session established");
    ctx.router.peer_up(id, remote.clone(), link_cost).await;

    let outbound = tokio::spawn(outbound_loop(
        session.clone(),
        writer,
        ctx.mesh.keepalive_interval,
        ctx.counters.clone(),
    ));
    let result = inbound_loop(&session, reader, &ctx).await;

    session.close();
    if tokio::time::timeout(OUTBOUND_DRAIN_TIMEOUT, outbound).await.is_err() {
        debug!(peer = %remote, session = id, "outbound task did not drain in time");
    }
    match &result {
        Ok(()) | Err(SessionError::PeerClosed) => {
            info!(peer = %remote, session = id, "session closed")
        }
        Err(e) => info!(peer = %remote, session = id, error = %e, "session closed"),
    }
    result
}

async fn inbound_loop(
    session: &PeerSession,
    mut reader: Box<dyn LinkReader>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let idle = ctx.mesh.idle_timeout();
    let mut deadline = Instant::now() + idle;
    loop {
        let read = tokio::select! {
            read = reader.read() => read,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(peer = %session.remote, ?idle, "peer silent, closing session");
                return Err(SessionError::Idle(idle));
            }
            _ = session.cancel.cancelled() => return Ok(()),
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(SessionError::PeerClosed),
            Err(e) => {
                if e.is_protocol_violation() {
                    warn!(peer = %session.remote, error = %e, "protocol violation");
                }
                return Err(e.into());
            }
        };
        deadline = Instant::now() + idle;
        session.touch();
        trace!(peer = %session.remote, tag = ?frame.tag(), "frame received");

        match frame {
            Frame::Ping => session.send(Frame::Pong)?,
            Frame::Pong => {}
            Frame::Handshake(_) => {
                warn!(peer = %session.remote, "handshake on established session");
                return Err(SessionError::Protocol("handshake on established session".into()));
            }
            Frame::Routing(ad) => {
                ctx.router
                    .advertisement(&session.remote, Advertisement::Routing(ad))
                    .await
            }
            Frame::Service(ad) => {
                ctx.router
                    .advertisement(&session.remote, Advertisement::Service(ad))
                    .await
            }
            Frame::Unit(msg) => ctx.dispatcher.handle_from_peer(msg, &session.remote).await,
        }
    }
}

async fn outbound_loop(
    session: Arc<PeerSession>,
    mut writer: Box<dyn LinkWriter>,
    keepalive: Duration,
    counters: Arc<Counters>,
) {
    loop {
        let frame = tokio::select! {
            frame = session.queue.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = tokio::time::sleep(keepalive) => Frame::Ping,
            _ = session.cancel.cancelled() => break,
        };
        match writer.write(frame).await {
            Ok(()) => {}
            Err(FrameError::TooLarge { len, max }) => {
                bump(&counters.frames_dropped);
                warn!(peer = %session.remote, len, max, "frame exceeds link mtu, dropped");
            }
            Err(e) => {
                debug!(peer = %session.remote, error = %e, "write failed");
                bump(&counters.transport_errors);
                session.close();
                break;
            }
        }
    }
    writer.close().await;
}

// ============================================================================
// Dial Supervisor
// ============================================================================

fn redial_policy(mesh: &MeshConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: mesh.redial_initial,
        current_interval: mesh.redial_initial,
        randomization_factor: 0.1,
        multiplier: 2.0,
        start_time: std::time::Instant::now(),
        max_interval: mesh.redial_max,
        max_elapsed_time: None,
        clock: backoff::SystemClock::default(),
    }
}

/// Keeps an outbound session to `peer` alive until cancellation.
pub async fn run_dialer(peer: PeerConfig, ctx: SessionContext) {
    let mut backoff = redial_policy(&ctx.mesh);
    loop {
        debug!(address = %peer.address, kind = %peer.kind, "dialing peer");
        let dialed = tokio::select! {
            dialed = transport::dial(peer.kind, &peer.address) => dialed,
            _ = ctx.cancel.cancelled() => break,
        };
        match dialed {
            Ok(link) => {
                let handle = spawn_session(link, CostPolicy::fixed(peer.cost), Direction::Outbound, &ctx);
                match handle.await {
                    Ok(outcome) => {
                        if outcome.established {
                            backoff.reset();
                        }
                        if let Err(e) = outcome.result {
                            debug!(address = %peer.address, error = %e, "outbound session ended");
                        }
                    }
                    Err(e) => error!(address = %peer.address, error = %e, "session supervisor failed"),
                }
            }
            Err(e) => {
                debug!(address = %peer.address, error = %e, "dial failed");
                bump(&ctx.counters.transport_errors);
            }
        }

        if !peer.redial || ctx.cancel.is_cancelled() {
            break;
        }
        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        debug!(address = %peer.address, ?delay, "redial scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancel.cancelled() => break,
        }
    }
    debug!(address = %peer.address, "dialer stopped");
}
