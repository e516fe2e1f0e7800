//! # Dispatcher
//!
//! Data-plane forwarding of unit messages.
//!
//! Every message, whether originated here or received from a peer, walks the
//! same steps:
//!
//! 1. duplicate suppression on `(src-node, message-id)` within the dedupe horizon
//! 2. local delivery when addressed to this node
//! 3. hop accounting for messages received from a peer
//! 4. forwarding-table lookup and enqueue on the next-hop session
//!
//! A step that fails produces a failure notice addressed to the message's
//! source service. Notices and echo replies go through the same steps, so a
//! notice for a local source never leaves the node. A failed notice is logged
//! and dropped rather than answered.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::messages::{FailureKind, Frame, NodeId, RouteFailure, UnitBody, UnitMessage};
use crate::router::MeshView;
use crate::services::{Delivery, ServiceRegistry, Sink};
use crate::session::SessionRegistry;
use crate::telemetry::{bump, Counters};

/// Capacity of the recently-seen message cache.
pub const SEEN_MESSAGES_SIZE: usize = 65_536;

/// Payload bytes shown by the `log` sink.
const LOG_PREVIEW_BYTES: usize = 64;

/// Addressing of a message that could not be delivered, kept without its
/// payload.
struct Undeliverable {
    src_node: NodeId,
    src_service: String,
    dst_node: NodeId,
    dst_service: String,
    was_failure: bool,
}

impl Undeliverable {
    fn of(msg: &UnitMessage) -> Self {
        Self {
            src_node: msg.src_node.clone(),
            src_service: msg.src_service.clone(),
            dst_node: msg.dst_node.clone(),
            dst_service: msg.dst_service.clone(),
            was_failure: msg.body.is_failure(),
        }
    }
}

pub struct Dispatcher {
    local: NodeId,
    max_hops: u32,
    dedupe_horizon: Duration,
    services: Arc<ServiceRegistry>,
    sessions: SessionRegistry,
    view: watch::Receiver<Arc<MeshView>>,
    seen: Mutex<LruCache<(NodeId, u64), Instant>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        local: NodeId,
        mesh: &MeshConfig,
        services: Arc<ServiceRegistry>,
        sessions: SessionRegistry,
        view: watch::Receiver<Arc<MeshView>>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            local,
            max_hops: mesh.max_hops,
            dedupe_horizon: mesh.dedupe_horizon,
            services,
            sessions,
            view,
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_MESSAGES_SIZE).expect("SEEN_MESSAGES_SIZE must be > 0"),
            )),
            next_id: AtomicU64::new(rand::random()),
            counters,
        }
    }

    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `payload` from the local service `src_service` to
    /// `(dst_node, dst_service)`. Returns the message id.
    pub async fn originate(
        &self,
        src_service: &str,
        dst_node: &str,
        dst_service: &str,
        payload: Vec<u8>,
    ) -> u64 {
        let message_id = self.next_message_id();
        let msg = UnitMessage {
            src_node: self.local.clone(),
            dst_node: dst_node.to_string(),
            src_service: src_service.to_string(),
            dst_service: dst_service.to_string(),
            message_id,
            hop_count: 0,
            body: UnitBody::Data(payload),
        };
        self.process(msg, false).await;
        message_id
    }

    pub async fn handle_from_peer(&self, msg: UnitMessage, from: &str) {
        trace!(
            peer = %from,
            src = %msg.src_node,
            dst = %msg.dst_node,
            id = msg.message_id,
            hops = msg.hop_count,
            "unit message received"
        );
        self.process(msg, true).await;
    }

    async fn process(&self, msg: UnitMessage, received: bool) {
        let mut pending = VecDeque::from([(msg, received)]);
        while let Some((msg, received)) = pending.pop_front() {
            if let Some(reply) = self.step(msg, received).await {
                pending.push_back((reply, false));
            }
        }
    }

    /// Handles one message. Returns a reply to route next, if any.
    async fn step(&self, mut msg: UnitMessage, received: bool) -> Option<UnitMessage> {
        if self.is_duplicate(&msg) {
            bump(&self.counters.duplicates);
            trace!(src = %msg.src_node, id = msg.message_id, "duplicate unit message dropped");
            return None;
        }

        if msg.dst_node == self.local {
            return self.deliver(msg).await;
        }

        if received {
            // Peer-supplied; saturate so a forged count cannot wrap below the limit.
            msg.hop_count = msg.hop_count.saturating_add(1);
            if msg.hop_count >= self.max_hops {
                bump(&self.counters.hop_limit_exceeded);
                debug!(src = %msg.src_node, dst = %msg.dst_node, hops = msg.hop_count, "hop limit exceeded");
                let detail = format!("dropped after {} hops", msg.hop_count);
                return self.failure(Undeliverable::of(&msg), FailureKind::HopLimitExceeded, detail);
            }
        }

        let next_hop = {
            let view = self.view.borrow();
            view.routes.lookup(&msg.dst_node).map(|route| route.next_hop.clone())
        };
        let Some(next_hop) = next_hop else {
            bump(&self.counters.no_route);
            debug!(src = %msg.src_node, dst = %msg.dst_node, "no route");
            let detail = format!("no route to {}", msg.dst_node);
            return self.failure(Undeliverable::of(&msg), FailureKind::NoRoute, detail);
        };

        let about = Undeliverable::of(&msg);
        match self.sessions.send(&next_hop, Frame::Unit(msg)) {
            Ok(()) => {
                bump(&self.counters.forwarded);
                trace!(dst = %about.dst_node, next_hop = %next_hop, "unit message forwarded");
                None
            }
            Err(e) => {
                bump(&self.counters.no_route);
                debug!(dst = %about.dst_node, next_hop = %next_hop, error = %e, "next hop unavailable");
                let detail = format!("next hop {next_hop} unavailable: {e}");
                self.failure(about, FailureKind::NoRoute, detail)
            }
        }
    }

    /// Records the message as seen. True if it was already seen within the
    /// dedupe horizon.
    fn is_duplicate(&self, msg: &UnitMessage) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (msg.src_node.clone(), msg.message_id);
        if let Some(at) = seen.get(&key)
            && now.saturating_duration_since(*at) <= self.dedupe_horizon
        {
            return true;
        }
        seen.put(key, now);
        false
    }

    async fn deliver(&self, msg: UnitMessage) -> Option<UnitMessage> {
        let Some(sink) = self.services.sink(&msg.dst_service) else {
            bump(&self.counters.unreachable_service);
            debug!(service = %msg.dst_service, src = %msg.src_node, "service not registered");
            let detail = format!("service {:?} is not registered on {}", msg.dst_service, self.local);
            return self.failure(Undeliverable::of(&msg), FailureKind::UnreachableService, detail);
        };
        bump(&self.counters.delivered);

        match sink {
            Sink::Discard => None,
            Sink::Log => {
                log_delivery(&msg);
                None
            }
            Sink::Echo => match msg.body {
                UnitBody::Data(payload) => Some(UnitMessage {
                    src_node: self.local.clone(),
                    dst_node: msg.src_node,
                    src_service: msg.dst_service,
                    dst_service: msg.src_service,
                    message_id: self.next_message_id(),
                    hop_count: 0,
                    body: UnitBody::Echo(payload),
                }),
                _ => None,
            },
            Sink::Channel(tx) => {
                let delivery = Delivery {
                    src_node: msg.src_node,
                    src_service: msg.src_service,
                    dst_service: msg.dst_service,
                    message_id: msg.message_id,
                    body: msg.body,
                };
                if tx.send(delivery).await.is_err() {
                    debug!("service receiver dropped, delivery discarded");
                }
                None
            }
        }
    }

    fn failure(&self, about: Undeliverable, kind: FailureKind, detail: String) -> Option<UnitMessage> {
        if about.was_failure {
            warn!(
                %kind,
                src = %about.src_node,
                dst = %about.dst_node,
                %detail,
                "failure notice undeliverable, dropped"
            );
            return None;
        }
        Some(UnitMessage {
            src_node: self.local.clone(),
            dst_node: about.src_node,
            src_service: about.dst_service.clone(),
            dst_service: about.src_service,
            message_id: self.next_message_id(),
            hop_count: 0,
            body: UnitBody::Failure(RouteFailure {
                kind,
                service: about.dst_service,
                node: about.dst_node,
                detail,
            }),
        })
    }
}

fn log_delivery(msg: &UnitMessage) {
    match &msg.body {
        UnitBody::Data(payload) | UnitBody::Echo(payload) => {
            let preview = String::from_utf8_lossy(&payload[..payload.len().min(LOG_PREVIEW_BYTES)]);
            info!(
                service = %msg.dst_service,
                src = %msg.src_node,
                src_service = %msg.src_service,
                bytes = payload.len(),
                %preview,
                "unit message"
            );
        }
        UnitBody::Failure(failure) => {
            info!(
                service = %msg.dst_service,
                kind = %failure.kind,
                node = %failure.node,
                failed_service = %failure.service,
                detail = %failure.detail,
                "route failure"
            );
        }
    }
}
