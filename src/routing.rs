//! # Routing Table
//!
//! Graph store plus shortest-path computation.
//!
//! ## Graph
//!
//! Vertices are node ids. Each remote origin contributes the neighbor set of
//! its most recent advertisement; the local vertex contributes the current
//! established sessions. An edge `u→v` exists iff `u`'s stored neighbor set
//! lists `v`.
//!
//! ## Forwarding
//!
//! [`RoutingTable::recompute`] runs Dijkstra from the local vertex and builds a
//! fresh [`ForwardingTable`]. Paths are ranked by:
//!
//! 1. total cost (costs within [`COST_EPSILON`] relative tolerance are equal)
//! 2. first-hop node id, lexicographically
//! 3. hop count
//!
//! The table is never edited in place; callers publish the returned value as a
//! shared immutable snapshot.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::messages::{NodeId, RoutingAdvertisement};

/// Relative tolerance under which two path costs compare equal.
pub const COST_EPSILON: f64 = 1e-9;

pub fn cmp_cost(a: f64, b: f64) -> Ordering {
    let scale = a.abs().max(b.abs()).max(1.0);
    if (a - b).abs() <= COST_EPSILON * scale {
        Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Route {
    pub next_hop: NodeId,
    pub cost: f64,
    pub hops: u32,
}

/// Destination → first hop, derived from one graph state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ForwardingTable {
    /// Increments with every recomputation.
    pub generation: u64,
    pub routes: BTreeMap<NodeId, Route>,
}

impl ForwardingTable {
    pub fn lookup(&self, destination: &str) -> Option<&Route> {
        self.routes.get(destination)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Adjacency of every known vertex, local edges included.
pub type GraphSnapshot = BTreeMap<NodeId, BTreeMap<NodeId, f64>>;

struct StoredAdvertisement {
    epoch: u64,
    neighbors: BTreeMap<NodeId, f64>,
    received_at: Instant,
}

pub struct RoutingTable {
    local: NodeId,
    local_edges: BTreeMap<NodeId, f64>,
    adverts: HashMap<NodeId, StoredAdvertisement>,
    generation: u64,
}

impl RoutingTable {
    pub fn new(local: impl Into<NodeId>) -> Self {
        Self {
            local: local.into(),
            local_edges: BTreeMap::new(),
            adverts: HashMap::new(),
            generation: 0,
        }
    }

    /// Stores `ad` if it is newer than what is held for its origin.
    /// Advertisements about the local vertex are never stored.
    pub fn apply(&mut self, ad: &RoutingAdvertisement, now: Instant) -> bool {
        if ad.origin == self.local {
            return false;
        }
        if let Some(stored) = self.adverts.get(&ad.origin)
            && stored.epoch >= ad.epoch
        {
            return false;
        }
        let neighbors = ad
            .neighbors
            .iter()
            .filter(|(_, cost)| cost.is_finite() && **cost > 0.0)
            .map(|(id, cost)| (id.clone(), *cost))
            .collect();
        self.adverts.insert(
            ad.origin.clone(),
            StoredAdvertisement {
                epoch: ad.epoch,
                neighbors,
                received_at: now,
            },
        );
        true
    }

    /// Replaces the local vertex's outgoing edges.
    pub fn set_local_edges(&mut self, edges: BTreeMap<NodeId, f64>) -> bool {
        if self.local_edges == edges {
            return false;
        }
        self.local_edges = edges;
        true
    }

    pub fn local_edges(&self) -> &BTreeMap<NodeId, f64> {
        &self.local_edges
    }

    /// Drops origins not heard from within `horizon`. Returns their ids.
    pub fn evict_stale(&mut self, horizon: Duration, now: Instant) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .adverts
            .iter()
            .filter(|(_, stored)| now.saturating_duration_since(stored.received_at) > horizon)
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &stale {
            self.adverts.remove(origin);
        }
        stale
    }

    /// Stored advertisements, reconstructed for replay to a new peer.
    pub fn advertisements(&self) -> Vec<RoutingAdvertisement> {
        let mut ads: Vec<_> = self
            .adverts
            .iter()
            .map(|(origin, stored)| RoutingAdvertisement {
                origin: origin.clone(),
                epoch: stored.epoch,
                neighbors: stored.neighbors.clone(),
            })
            .collect();
        ads.sort_by(|a, b| a.origin.cmp(&b.origin));
        ads
    }

    pub fn graph(&self) -> GraphSnapshot {
        let mut graph: GraphSnapshot = self
            .adverts
            .iter()
            .map(|(origin, stored)| (origin.clone(), stored.neighbors.clone()))
            .collect();
        graph.insert(self.local.clone(), self.local_edges.clone());
        graph
    }

    fn neighbors_of(&self, vertex: &str) -> Option<&BTreeMap<NodeId, f64>> {
        if vertex == self.local {
            Some(&self.local_edges)
        } else {
            self.adverts.get(vertex).map(|stored| &stored.neighbors)
        }
    }

    /// Dijkstra from the local vertex. O((V + E) log V).
    pub fn recompute(&mut self) -> Arc<ForwardingTable> {
        self.generation += 1;
        let mut best: HashMap<NodeId, Label> = HashMap::new();
        let mut settled: HashMap<NodeId, Label> = HashMap::new();
        let mut heap = BinaryHeap::new();

        for (neighbor, cost) in &self.local_edges {
            if *neighbor == self.local {
                continue;
            }
            let label = Label {
                cost: *cost,
                next_hop: neighbor.clone(),
                hops: 1,
            };
            relax(&mut best, &mut heap, neighbor, label);
        }

        while let Some(QueueEntry { label, vertex }) = heap.pop() {
            if settled.contains_key(&vertex) {
                continue;
            }
            if best.get(&vertex).is_some_and(|b| b.cmp(&label) == Ordering::Less) {
                continue;
            }
            if let Some(edges) = self.neighbors_of(&vertex) {
                for (neighbor, cost) in edges {
                    if *neighbor == self.local || settled.contains_key(neighbor) {
                        continue;
                    }
                    let candidate = Label {
                        cost: label.cost + cost,
                        next_hop: label.next_hop.clone(),
                        hops: label.hops + 1,
                    };
                    relax(&mut best, &mut heap, neighbor, candidate);
                }
            }
            settled.insert(vertex, label);
        }

        let routes = settled
            .into_iter()
            .map(|(destination, label)| {
                (
                    destination,
                    Route {
                        next_hop: label.next_hop,
                        cost: label.cost,
                        hops: label.hops,
                    },
                )
            })
            .collect();
        Arc::new(ForwardingTable {
            generation: self.generation,
            routes,
        })
    }
}

fn relax(
    best: &mut HashMap<NodeId, Label>,
    heap: &mut BinaryHeap<QueueEntry>,
    vertex: &NodeId,
    candidate: Label,
) {
    let improves = best
        .get(vertex)
        .is_none_or(|current| candidate.cmp(current) == Ordering::Less);
    if improves {
        best.insert(vertex.clone(), candidate.clone());
        heap.push(QueueEntry {
            label: candidate,
            vertex: vertex.clone(),
        });
    }
}

#[derive(Clone, Debug)]
struct Label {
    cost: f64,
    next_hop: NodeId,
    hops: u32,
}

impl Label {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_cost(self.cost, other.cost)
            .then_with(|| self.next_hop.cmp(&other.next_hop))
            .then_with(|| self.hops.cmp(&other.hops))
    }
}

struct QueueEntry {
    label: Label,
    vertex: NodeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .label
            .cmp(&self.label)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}
