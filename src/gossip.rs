//! # Gossip Engine
//!
//! Epoch bookkeeping and duplicate suppression for flooded advertisements.
//! The engine is plain state owned by the routing core; it never touches the
//! network itself.
//!
//! ## Epochs
//!
//! Every origin stamps its advertisements from a single monotonic counter
//! shared by routing and service advertisements, so `(origin, epoch)` names
//! exactly one advertisement. The counter starts at the wall-clock time in
//! microseconds, which keeps epochs increasing across restarts without any
//! persisted state.
//!
//! ## Flooding
//!
//! | Admission | Meaning | Router action |
//! |-----------|---------|---------------|
//! | `Fresh` | first sighting of `(origin, epoch)` | apply, forward to other peers |
//! | `Duplicate` | already seen | drop |
//! | `Own` | carries our own origin | drop; re-advertise if it outran our counter |

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::time::Instant;

use crate::messages::{Advertisement, NodeId, RoutingAdvertisement, ServiceAdvertisement};
use crate::services::{ServiceDirectory, ServiceRecord};

/// Capacity of the `(origin, epoch)` duplicate-suppression cache.
pub const SEEN_CACHE_SIZE: usize = 16_384;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
    /// Our own advertisement came back. `bumped` is set when its epoch was
    /// ahead of the local counter, which then jumps past it.
    Own { bumped: bool },
}

struct RemoteService {
    ad: ServiceAdvertisement,
    received_at: Instant,
}

pub struct GossipEngine {
    local: NodeId,
    /// Last epoch issued.
    epoch: u64,
    seen: LruCache<(NodeId, u64), ()>,
    last_routing: Option<RoutingAdvertisement>,
    local_services: BTreeMap<String, ServiceAdvertisement>,
    remote_services: HashMap<(NodeId, String), RemoteService>,
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl GossipEngine {
    pub fn new(local: impl Into<NodeId>) -> Self {
        Self {
            local: local.into(),
            epoch: 0,
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).expect("SEEN_CACHE_SIZE must be > 0"),
            ),
            last_routing: None,
            local_services: BTreeMap::new(),
            remote_services: HashMap::new(),
        }
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.epoch = (self.epoch + 1).max(wall_clock_micros());
        self.epoch
    }

    /// Classifies an incoming advertisement and records it as seen.
    pub fn admit(&mut self, ad: &Advertisement) -> Admission {
        if ad.origin() == self.local {
            let bumped = ad.epoch() > self.epoch;
            if bumped {
                self.epoch = ad.epoch();
            }
            return Admission::Own { bumped };
        }
        let key = (ad.origin().to_string(), ad.epoch());
        if self.seen.put(key, ()).is_some() {
            Admission::Duplicate
        } else {
            Admission::Fresh
        }
    }

    // ------------------------------------------------------------------------
    // Local advertisements
    // ------------------------------------------------------------------------

    pub fn issue_routing(&mut self, neighbors: BTreeMap<NodeId, f64>) -> RoutingAdvertisement {
        let ad = RoutingAdvertisement {
            origin: self.local.clone(),
            epoch: self.next_epoch(),
            neighbors,
        };
        self.last_routing = Some(ad.clone());
        ad
    }

    pub fn last_routing(&self) -> Option<&RoutingAdvertisement> {
        self.last_routing.as_ref()
    }

    /// Records a locally hosted service and stamps its first advertisement.
    pub fn add_local_service(
        &mut self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> ServiceAdvertisement {
        let ad = ServiceAdvertisement {
            origin: self.local.clone(),
            epoch: self.next_epoch(),
            service: name.to_string(),
            tags,
        };
        self.local_services.insert(name.to_string(), ad.clone());
        ad
    }

    pub fn hosts(&self, name: &str) -> bool {
        self.local_services.contains_key(name)
    }

    /// Restamps every local service for the periodic refresh.
    pub fn reissue_services(&mut self) -> Vec<ServiceAdvertisement> {
        let names: Vec<String> = self.local_services.keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| {
                let epoch = self.next_epoch();
                let ad = self.local_services.get_mut(&name)?;
                ad.epoch = epoch;
                Some(ad.clone())
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Remote services
    // ------------------------------------------------------------------------

    /// Stores `ad` if newer than the held advertisement for its
    /// `(origin, service)`.
    pub fn apply_service(&mut self, ad: &ServiceAdvertisement, now: Instant) -> bool {
        if ad.origin == self.local {
            return false;
        }
        let key = (ad.origin.clone(), ad.service.clone());
        if let Some(held) = self.remote_services.get(&key)
            && held.ad.epoch >= ad.epoch
        {
            return false;
        }
        self.remote_services.insert(
            key,
            RemoteService {
                ad: ad.clone(),
                received_at: now,
            },
        );
        true
    }

    pub fn evict_stale_services(&mut self, horizon: Duration, now: Instant) -> usize {
        let before = self.remote_services.len();
        self.remote_services
            .retain(|_, held| now.saturating_duration_since(held.received_at) <= horizon);
        before - self.remote_services.len()
    }

    /// Drops every service held for `origin`.
    pub fn forget_origin(&mut self, origin: &str) -> usize {
        let before = self.remote_services.len();
        self.remote_services.retain(|(held_origin, _), _| held_origin != origin);
        before - self.remote_services.len()
    }

    /// Local and remote service advertisements, for a full sync to a new peer.
    pub fn known_service_ads(&self) -> Vec<ServiceAdvertisement> {
        let mut remote: Vec<_> = self.remote_services.values().map(|held| held.ad.clone()).collect();
        remote.sort_by(|a, b| (&a.origin, &a.service).cmp(&(&b.origin, &b.service)));
        self.local_services.values().cloned().chain(remote).collect()
    }

    pub fn directory(&self) -> ServiceDirectory {
        let mut directory = ServiceDirectory::default();
        for ad in self.local_services.values() {
            directory.insert(
                &ad.service,
                &ad.origin,
                ServiceRecord {
                    epoch: ad.epoch,
                    tags: ad.tags.clone(),
                    local: true,
                },
            );
        }
        for held in self.remote_services.values() {
            directory.insert(
                &held.ad.service,
                &held.ad.origin,
                ServiceRecord {
                    epoch: held.ad.epoch,
                    tags: held.ad.tags.clone(),
                    local: false,
                },
            );
        }
        directory
    }
}
