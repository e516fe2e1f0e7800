//! # Service Registry
//!
//! Two views of services:
//!
//! - [`ServiceRegistry`]: services hosted on this node, each bound to a
//!   delivery [`Sink`]. Owned by the node, read by the dispatcher.
//! - [`ServiceDirectory`]: every advertised service in the mesh (local ones
//!   included), rebuilt by the routing core and published with each view.
//!
//! ## Resolution
//!
//! [`ServiceDirectory::resolve`] picks, among reachable advertisers of a name,
//! the one with the lowest routing cost, then the lowest node id. The local
//! node has cost zero, so it always wins for services it hosts itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::SinkKind;
use crate::error::ConfigError;
use crate::messages::{is_valid_service_name, NodeId, UnitBody};
use crate::routing::{cmp_cost, ForwardingTable};

/// Buffered deliveries per channel sink before the dispatcher waits.
pub const DELIVERY_CHANNEL_SIZE: usize = 1024;

/// A unit message handed to a local service.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub src_node: NodeId,
    pub src_service: String,
    pub dst_service: String,
    pub message_id: u64,
    pub body: UnitBody,
}

#[derive(Clone, Debug)]
pub enum Sink {
    /// Payload sizes and previews go to the log.
    Log,
    /// Data is returned to the sender's source service.
    Echo,
    Discard,
    Channel(mpsc::Sender<Delivery>),
}

impl From<SinkKind> for Sink {
    fn from(kind: SinkKind) -> Self {
        match kind {
            SinkKind::Log => Self::Log,
            SinkKind::Echo => Self::Echo,
            SinkKind::Discard => Self::Discard,
        }
    }
}

struct LocalService {
    sink: Sink,
    tags: BTreeMap<String, String>,
}

/// Services hosted by this node.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, LocalService>>,
}

impl ServiceRegistry {
    pub fn register(
        &self,
        name: &str,
        sink: Sink,
        tags: BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        if !is_valid_service_name(name) {
            return Err(ConfigError::InvalidServiceName(name.to_string()));
        }
        let mut services = self
            .services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if services.contains_key(name) {
            return Err(ConfigError::DuplicateService(name.to_string()));
        }
        services.insert(name.to_string(), LocalService { sink, tags });
        Ok(())
    }

    /// Creates a channel sink and registers it under `name`.
    pub fn register_channel(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<mpsc::Receiver<Delivery>, ConfigError> {
        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        self.register(name, Sink::Channel(tx), tags)?;
        Ok(rx)
    }

    pub fn sink(&self, name: &str) -> Option<Sink> {
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .map(|s| s.sink.clone())
    }

    /// Hosted service names with their tags.
    pub fn listing(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(name, service)| (name.clone(), service.tags.clone()))
            .collect()
    }
}

// ============================================================================
// Directory
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceRecord {
    pub epoch: u64,
    pub tags: BTreeMap<String, String>,
    pub local: bool,
}

/// Result of resolving a service name.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Resolution {
    pub node: NodeId,
    pub service: String,
    pub cost: f64,
}

/// Service name → advertising node → record.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServiceDirectory {
    pub entries: BTreeMap<String, BTreeMap<NodeId, ServiceRecord>>,
}

impl ServiceDirectory {
    pub fn insert(&mut self, service: &str, node: &str, record: ServiceRecord) {
        self.entries
            .entry(service.to_string())
            .or_default()
            .insert(node.to_string(), record);
    }

    pub fn advertisers(&self, service: &str) -> Vec<NodeId> {
        self.entries
            .get(service)
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn resolve(&self, service: &str, local: &str, routes: &ForwardingTable) -> Option<Resolution> {
        let nodes = self.entries.get(service)?;
        nodes
            .keys()
            .filter_map(|node| {
                let cost = if node == local {
                    0.0
                } else {
                    routes.lookup(node)?.cost
                };
                Some((node, cost))
            })
            // BTreeMap keys iterate in order, so min_by keeps the lowest id on ties.
            .min_by(|a, b| cmp_cost(a.1, b.1))
            .map(|(node, cost)| Resolution {
                node: node.clone(),
                service: service.to_string(),
                cost,
            })
    }
}
