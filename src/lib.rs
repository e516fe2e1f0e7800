//! # Receptor - Overlay Mesh Router
//!
//! Receptor connects nodes over TCP, UDP and WebSocket links and forwards
//! addressed unit messages between services along shortest paths:
//!
//! - **Links**: one length-prefixed frame format over three transports
//! - **Sessions**: handshake, keepalive, bounded send queues, backoff redial
//! - **Gossip**: flooded routing and service advertisements with epochs
//! - **Routing**: Dijkstra over the advertised graph, debounced recomputation
//! - **Dispatch**: hop-limited forwarding with failure notices back to the source
//!
//! ## Architecture
//!
//! The routing core is an actor: sessions post link changes and received
//! advertisements to it, and it publishes immutable [`MeshView`] snapshots
//! that the dispatcher and the public API read without locking.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `config` | Command-line option groups and protocol tunables |
//! | `messages` | Wire types and frame serialization |
//! | `codec` | Length-prefixed framing for stream transports |
//! | `transport` | TCP, UDP and WebSocket links and listeners |
//! | `session` | Peer sessions, send queues, dial supervision |
//! | `gossip` | Epochs and duplicate suppression for advertisements |
//! | `routing` | Graph store and shortest-path computation |
//! | `router` | Routing core actor and published snapshots |
//! | `dispatch` | Unit-message forwarding and local delivery |
//! | `services` | Local service sinks and the mesh service directory |
//! | `control` | Loopback JSON-lines inspection API |
//! | `telemetry` | Failure and traffic counters |

mod codec;
mod config;
mod control;
mod dispatch;
mod error;
mod gossip;
mod messages;
mod node;
mod router;
mod routing;
mod services;
mod session;
mod telemetry;
mod transport;

pub use config::{
    ControlConfig, ListenerConfig, MeshConfig, NodeConfig, PeerConfig, ServiceConfig, SinkKind,
    TransportKind,
};
pub use error::{ConfigError, FrameError, SessionError};
pub use messages::{FailureKind, NodeId, RouteFailure, UnitBody};
pub use node::{ListenAddr, Node, NodeShared, NodeStatus};
pub use router::MeshView;
pub use routing::{ForwardingTable, GraphSnapshot, Route};
pub use services::{Delivery, Resolution, ServiceDirectory, ServiceRecord};
pub use session::{Direction, PeerInfo, SessionState};
pub use telemetry::CountersSnapshot;
