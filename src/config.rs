//! # Node Configuration
//!
//! Option groups arrive from the command line as lists of `key=value` tokens,
//! one list per occurrence of a flag:
//!
//! ```text
//! --node id=alpha
//! --tcp-listener port=0 cost=1.5 nodecost={"beta": 2}
//! --peer address=10.0.0.2:4001 kind=ws cost=3
//! --service name=echo sink=echo tag:role=demo
//! --control-service port=9300
//! ```
//!
//! Each group is parsed into a typed struct. Validation happens here, before
//! any socket exists, so that a bad cost never reaches a listener.
//!
//! Protocol tunables live in [`MeshConfig`]; its [`Default`] is built from the
//! `DEFAULT_*` constants below.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::messages::{is_valid_node_id, is_valid_service_name, NodeId};

// ============================================================================
// Protocol Defaults
// ============================================================================

/// Cost assigned to a link when neither the listener nor the peer names one.
pub const DEFAULT_COST: f64 = 1.0;

/// Keepalive period `K`. A session with no inbound frame for `3K` is dead.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Missed keepalive periods before a session is declared dead.
pub const KEEPALIVE_MISSES: u32 = 3;

/// Bound on the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Window over which local advertisement triggers are coalesced.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Window over which forwarding recomputations are debounced.
pub const DEFAULT_RECOMPUTE_DEBOUNCE: Duration = Duration::from_millis(50);

/// Origins silent for longer than this are evicted from the graph.
pub const DEFAULT_EVICTION_HORIZON: Duration = Duration::from_secs(60);

/// Period of unconditional routing re-advertisement.
pub const DEFAULT_ROUTING_REFRESH: Duration = Duration::from_secs(10);

/// Period of unconditional service re-advertisement.
pub const DEFAULT_SERVICE_REFRESH: Duration = Duration::from_secs(30);

/// Frames buffered per session before unit messages start being dropped.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Links a unit message may traverse.
pub const DEFAULT_MAX_HOPS: u32 = 30;

/// Horizon of the dispatcher's recently-seen set.
pub const DEFAULT_DEDUPE_HORIZON: Duration = Duration::from_secs(120);

/// Reconnect backoff bounds for configured peers.
pub const DEFAULT_REDIAL_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REDIAL_MAX: Duration = Duration::from_secs(30);

// ============================================================================
// Typed Option Groups
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Ws,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "ws" | "websocket" => Ok(Self::Ws),
            other => Err(format!("unknown transport {other:?} (expected tcp, udp or ws)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListenerConfig {
    pub kind: TransportKind,
    /// `0` requests an ephemeral port.
    pub port: u16,
    pub bind_addr: IpAddr,
    pub cost: f64,
    /// Per-remote cost overrides, applied once the remote's id is known.
    pub node_cost: BTreeMap<NodeId, f64>,
}

impl ListenerConfig {
    pub fn new(kind: TransportKind, port: u16) -> Self {
        Self {
            kind,
            port,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            cost: DEFAULT_COST,
            node_cost: BTreeMap::new(),
        }
    }

    pub fn parse(kind: TransportKind, tokens: &[String]) -> Result<Self, ConfigError> {
        let group = match kind {
            TransportKind::Tcp => "tcp-listener",
            TransportKind::Udp => "udp-listener",
            TransportKind::Ws => "ws-listener",
        };
        let mut port = None;
        let mut config = Self::new(kind, 0);
        for (key, value) in split_options(group, tokens)? {
            match key.as_str() {
                "port" => port = Some(parse_value::<u16>(group, &key, &value)?),
                "cost" => config.cost = parse_cost(group, &key, &value)?,
                "nodecost" => config.node_cost = parse_node_cost(group, &value)?,
                "bindaddr" => config.bind_addr = parse_value::<IpAddr>(group, &key, &value)?,
                _ => return Err(ConfigError::UnknownOption { group, key }),
            }
        }
        config.port = port.ok_or(ConfigError::MissingOption { group, key: "port" })?;
        Ok(config)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeerConfig {
    pub kind: TransportKind,
    /// `host:port` of the remote listener.
    pub address: String,
    pub cost: f64,
    /// Reconnect with backoff after the session closes.
    pub redial: bool,
}

impl PeerConfig {
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            cost: DEFAULT_COST,
            redial: true,
        }
    }

    pub fn parse(tokens: &[String]) -> Result<Self, ConfigError> {
        const GROUP: &str = "peer";
        let mut address = None;
        let mut config = Self::new(TransportKind::Tcp, "");
        for (key, value) in split_options(GROUP, tokens)? {
            match key.as_str() {
                "address" => address = Some(value),
                "kind" => config.kind = parse_value::<TransportKind>(GROUP, &key, &value)?,
                "cost" => config.cost = parse_cost(GROUP, &key, &value)?,
                "redial" => config.redial = parse_value::<bool>(GROUP, &key, &value)?,
                _ => return Err(ConfigError::UnknownOption { group: GROUP, key }),
            }
        }
        config.address = address.ok_or(ConfigError::MissingOption {
            group: GROUP,
            key: "address",
        })?;
        if !config.address.contains(':') {
            return Err(ConfigError::InvalidValue {
                group: GROUP,
                key: "address".into(),
                value: config.address,
                reason: "expected host:port".into(),
            });
        }
        Ok(config)
    }
}

/// Built-in delivery sinks selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Echo,
    Discard,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "log" => Ok(Self::Log),
            "echo" => Ok(Self::Echo),
            "discard" => Ok(Self::Discard),
            other => Err(format!("unknown sink {other:?} (expected log, echo or discard)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub sink: SinkKind,
    pub tags: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn parse(tokens: &[String]) -> Result<Self, ConfigError> {
        const GROUP: &str = "service";
        let mut name = None;
        let mut sink = SinkKind::Log;
        let mut tags = BTreeMap::new();
        for (key, value) in split_options(GROUP, tokens)? {
            if let Some(tag) = key.strip_prefix("tag:") {
                tags.insert(tag.to_string(), value);
                continue;
            }
            match key.as_str() {
                "name" => name = Some(value),
                "sink" => sink = parse_value::<SinkKind>(GROUP, &key, &value)?,
                _ => return Err(ConfigError::UnknownOption { group: GROUP, key }),
            }
        }
        let name = name.ok_or(ConfigError::MissingOption {
            group: GROUP,
            key: "name",
        })?;
        if !is_valid_service_name(&name) {
            return Err(ConfigError::InvalidServiceName(name));
        }
        Ok(Self { name, sink, tags })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ControlConfig {
    /// TCP port on 127.0.0.1; `0` picks an ephemeral one.
    pub port: Option<u16>,
    /// Unix domain socket path.
    pub filename: Option<PathBuf>,
}

impl ControlConfig {
    pub fn parse(tokens: &[String]) -> Result<Self, ConfigError> {
        const GROUP: &str = "control-service";
        let mut config = Self::default();
        for (key, value) in split_options(GROUP, tokens)? {
            match key.as_str() {
                "port" => config.port = Some(parse_value::<u16>(GROUP, &key, &value)?),
                "filename" => config.filename = Some(PathBuf::from(value)),
                _ => return Err(ConfigError::UnknownOption { group: GROUP, key }),
            }
        }
        if config.port.is_none() && config.filename.is_none() {
            return Err(ConfigError::MissingOption {
                group: GROUP,
                key: "port",
            });
        }
        Ok(config)
    }
}

/// Protocol tunables.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MeshConfig {
    pub keepalive_interval: Duration,
    pub handshake_timeout: Duration,
    pub coalesce_window: Duration,
    pub recompute_debounce: Duration,
    pub eviction_horizon: Duration,
    pub routing_refresh: Duration,
    pub service_refresh: Duration,
    pub send_queue_capacity: usize,
    pub max_hops: u32,
    pub dedupe_horizon: Duration,
    pub redial_initial: Duration,
    pub redial_max: Duration,
}

impl MeshConfig {
    /// Silence after which a session is declared dead.
    pub fn idle_timeout(&self) -> Duration {
        self.keepalive_interval * KEEPALIVE_MISSES
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            recompute_debounce: DEFAULT_RECOMPUTE_DEBOUNCE,
            eviction_horizon: DEFAULT_EVICTION_HORIZON,
            routing_refresh: DEFAULT_ROUTING_REFRESH,
            service_refresh: DEFAULT_SERVICE_REFRESH,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_hops: DEFAULT_MAX_HOPS,
            dedupe_horizon: DEFAULT_DEDUPE_HORIZON,
            redial_initial: DEFAULT_REDIAL_INITIAL,
            redial_max: DEFAULT_REDIAL_MAX,
        }
    }
}

/// Everything a node needs to start.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listeners: Vec<ListenerConfig>,
    pub peers: Vec<PeerConfig>,
    pub services: Vec<ServiceConfig>,
    pub control: Vec<ControlConfig>,
    pub mesh: MeshConfig,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            listeners: Vec::new(),
            peers: Vec::new(),
            services: Vec::new(),
            control: Vec::new(),
            mesh: MeshConfig::default(),
        }
    }

    /// Parses the `--node` group (`id=<node-id>`).
    pub fn parse_node(tokens: &[String]) -> Result<Self, ConfigError> {
        const GROUP: &str = "node";
        let mut id = None;
        for (key, value) in split_options(GROUP, tokens)? {
            match key.as_str() {
                "id" => id = Some(value),
                _ => return Err(ConfigError::UnknownOption { group: GROUP, key }),
            }
        }
        let id = id.ok_or(ConfigError::MissingOption { group: GROUP, key: "id" })?;
        let config = Self::new(id);
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants of a programmatically built configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_node_id(&self.node_id) {
            return Err(ConfigError::InvalidNodeId(self.node_id.clone()));
        }
        for listener in &self.listeners {
            check_cost(listener.cost)?;
            for cost in listener.node_cost.values() {
                check_cost(*cost)?;
            }
        }
        for peer in &self.peers {
            check_cost(peer.cost)?;
        }
        let mut names = std::collections::BTreeSet::new();
        for service in &self.services {
            if !is_valid_service_name(&service.name) {
                return Err(ConfigError::InvalidServiceName(service.name.clone()));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Token Parsing
// ============================================================================

fn split_options(
    group: &'static str,
    tokens: &[String],
) -> Result<Vec<(String, String)>, ConfigError> {
    tokens
        .iter()
        .map(|token| {
            token
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_ascii_lowercase(), value.to_string()))
                .ok_or_else(|| ConfigError::MalformedOption {
                    group,
                    token: token.clone(),
                })
        })
        .collect()
}

fn parse_value<T>(group: &'static str, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        group,
        key: key.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn check_cost(cost: f64) -> Result<f64, ConfigError> {
    if cost.is_finite() && cost > 0.0 {
        Ok(cost)
    } else {
        Err(ConfigError::NonPositiveCost)
    }
}

fn parse_cost(group: &'static str, key: &str, value: &str) -> Result<f64, ConfigError> {
    check_cost(parse_value::<f64>(group, key, value)?)
}

fn parse_node_cost(group: &'static str, value: &str) -> Result<BTreeMap<NodeId, f64>, ConfigError> {
    let map: BTreeMap<NodeId, f64> =
        serde_json::from_str(value).map_err(|err| ConfigError::InvalidValue {
            group,
            key: "nodecost".into(),
            value: value.to_string(),
            reason: err.to_string(),
        })?;
    for cost in map.values() {
        check_cost(*cost)?;
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn listener_defaults() {
        let listener = ListenerConfig::parse(TransportKind::Tcp, &tokens(&["port=0"])).unwrap();
        assert_eq!(listener.port, 0);
        assert_eq!(listener.cost, DEFAULT_COST);
        assert!(listener.node_cost.is_empty());
        assert_eq!(listener.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn accepted_costs() {
        for (raw, expected) in [("1", 1.0), ("1.5", 1.5), ("1.0", 1.0), ("0.2", 0.2), ("52", 52.0), ("23", 23.0)] {
            for kind in [TransportKind::Tcp, TransportKind::Udp, TransportKind::Ws] {
                let cost = format!("cost={raw}");
                let listener = ListenerConfig::parse(kind, &tokens(&["port=0", cost.as_str()])).unwrap();
                assert_eq!(listener.cost, expected);
            }
        }
    }

    #[test]
    fn non_positive_cost_rejected() {
        for raw in ["-1", "0", "0.0", "-0.5", "NaN", "inf"] {
            let cost = format!("cost={raw}");
            let err = ListenerConfig::parse(TransportKind::Udp, &tokens(&["port=0", cost.as_str()])).unwrap_err();
            assert_eq!(err, ConfigError::NonPositiveCost, "cost {raw}");
            assert_eq!(err.to_string(), "connection cost must be positive");
        }
    }

    #[test]
    fn node_cost_maps() {
        let cases: [(&str, &[(&str, f64)]); 4] = [
            ("{}", &[]),
            (r#"{"a": 1}"#, &[("a", 1.0)]),
            (r#"{"a": 1.1}"#, &[("a", 1.1)]),
            (r#"{"a": 1.3, "b": 5.6, "c": 0.2}"#, &[("a", 1.3), ("b", 5.6), ("c", 0.2)]),
        ];
        for (json, expected) in cases {
            let option = format!("nodecost={json}");
            let listener = ListenerConfig::parse(TransportKind::Ws, &tokens(&["port=0", option.as_str()])).unwrap();
            assert_eq!(listener.node_cost.len(), expected.len());
            for (id, cost) in expected {
                let parsed = listener.node_cost[*id];
                assert!((parsed - cost).abs() < 1e-9, "{id}: {parsed} != {cost}");
            }
        }
    }

    #[test]
    fn node_cost_overrides_default() {
        let listener = ListenerConfig::parse(
            TransportKind::Tcp,
            &tokens(&["port=1", "cost=3", r#"nodecost={"b": 0.5}"#]),
        )
        .unwrap();
        let policy = crate::session::CostPolicy::from(&listener);
        assert_eq!(policy.for_remote("b"), 0.5);
        assert_eq!(policy.for_remote("c"), 3.0);
    }

    #[test]
    fn node_cost_must_be_positive() {
        let err = ListenerConfig::parse(TransportKind::Tcp, &tokens(&["port=1", r#"nodecost={"b": -2}"#]))
            .unwrap_err();
        assert_eq!(err, ConfigError::NonPositiveCost);
        assert!(ListenerConfig::parse(TransportKind::Tcp, &tokens(&["port=1", "nodecost=[1]"])).is_err());
    }

    #[test]
    fn missing_port_and_unknown_keys() {
        assert!(matches!(
            ListenerConfig::parse(TransportKind::Tcp, &tokens(&["cost=2"])),
            Err(ConfigError::MissingOption { key: "port", .. })
        ));
        assert!(matches!(
            ListenerConfig::parse(TransportKind::Tcp, &tokens(&["port=1", "colour=red"])),
            Err(ConfigError::UnknownOption { .. })
        ));
        assert!(matches!(
            ListenerConfig::parse(TransportKind::Tcp, &tokens(&["port"])),
            Err(ConfigError::MalformedOption { .. })
        ));
    }

    #[test]
    fn peer_parsing() {
        let peer = PeerConfig::parse(&tokens(&["address=127.0.0.1:4000", "kind=ws", "cost=2.5"])).unwrap();
        assert_eq!(peer.kind, TransportKind::Ws);
        assert_eq!(peer.address, "127.0.0.1:4000");
        assert_eq!(peer.cost, 2.5);
        assert!(peer.redial);

        assert!(PeerConfig::parse(&tokens(&["kind=tcp"])).is_err());
        assert!(PeerConfig::parse(&tokens(&["address=nohost"])).is_err());
        assert_eq!(
            PeerConfig::parse(&tokens(&["address=h:1", "cost=-3"])).unwrap_err(),
            ConfigError::NonPositiveCost
        );
    }

    #[test]
    fn service_parsing() {
        let service = ServiceConfig::parse(&tokens(&["name=echo", "sink=echo", "tag:role=demo"])).unwrap();
        assert_eq!(service.name, "echo");
        assert_eq!(service.sink, SinkKind::Echo);
        assert_eq!(service.tags.get("role").map(String::as_str), Some("demo"));
        assert!(ServiceConfig::parse(&tokens(&["sink=log"])).is_err());
        assert!(ServiceConfig::parse(&tokens(&["name=x", "sink=printer"])).is_err());
    }

    #[test]
    fn node_id_required_and_validated() {
        assert_eq!(NodeConfig::parse_node(&tokens(&["id=test"])).unwrap().node_id, "test");
        assert!(NodeConfig::parse_node(&tokens(&[])).is_err());
        assert!(matches!(
            NodeConfig::parse_node(&tokens(&["id="])),
            Err(ConfigError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn duplicate_services_rejected() {
        let mut config = NodeConfig::new("a");
        let echo = ServiceConfig {
            name: "echo".into(),
            sink: SinkKind::Echo,
            tags: BTreeMap::new(),
        };
        config.services = vec![echo.clone(), echo];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateService(_))));
    }

    #[test]
    fn idle_timeout_is_three_keepalives() {
        assert_eq!(MeshConfig::default().idle_timeout(), Duration::from_secs(15));
    }
}
