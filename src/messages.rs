//! # Wire Protocol Messages
//!
//! Every frame on every transport is `tag || payload`:
//!
//! | Tag | Frame | Payload |
//! |-----|-------|---------|
//! | `0x01` | [`Frame::Handshake`] | text line `receptor/1 id=<node-id>\n` |
//! | `0x02` | [`Frame::Routing`] | versioned [`RoutingAdvertisement`] record |
//! | `0x03` | [`Frame::Service`] | versioned [`ServiceAdvertisement`] record |
//! | `0x04` | [`Frame::Unit`] | versioned [`UnitMessage`] record |
//! | `0x05` | [`Frame::Ping`] | empty |
//! | `0x06` | [`Frame::Pong`] | empty |
//!
//! Binary records start with [`RECORD_FORMAT_VERSION`] followed by a bincode
//! body. Deserialization always goes through [`deserialize_bounded`], which
//! enforces [`MAX_FRAME_SIZE`] and rejects trailing bytes.
//!
//! Framing of the resulting byte string is the transport's business: a `u32`
//! length prefix on TCP (see [`crate::codec`]), one datagram per frame on UDP,
//! one binary message per frame on WebSocket.

use std::collections::BTreeMap;
use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::FrameError;

/// Node identifiers are opaque printable strings.
pub type NodeId = String;

/// Version carried in the handshake line.
pub const PROTOCOL_VERSION: u32 = 1;

/// Leading byte of every binary record.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Largest frame (tag included) accepted from or written to any link (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum node identifier length in bytes.
pub const MAX_NODE_ID_LEN: usize = 64;

/// Maximum service name length in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 128;

const HANDSHAKE_PREFIX: &str = "receptor/";

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn is_valid_node_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_NODE_ID_LEN
        && id.chars().all(|c| !c.is_whitespace() && !c.is_control())
}

pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name.chars().all(|c| c.is_ascii_graphic())
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameTag {
    Handshake = 0x01,
    Routing = 0x02,
    Service = 0x03,
    Unit = 0x04,
    Ping = 0x05,
    Pong = 0x06,
}

impl TryFrom<u8> for FrameTag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => Self::Handshake,
            0x02 => Self::Routing,
            0x03 => Self::Service,
            0x04 => Self::Unit,
            0x05 => Self::Ping,
            0x06 => Self::Pong,
            other => return Err(FrameError::UnknownTag(other)),
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub node_id: NodeId,
}

impl Handshake {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            node_id: node_id.into(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{HANDSHAKE_PREFIX}{} id={}\n", self.version, self.node_id)
    }

    /// Parses `receptor/<version> id=<node-id>\n`. The version is returned
    /// as-is; refusing foreign versions is up to the session.
    pub fn parse_line(bytes: &[u8]) -> Result<Self, FrameError> {
        let line = std::str::from_utf8(bytes)
            .map_err(|_| FrameError::Malformed("handshake is not utf-8".into()))?;
        let line = line
            .strip_suffix('\n')
            .ok_or_else(|| FrameError::Malformed("handshake line not terminated".into()))?;
        let rest = line
            .strip_prefix(HANDSHAKE_PREFIX)
            .ok_or_else(|| FrameError::Malformed(format!("unexpected handshake {line:?}")))?;
        let (version, id) = rest
            .split_once(' ')
            .ok_or_else(|| FrameError::Malformed(format!("unexpected handshake {line:?}")))?;
        let version = version
            .parse::<u32>()
            .map_err(|_| FrameError::Malformed(format!("bad protocol version {version:?}")))?;
        let node_id = id
            .strip_prefix("id=")
            .ok_or_else(|| FrameError::Malformed(format!("handshake lacks id= field: {line:?}")))?;
        if !is_valid_node_id(node_id) {
            return Err(FrameError::Malformed(format!("invalid node id {node_id:?}")));
        }
        Ok(Self {
            version,
            node_id: node_id.to_string(),
        })
    }
}

// ============================================================================
// Advertisements
// ============================================================================

/// An origin's current neighbor set, stamped with the origin's epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingAdvertisement {
    pub origin: NodeId,
    pub epoch: u64,
    pub neighbors: BTreeMap<NodeId, f64>,
}

/// One service hosted by an origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceAdvertisement {
    pub origin: NodeId,
    pub epoch: u64,
    pub service: String,
    pub tags: BTreeMap<String, String>,
}

/// Either advertisement kind, as flooded by the gossip engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Advertisement {
    Routing(RoutingAdvertisement),
    Service(ServiceAdvertisement),
}

impl Advertisement {
    pub fn origin(&self) -> &str {
        match self {
            Self::Routing(ad) => &ad.origin,
            Self::Service(ad) => &ad.origin,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Self::Routing(ad) => ad.epoch,
            Self::Service(ad) => ad.epoch,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Self::Routing(ad) => Frame::Routing(ad),
            Self::Service(ad) => Frame::Service(ad),
        }
    }
}

// ============================================================================
// Unit messages
// ============================================================================

/// Data-plane failure reported back to a message's source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    NoRoute,
    UnreachableService,
    HopLimitExceeded,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no-route"),
            Self::UnreachableService => write!(f, "unreachable-service"),
            Self::HopLimitExceeded => write!(f, "hop-limit-exceeded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteFailure {
    pub kind: FailureKind,
    /// Destination service of the message that failed.
    pub service: String,
    /// Node the failed message was addressed to.
    pub node: NodeId,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UnitBody {
    Data(Vec<u8>),
    /// Reply produced by an `echo` sink. Never echoed again.
    Echo(Vec<u8>),
    Failure(RouteFailure),
}

impl UnitBody {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitMessage {
    pub src_node: NodeId,
    pub dst_node: NodeId,
    pub src_service: String,
    pub dst_service: String,
    pub message_id: u64,
    /// Links traversed so far.
    pub hop_count: u32,
    pub body: UnitBody,
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Handshake(Handshake),
    Routing(RoutingAdvertisement),
    Service(ServiceAdvertisement),
    Unit(UnitMessage),
    Ping,
    Pong,
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Self::Handshake(_) => FrameTag::Handshake,
            Self::Routing(_) => FrameTag::Routing,
            Self::Service(_) => FrameTag::Service,
            Self::Unit(_) => FrameTag::Unit,
            Self::Ping => FrameTag::Ping,
            Self::Pong => FrameTag::Pong,
        }
    }

    /// Control frames are never dropped by a send queue.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Unit(_))
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![self.tag() as u8];
        match self {
            Self::Handshake(hs) => out.extend_from_slice(hs.to_line().as_bytes()),
            Self::Routing(ad) => encode_record(&mut out, ad)?,
            Self::Service(ad) => encode_record(&mut out, ad)?,
            Self::Unit(msg) => encode_record(&mut out, msg)?,
            Self::Ping | Self::Pong => {}
        }
        if out.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                len: out.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| FrameError::Malformed("empty frame".into()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                len: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(match FrameTag::try_from(tag)? {
            FrameTag::Handshake => Self::Handshake(Handshake::parse_line(payload)?),
            FrameTag::Routing => Self::Routing(decode_record(payload)?),
            FrameTag::Service => Self::Service(decode_record(payload)?),
            FrameTag::Unit => Self::Unit(decode_record(payload)?),
            FrameTag::Ping | FrameTag::Pong if !payload.is_empty() => {
                return Err(FrameError::Malformed(format!(
                    "keepalive frame carries {} trailing bytes",
                    payload.len()
                )));
            }
            FrameTag::Ping => Self::Ping,
            FrameTag::Pong => Self::Pong,
        })
    }
}

fn encode_record<T: Serialize>(out: &mut Vec<u8>, record: &T) -> Result<(), FrameError> {
    out.push(RECORD_FORMAT_VERSION);
    bincode_options().serialize_into(&mut *out, record)?;
    Ok(())
}

fn decode_record<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    let (&version, body) = payload
        .split_first()
        .ok_or_else(|| FrameError::Malformed("truncated record".into()))?;
    if version != RECORD_FORMAT_VERSION {
        return Err(FrameError::Malformed(format!(
            "unsupported record format version {version}"
        )));
    }
    Ok(deserialize_bounded(body)?)
}
