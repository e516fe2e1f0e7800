//! # Error Kinds
//!
//! Typed errors for the failure classes a node distinguishes:
//!
//! | Type | Raised by | Consequence |
//! |------|-----------|-------------|
//! | [`ConfigError`] | option parsing, validation | process exits before binding |
//! | [`FrameError`] | codec, link capability objects | owning session closes |
//! | [`SessionError`] | handshake, send queue, liveness | owning session closes |
//!
//! Data-plane failures (`no-route`, `unreachable-service`, `hop-limit-exceeded`)
//! are not errors at all: they travel back to the sender as failure notices,
//! see [`crate::messages::FailureKind`].

use std::io;

use thiserror::Error;

/// Invalid invocation arguments. Fatal before any socket is bound.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("connection cost must be positive")]
    NonPositiveCost,

    #[error("invalid node id {0:?}: must be 1-64 printable characters without whitespace")]
    InvalidNodeId(String),

    #[error("{group}: missing required option {key:?}")]
    MissingOption { group: &'static str, key: &'static str },

    #[error("{group}: unknown option {key:?}")]
    UnknownOption { group: &'static str, key: String },

    #[error("{group}: option {token:?} is not of the form key=value")]
    MalformedOption { group: &'static str, token: String },

    #[error("{group}: invalid value {value:?} for {key:?}: {reason}")]
    InvalidValue {
        group: &'static str,
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    #[error("service {0:?} is already registered")]
    DuplicateService(String),
}

/// Wire-level decoding or encoding failure.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed-frame: {0}")]
    Malformed(String),

    #[error("malformed-frame: unknown tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("frame-too-large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl FrameError {
    /// Decode-side violations close the session as a protocol violation
    /// rather than a transport error.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::UnknownTag(_) | Self::TooLarge { .. })
    }
}

impl From<bincode::Error> for FrameError {
    fn from(err: bincode::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Reason a peer session ended or refused an operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer-closed")]
    PeerClosed,

    #[error("send queue saturated with control frames")]
    ControlSaturated,

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("no inbound frame for {0:?}")]
    Idle(std::time::Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("superseded by a preferred session to the same peer")]
    Duplicate,

    #[error("session task panicked")]
    Panicked,
}
