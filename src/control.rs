//! # Control API
//!
//! Read-only inspection surface bound to loopback TCP and/or a Unix domain
//! socket. Line protocol: one command per line in, one JSON document per
//! line out.
//!
//! | Command | Response |
//! |---------|----------|
//! | `status` | node id, uptime, listeners, peers, routes, services, counters |
//! | `peers` | established sessions |
//! | `graph` | adjacency of every known vertex |
//! | `routes` | forwarding table |
//! | `services` | service directory |
//! | `config` | effective configuration |
//!
//! Anything else yields `{"error": "..."}` and the connection stays open.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::node::NodeShared;

/// Longest accepted command line.
pub const MAX_COMMAND_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Peers,
    Graph,
    Routes,
    Services,
    Config,
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "peers" => Ok(Self::Peers),
            "graph" => Ok(Self::Graph),
            "routes" => Ok(Self::Routes),
            "services" => Ok(Self::Services),
            "config" => Ok(Self::Config),
            other => Err(format!("unknown command {other:?}")),
        }
    }
}

/// Answers one command line.
pub fn respond(shared: &NodeShared, line: &str) -> serde_json::Value {
    let command = match line.parse::<ControlCommand>() {
        Ok(command) => command,
        Err(e) => return json!({ "error": e }),
    };
    let value = match command {
        ControlCommand::Status => serde_json::to_value(shared.status()),
        ControlCommand::Peers => serde_json::to_value(shared.peers()),
        ControlCommand::Graph => serde_json::to_value(&*shared.graph()),
        ControlCommand::Routes => serde_json::to_value(&*shared.routes()),
        ControlCommand::Services => serde_json::to_value(&*shared.services()),
        ControlCommand::Config => serde_json::to_value(shared.config()),
    };
    value.unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

/// A bound control socket.
pub enum ControlListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl ControlListener {
    /// Binds every endpoint named by `config`.
    pub async fn bind(config: &ControlConfig) -> anyhow::Result<Vec<Self>> {
        let mut bound = Vec::new();
        if let Some(port) = config.port {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind control service on {addr}"))?;
            bound.push(Self::Tcp(listener));
        }
        if let Some(path) = &config.filename {
            remove_stale_socket(path)?;
            let listener = UnixListener::bind(path)
                .with_context(|| format!("failed to bind control socket {}", path.display()))?;
            bound.push(Self::Unix(listener, path.clone()));
        }
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(..) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp".into()),
            Self::Unix(_, path) => path.display().to_string(),
        }
    }

    pub fn spawn(self, shared: Arc<NodeShared>, cancel: CancellationToken, tracker: &TaskTracker) {
        info!(endpoint = %self.describe(), "control service ready");
        tracker.spawn(accept_loop(self, shared, cancel, tracker.clone()));
    }
}

/// Removes a socket file left by an earlier run. Anything else at `path`
/// is left alone and the bind fails on it.
fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale control socket");
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale control socket {}", path.display()))
        }
        _ => Ok(()),
    }
}

async fn accept_loop(
    listener: ControlListener,
    shared: Arc<NodeShared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        match &listener {
            ControlListener::Tcp(tcp) => {
                let accepted = tokio::select! {
                    accepted = tcp.accept() => accepted,
                    _ = cancel.cancelled() => break,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "control client connected");
                        tracker.spawn(serve(stream, shared.clone(), cancel.clone()));
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                }
            }
            ControlListener::Unix(unix, _) => {
                let accepted = tokio::select! {
                    accepted = unix.accept() => accepted,
                    _ = cancel.cancelled() => break,
                };
                match accepted {
                    Ok((stream, _)) => {
                        debug!("control client connected");
                        tracker.spawn(serve(stream, shared.clone(), cancel.clone()));
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                }
            }
        }
    }
    if let ControlListener::Unix(_, path) = &listener {
        let _ = std::fs::remove_file(path);
    }
}

async fn serve<S>(stream: S, shared: Arc<NodeShared>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_COMMAND_LEN));
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = cancel.cancelled() => break,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                debug!(error = %e, "control client sent an unreadable line");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&shared, &line).to_string();
        if let Err(e) = lines.send(response).await {
            debug!(error = %e, "control client went away");
            break;
        }
    }
}
