//! # Link Drivers
//!
//! Three transports sit behind one packet-oriented contract:
//!
//! | Kind | Listener socket | Framing | MTU |
//! |------|-----------------|---------|-----|
//! | `tcp` | `TcpListener` | `u32` length prefix ([`FrameCodec`]) | [`MAX_FRAME_SIZE`] |
//! | `ws` | `TcpListener` + HTTP upgrade | one binary message per frame | [`MAX_FRAME_SIZE`] |
//! | `udp` | one `UdpSocket`, demultiplexed by source address | one datagram per frame | [`UDP_MTU`] |
//!
//! ## Architecture
//!
//! ```text
//!   Listener::bind ──► local_addr() known ──► spawn_accept_loop
//!                                                  │
//!                                   one task per accepted connection
//!                                                  │
//!                                                  ▼
//!                                   Link { reader, writer } ──► mpsc ──► session
//! ```
//!
//! A [`Link`] carries two capability objects: a [`LinkReader`] owned by the
//! session's inbound task and a [`LinkWriter`] owned by its outbound task.
//! Sessions never know which transport they run on.
//!
//! Binding is separate from accepting so that a node can bind every listener,
//! including `port=0` ones, before it reports itself ready.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameCodec;
use crate::config::ListenerConfig;
pub use crate::config::TransportKind;
use crate::error::FrameError;
use crate::messages::{Frame, FrameTag, MAX_FRAME_SIZE};

/// Largest frame written to a UDP link.
pub const UDP_MTU: usize = 1400;

/// Bound on TCP connect and WebSocket upgrade.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Datagrams buffered per UDP virtual link before new ones are dropped.
const UDP_LINK_BACKLOG: usize = 256;

/// Receive buffer for UDP sockets; larger than any legal datagram.
const UDP_RECV_BUFFER: usize = 64 * 1024;

// ============================================================================
// Capability Objects
// ============================================================================

#[async_trait]
pub trait LinkReader: Send {
    /// Next decoded frame; `Ok(None)` once the transport ended cleanly.
    async fn read(&mut self) -> Result<Option<Frame>, FrameError>;
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn write(&mut self, frame: Frame) -> Result<(), FrameError>;

    async fn close(&mut self);

    /// Largest encoded frame this link will carry.
    fn mtu(&self) -> usize;
}

/// A freshly established transport connection, not yet handshaken.
pub struct Link {
    pub kind: TransportKind,
    pub remote_addr: SocketAddr,
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

fn check_mtu(frame: &Frame, mtu: usize) -> Result<Vec<u8>, FrameError> {
    let bytes = frame.encode()?;
    if bytes.len() > mtu {
        return Err(FrameError::TooLarge {
            len: bytes.len(),
            max: mtu,
        });
    }
    Ok(bytes)
}

// ============================================================================
// TCP
// ============================================================================

struct TcpReader {
    inner: FramedRead<OwnedReadHalf, FrameCodec>,
}

#[async_trait]
impl LinkReader for TcpReader {
    async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        self.inner.next().await.transpose()
    }
}

struct TcpWriter {
    inner: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

#[async_trait]
impl LinkWriter for TcpWriter {
    async fn write(&mut self, frame: Frame) -> Result<(), FrameError> {
        self.inner.send(frame).await
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }

    fn mtu(&self) -> usize {
        MAX_FRAME_SIZE
    }
}

fn tcp_link(stream: TcpStream, remote_addr: SocketAddr) -> Link {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(remote = %remote_addr, error = %e, "set_nodelay failed");
    }
    let (read, write) = stream.into_split();
    Link {
        kind: TransportKind::Tcp,
        remote_addr,
        reader: Box::new(TcpReader {
            inner: FramedRead::new(read, FrameCodec),
        }),
        writer: Box::new(TcpWriter {
            inner: FramedWrite::new(write, FrameCodec),
        }),
    }
}

// ============================================================================
// WebSocket
// ============================================================================

struct WsReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> LinkReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        while let Some(message) = self.inner.next().await {
            match message? {
                Message::Binary(data) => return Frame::decode(&data).map(Some),
                Message::Close(_) => return Ok(None),
                // Text and WebSocket-level ping/pong are not part of the frame stream.
                _ => continue,
            }
        }
        Ok(None)
    }
}

struct WsWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> LinkWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, frame: Frame) -> Result<(), FrameError> {
        let bytes = check_mtu(&frame, MAX_FRAME_SIZE)?;
        self.inner.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }

    fn mtu(&self) -> usize {
        MAX_FRAME_SIZE
    }
}

fn ws_link<S>(stream: WebSocketStream<S>, remote_addr: SocketAddr) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    Link {
        kind: TransportKind::Ws,
        remote_addr,
        reader: Box::new(WsReader { inner: source }),
        writer: Box::new(WsWriter { inner: sink }),
    }
}

// ============================================================================
// UDP
// ============================================================================

type Demux = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Inbound side of a virtual link carved out of a listener socket.
struct UdpListenerReader {
    datagrams: mpsc::Receiver<Vec<u8>>,
    demux: Demux,
    remote: SocketAddr,
}

#[async_trait]
impl LinkReader for UdpListenerReader {
    async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        match self.datagrams.recv().await {
            Some(datagram) => Frame::decode(&datagram).map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for UdpListenerReader {
    fn drop(&mut self) {
        self.demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.remote);
    }
}

/// Reader for a dialed, connected UDP socket.
struct UdpDialReader {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

#[async_trait]
impl LinkReader for UdpDialReader {
    async fn read(&mut self) -> Result<Option<Frame>, FrameError> {
        let len = self.socket.recv(&mut self.buf).await?;
        Frame::decode(&self.buf[..len]).map(Some)
    }
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    /// `None` when the socket is connected to the remote.
    target: Option<SocketAddr>,
}

#[async_trait]
impl LinkWriter for UdpWriter {
    async fn write(&mut self, frame: Frame) -> Result<(), FrameError> {
        let bytes = check_mtu(&frame, UDP_MTU)?;
        match self.target {
            Some(addr) => self.socket.send_to(&bytes, addr).await?,
            None => self.socket.send(&bytes).await?,
        };
        Ok(())
    }

    async fn close(&mut self) {}

    fn mtu(&self) -> usize {
        UDP_MTU
    }
}

// ============================================================================
// Listener
// ============================================================================

enum BoundSocket {
    Tcp(TcpListener),
    Ws(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// A bound, not yet accepting, listener.
pub struct Listener {
    config: ListenerConfig,
    local_addr: SocketAddr,
    socket: BoundSocket,
}

impl Listener {
    /// Binds the socket. On return the OS already lists it as listening
    /// (or bound, for UDP) and `local_addr` carries the resolved port.
    pub async fn bind(config: &ListenerConfig) -> io::Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let socket = match config.kind {
            TransportKind::Tcp => BoundSocket::Tcp(TcpListener::bind(addr).await?),
            TransportKind::Ws => BoundSocket::Ws(TcpListener::bind(addr).await?),
            TransportKind::Udp => BoundSocket::Udp(Arc::new(UdpSocket::bind(addr).await?)),
        };
        let local_addr = match &socket {
            BoundSocket::Tcp(l) | BoundSocket::Ws(l) => l.local_addr()?,
            BoundSocket::Udp(s) => s.local_addr()?,
        };
        info!(kind = %config.kind, addr = %local_addr, "listener ready");
        Ok(Self {
            config: config.clone(),
            local_addr,
            socket,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Starts accepting. Each established link is pushed into `links`; the
    /// loop ends on cancellation or when the receiving side is gone.
    pub fn spawn_accept_loop(
        self,
        links: mpsc::Sender<Link>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let local_addr = self.local_addr;
        match self.socket {
            BoundSocket::Tcp(listener) => {
                tracker.spawn(stream_accept_loop(listener, false, links, cancel, tracker.clone()));
            }
            BoundSocket::Ws(listener) => {
                tracker.spawn(stream_accept_loop(listener, true, links, cancel, tracker.clone()));
            }
            BoundSocket::Udp(socket) => {
                tracker.spawn(udp_accept_loop(socket, links, cancel));
            }
        }
        debug!(addr = %local_addr, "accept loop started");
    }
}

async fn stream_accept_loop(
    listener: TcpListener,
    websocket: bool,
    links: mpsc::Sender<Link>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
            _ = links.closed() => break,
        };
        trace!(%remote, websocket, "accepted connection");

        let links = links.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let link = if websocket {
                let upgrade = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    tokio_tungstenite::accept_async(stream),
                );
                let ws = tokio::select! {
                    result = upgrade => result,
                    _ = cancel.cancelled() => return,
                };
                match ws {
                    Ok(Ok(ws)) => ws_link(ws, remote),
                    Ok(Err(e)) => {
                        debug!(%remote, error = %e, "websocket upgrade failed");
                        return;
                    }
                    Err(_) => {
                        debug!(%remote, "websocket upgrade timed out");
                        return;
                    }
                }
            } else {
                tcp_link(stream, remote)
            };
            let _ = links.send(link).await;
        });
    }
    debug!("stream accept loop stopped");
}

async fn udp_accept_loop(
    socket: Arc<UdpSocket>,
    links: mpsc::Sender<Link>,
    cancel: CancellationToken,
) {
    let demux: Demux = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let (len, remote) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms.
                    trace!(error = %e, "udp recv failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
            _ = links.closed() => break,
        };
        let mut datagram = buf[..len].to_vec();

        let existing = demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&remote)
            .cloned();
        if let Some(tx) = existing {
            match tx.try_send(datagram) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%remote, "udp link backlog full, datagram dropped");
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(d)) => {
                    demux
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&remote);
                    datagram = d;
                }
            }
        }

        // Only a handshake opens a new virtual link.
        if datagram.first() != Some(&(FrameTag::Handshake as u8)) {
            trace!(%remote, "stray datagram from unknown source dropped");
            continue;
        }

        let (tx, rx) = mpsc::channel(UDP_LINK_BACKLOG);
        let _ = tx.try_send(datagram);
        demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote, tx);

        let link = Link {
            kind: TransportKind::Udp,
            remote_addr: remote,
            reader: Box::new(UdpListenerReader {
                datagrams: rx,
                demux: demux.clone(),
                remote,
            }),
            writer: Box::new(UdpWriter {
                socket: socket.clone(),
                target: Some(remote),
            }),
        };
        trace!(%remote, "new udp virtual link");
        if links.send(link).await.is_err() {
            break;
        }
    }
    // Nothing feeds the virtual links any more; end their readers.
    demux.lock().unwrap_or_else(PoisonError::into_inner).clear();
    debug!("udp accept loop stopped");
}

// ============================================================================
// Dialing
// ============================================================================

/// Opens a link to `address` (`host:port`, or a `ws://` URL for WebSocket).
pub async fn dial(kind: TransportKind, address: &str) -> Result<Link, FrameError> {
    match kind {
        TransportKind::Tcp => {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            let remote = stream.peer_addr()?;
            Ok(tcp_link(stream, remote))
        }
        TransportKind::Ws => {
            let url = if address.starts_with("ws://") {
                address.to_string()
            } else {
                format!("ws://{address}/")
            };
            let (ws, _response) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            let remote = match ws.get_ref() {
                tokio_tungstenite::MaybeTlsStream::Plain(stream) => stream.peer_addr()?,
                _ => resolve(address.trim_start_matches("ws://").trim_end_matches('/')).await?,
            };
            Ok(ws_link(ws, remote))
        }
        TransportKind::Udp => {
            let remote = resolve(address).await?;
            let local: SocketAddr = if remote.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(remote).await?;
            let socket = Arc::new(socket);
            Ok(Link {
                kind: TransportKind::Udp,
                remote_addr: remote,
                reader: Box::new(UdpDialReader {
                    socket: socket.clone(),
                    buf: vec![0u8; UDP_RECV_BUFFER],
                }),
                writer: Box::new(UdpWriter {
                    socket,
                    target: None,
                }),
            })
        }
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {address}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Handshake;

    fn loopback(kind: TransportKind) -> ListenerConfig {
        let mut config = ListenerConfig::new(kind, 0);
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config
    }

    /// Keeps the accept loop's intake open for the lifetime of a test.
    struct Harness {
        _links: mpsc::Receiver<Link>,
        cancel: CancellationToken,
    }

    async fn accept_one(kind: TransportKind) -> (Link, Link, Harness) {
        let listener = Listener::bind(&loopback(kind)).await.unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        listener.spawn_accept_loop(tx, cancel.clone(), &tracker);

        let mut dialed = dial(kind, &addr.to_string()).await.unwrap();
        // UDP links only materialize once a handshake arrives.
        dialed
            .writer
            .write(Frame::Handshake(Handshake::new("dialer")))
            .await
            .unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let harness = Harness { _links: rx, cancel };
        (dialed, accepted, harness)
    }

    async fn exchange(kind: TransportKind) {
        let (mut dialed, mut accepted, harness) = accept_one(kind).await;
        assert_eq!(accepted.kind, kind);

        let first = accepted.reader.read().await.unwrap().unwrap();
        assert_eq!(first, Frame::Handshake(Handshake::new("dialer")));

        accepted.writer.write(Frame::Ping).await.unwrap();
        let ping = tokio::time::timeout(Duration::from_secs(3), dialed.reader.read()).await;
        assert_eq!(ping.unwrap().unwrap(), Some(Frame::Ping));

        dialed.writer.write(Frame::Pong).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(3), accepted.reader.read()).await;
        assert_eq!(pong.unwrap().unwrap(), Some(Frame::Pong));
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn tcp_exchange() {
        exchange(TransportKind::Tcp).await;
    }

    #[tokio::test]
    async fn ws_exchange() {
        exchange(TransportKind::Ws).await;
    }

    #[tokio::test]
    async fn udp_exchange() {
        exchange(TransportKind::Udp).await;
    }

    #[tokio::test]
    async fn udp_rejects_frames_above_mtu() {
        let (mut dialed, _accepted, harness) = accept_one(TransportKind::Udp).await;
        assert_eq!(dialed.writer.mtu(), UDP_MTU);
        let frame = Frame::Unit(crate::messages::UnitMessage {
            src_node: "a".into(),
            dst_node: "b".into(),
            src_service: "x".into(),
            dst_service: "y".into(),
            message_id: 1,
            hop_count: 0,
            body: crate::messages::UnitBody::Data(vec![0u8; UDP_MTU]),
        });
        assert!(matches!(
            dialed.writer.write(frame).await,
            Err(FrameError::TooLarge { .. })
        ));
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn udp_links_end_when_accept_loop_stops() {
        let (_dialed, mut accepted, harness) = accept_one(TransportKind::Udp).await;
        let _ = accepted.reader.read().await.unwrap();
        harness.cancel.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(3), accepted.reader.read()).await;
        assert_eq!(ended.expect("udp reader hung after shutdown").unwrap(), None);
    }

    #[tokio::test]
    async fn tcp_close_ends_reader() {
        let (mut dialed, mut accepted, harness) = accept_one(TransportKind::Tcp).await;
        let _ = accepted.reader.read().await.unwrap();
        dialed.writer.close().await;
        drop(dialed);
        assert_eq!(accepted.reader.read().await.unwrap(), None);
        harness.cancel.cancel();
    }
}
