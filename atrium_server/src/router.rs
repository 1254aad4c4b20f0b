use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use atrium_core::error::CoreError;
use atrium_core::route::{sysmsg, RouteHeader, RoutePacket};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher;
use crate::server::ServerCore;

/// Lifecycle of a peer server as reported by the system controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Down,
}

/// One row of the server directory: where a NID lives and whether it is
/// usable. The directory is an eventually-consistent view pushed in by an
/// external system controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDirectoryEntry {
    pub nid: String,
    pub endpoint: String,
    pub state: ServerState,
    #[serde(default)]
    pub last_seen_ms: u64,
}

/// NID to endpoint map, replaced wholesale on every controller push.
pub(crate) struct ServerDirectory {
    entries: DashMap<String, ServerDirectoryEntry>,
}

impl ServerDirectory {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn update(&self, entries: Vec<ServerDirectoryEntry>) {
        self.entries.clear();
        for entry in entries {
            self.entries.insert(entry.nid.clone(), entry);
        }
    }

    /// Endpoint for a NID, if it is listed and not going away.
    pub(crate) fn endpoint_of(&self, nid: &str) -> Option<String> {
        self.entries.get(nid).and_then(|entry| {
            matches!(entry.state, ServerState::Starting | ServerState::Running)
                .then(|| entry.endpoint.clone())
        })
    }

    pub(crate) fn snapshot(&self) -> Vec<ServerDirectoryEntry> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[derive(Clone)]
struct PeerLink {
    tx: mpsc::Sender<RoutePacket>,
}

/// Router-to-router fabric.
///
/// Every logical channel is symmetric: this server listens for peers and
/// lazily dials whichever NID it first needs to reach. The first envelope
/// on any fresh link is a HELLO naming the dialer, so the acceptor can use
/// the same socket for its own traffic back. Outbound queues are bounded;
/// a full queue surfaces as an immediate `Backpressure` error and nothing
/// blocks.
pub(crate) struct Router {
    server: Weak<ServerCore>,
    peers: DashMap<String, PeerLink>,
    capacity: usize,
}

impl Router {
    pub(crate) fn new(server: Weak<ServerCore>, capacity: usize) -> Self {
        Self {
            server,
            peers: DashMap::new(),
            capacity,
        }
    }

    pub(crate) async fn listen(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(SocketAddr, JoinHandle<()>), CoreError> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let server = self.server.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handle_inbound_peer(server.clone(), stream, peer_addr));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "router accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        tracing::info!(addr = %addr, "router listening");
        Ok((addr, handle))
    }

    /// Hand an envelope to the peer's outbound queue, dialing on first use.
    /// Never blocks: a full queue is `Backpressure`, an unknown NID is
    /// `UnknownPeer`, both reported synchronously.
    pub(crate) fn send(&self, nid: &str, packet: RoutePacket) -> Result<(), CoreError> {
        let link = match self.peers.get(nid) {
            Some(link) => link.clone(),
            None => self.open_link(nid)?,
        };
        match link.tx.try_send(packet) {
            Ok(()) => {
                if let Some(core) = self.server.upgrade() {
                    core.metrics.record_envelope_sent();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(CoreError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.peers.remove(nid);
                Err(CoreError::ConnectionClosed)
            }
        }
    }

    fn open_link(&self, nid: &str) -> Result<PeerLink, CoreError> {
        use dashmap::mapref::entry::Entry;

        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        let endpoint = core
            .peer_directory
            .endpoint_of(nid)
            .ok_or_else(|| CoreError::UnknownPeer(nid.to_string()))?;

        match self.peers.entry(nid.to_string()) {
            Entry::Occupied(slot) => Ok(slot.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.capacity);
                let link = PeerLink { tx };
                slot.insert(link.clone());
                tokio::spawn(run_outbound_peer(
                    self.server.clone(),
                    nid.to_string(),
                    endpoint,
                    rx,
                ));
                Ok(link)
            }
        }
    }

    /// Adopt an accepted socket as the send path for `nid`, unless a link
    /// already exists — envelopes to one peer must stay on one socket to
    /// keep their order.
    fn register_link(&self, nid: &str, link: PeerLink) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.peers.entry(nid.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(link);
                true
            }
        }
    }

    /// Remove a peer's link, but only if it is actually dead; a replacement
    /// link may have taken the slot while the old tasks were winding down.
    pub(crate) fn drop_peer(&self, nid: &str) {
        let dead = self
            .peers
            .get(nid)
            .map(|link| link.tx.is_closed())
            .unwrap_or(false);
        if dead {
            self.peers.remove(nid);
        }
    }

    pub(crate) fn shutdown(&self) {
        // Dropping the senders ends every writer task.
        self.peers.clear();
    }
}

/// Dial a peer, say hello, then pump the bounded queue onto the socket.
async fn run_outbound_peer(
    server: Weak<ServerCore>,
    nid: String,
    endpoint: String,
    mut rx: mpsc::Receiver<RoutePacket>,
) {
    let stream = match TcpStream::connect(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(peer = %nid, endpoint = %endpoint, error = %e, "peer dial failed");
            drop(rx);
            peer_lost(&server, &nid);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();

    let hello = match hello_packet(&server) {
        Some(hello) => hello,
        None => return,
    };
    match hello.encode() {
        Ok(bytes) => {
            if write_half.write_all(&bytes).await.is_err() {
                drop(rx);
                peer_lost(&server, &nid);
                return;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "hello encoding failed");
            return;
        }
    }
    tracing::info!(peer = %nid, endpoint = %endpoint, "peer link established");

    tokio::spawn(run_peer_reader(server.clone(), nid.clone(), read_half, None));

    while let Some(packet) = rx.recv().await {
        match packet.encode() {
            Ok(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(peer = %nid, error = %e, "envelope encoding failed");
            }
        }
    }
    drop(rx);
    peer_lost(&server, &nid);
}

fn hello_packet(server: &Weak<ServerCore>) -> Option<RoutePacket> {
    let core = server.upgrade()?;
    Some(RoutePacket::new(
        RouteHeader {
            msg_seq: 0,
            service_type: core.config.service_type,
            msg_id: sysmsg::HELLO.to_string(),
            from_nid: core.config.nid.clone(),
            stage_id: 0,
            account_id: String::new(),
            is_reply: false,
            error_code: 0,
        },
        Bytes::new(),
    ))
}

fn peer_lost(server: &Weak<ServerCore>, nid: &str) {
    if let Some(core) = server.upgrade() {
        core.router.drop_peer(nid);
        core.tracker.fail_peer(nid);
        tracing::warn!(peer = %nid, "peer link lost");
    }
}

/// Accepted side of a link: expect HELLO, register the write half under the
/// caller's NID, then consume envelopes.
async fn handle_inbound_peer(server: Weak<ServerCore>, stream: TcpStream, peer_addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let max = match server.upgrade() {
        Some(core) => core.config.max_message_size,
        None => return,
    };
    let first = match read_envelope(&mut read_half, max).await {
        Ok(Some(packet)) => packet,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(peer = %peer_addr, error = %e, "bad first envelope");
            return;
        }
    };
    if first.header.msg_id != sysmsg::HELLO {
        tracing::warn!(peer = %peer_addr, msg_id = %first.header.msg_id, "peer skipped hello");
        return;
    }
    let nid = first.header.from_nid.clone();

    let Some(core) = server.upgrade() else {
        return;
    };
    let (tx, mut rx) = mpsc::channel::<RoutePacket>(core.config.peer_queue_capacity);
    let registered = core.router.register_link(&nid, PeerLink { tx });
    drop(core);
    tracing::info!(peer = %nid, addr = %peer_addr, registered, "peer link accepted");

    if registered {
        let writer_nid = nid.clone();
        let writer_server = server.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match packet.encode() {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %writer_nid, error = %e, "envelope encoding failed");
                    }
                }
            }
            drop(rx);
            peer_lost(&writer_server, &writer_nid);
        });
        run_peer_reader(server, nid, read_half, None).await;
    } else {
        // A link to this peer already exists; replies ride that one. The
        // write half is parked with the reader so the socket stays open.
        drop(rx);
        run_peer_reader(server, nid, read_half, Some(write_half)).await;
    }
}

/// Pump decoded envelopes from one peer socket into the dispatcher.
/// `parked_write` keeps an otherwise-unused write half alive for the life
/// of the socket.
async fn run_peer_reader(
    server: Weak<ServerCore>,
    nid: String,
    mut read_half: OwnedReadHalf,
    _parked_write: Option<tokio::net::tcp::OwnedWriteHalf>,
) {
    let max = match server.upgrade() {
        Some(core) => core.config.max_message_size,
        None => return,
    };
    loop {
        match read_envelope(&mut read_half, max).await {
            Ok(Some(packet)) => {
                let Some(core) = server.upgrade() else {
                    return;
                };
                dispatcher::handle_route_packet(&core, packet).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %nid, error = %e, "peer stream failed");
                break;
            }
        }
    }
    peer_lost(&server, &nid);
}

/// Read one `[u32 BE length][body]` envelope. `None` on clean EOF.
async fn read_envelope(
    read_half: &mut OwnedReadHalf,
    max_size: usize,
) -> Result<Option<RoutePacket>, CoreError> {
    let mut prefix = [0u8; 4];
    match read_half.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len == 0 || body_len > max_size {
        return Err(CoreError::Codec(format!(
            "envelope of {} bytes outside 1..={}",
            body_len, max_size
        )));
    }
    let mut body = vec![0u8; body_len];
    read_half.read_exact(&mut body).await?;
    Ok(Some(RoutePacket::decode(&body)?))
}
