//! # Peer Mesh
//!
//! TCP listener, dialer, handshake, discovery and health checks.
//!
//! ## Connection lifecycle
//!
//! ```text
//! dial / accept ──► handshake (timeout) ──► register ──► reader loop
//!                        │                      │            │
//!                        └─ reject / error ─────┴─► close    └─► EOF / error ──► remove
//! ```
//!
//! The peer table is only touched after the handshake has finished, so an
//! abandoned handshake never leaves an entry behind. Registration and
//! removal each happen together with their event under one lock, and the
//! node sees `PeerConnected` and `PeerDisconnected` strictly alternate per
//! peer. When a duplicate connection replaces a live one, the replaced one
//! is reported disconnected first.
//!
//! Each live connection has two tasks. The writer drains a bounded queue
//! into the socket. The reader decodes frames and turns them into
//! [`MeshEvent`]s for whoever owns the receiving end of the event channel
//! (the node actor). Ping and peer-list traffic is answered here and never
//! reaches the node.
//!
//! ## Design Decisions
//!
//! - **Sends never block.** `send_to` and `broadcast` use `try_send` on
//!   the per-peer queue. A full queue drops the message and logs it. Every
//!   message we carry is either retried by its protocol (Raft, sync) or
//!   repeated by gossip, and a stalled peer must not stall the node.
//! - **Redial instead of keepalive.** A missing pong is not a failure.
//!   Only a broken socket removes a peer, and the health loop redials
//!   every known address that isn't connected.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::message::{
    read_frame, write_frame, Envelope, Handshake, HandshakeAck, Message, NetworkError,
    NetworkResult, PeerAddress,
};
use super::peer::{PeerInfo, PeerManager, PeerStatus};
use crate::config::{DEFAULT_P2P_PORT, HANDSHAKE_TIMEOUT, MAX_PEERS, PEER_SEND_QUEUE, PING_INTERVAL};
use crate::consensus::NodeId;
use crate::crypto::keys::{node_id_from_hex, NodeKeypair};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address to bind. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Address advertised to peers. Defaults to the bound address, with an
    /// unspecified IP replaced by loopback.
    pub advertise_addr: Option<String>,
    /// Addresses dialed at startup and redialed while disconnected.
    pub seeds: Vec<String>,
    pub organization: String,
    pub max_peers: usize,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            advertise_addr: None,
            seeds: Vec::new(),
            organization: "default".to_string(),
            max_peers: MAX_PEERS,
            ping_interval: PING_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            send_queue: PEER_SEND_QUEUE,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerConnected(PeerInfo),
    PeerDisconnected { node_id: NodeId },
    /// Anything the mesh doesn't handle itself.
    Message { from: NodeId, message: Message },
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

struct Inner {
    config: MeshConfig,
    node_id: NodeId,
    public_key: String,
    advertise: String,
    local_addr: SocketAddr,
    peers: PeerManager,
    events: mpsc::Sender<MeshEvent>,
    height: AtomicU64,
    /// Addresses with a dial in progress.
    dialing: DashMap<String, ()>,
    /// Which node answered at each dialed address.
    dialed_ids: DashMap<String, NodeId>,
    /// Held while a table change and its event go out.
    lifecycle: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

/// Handle to the running mesh. Cheap to clone.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("node_id", &self.inner.node_id)
            .field("local_addr", &self.inner.local_addr)
            .field("peers", &self.inner.peers.count())
            .finish()
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn advertise_for(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("127.0.0.1:{}", addr.port())
    } else {
        addr.to_string()
    }
}

impl Mesh {
    /// Bind the listener, start the accept and health loops, dial seeds.
    pub async fn start(
        config: MeshConfig,
        keypair: &NodeKeypair,
        events: mpsc::Sender<MeshEvent>,
    ) -> NetworkResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| advertise_for(local_addr));
        let node_id = keypair.node_id();
        let (shutdown, _) = watch::channel(false);

        let mesh = Self {
            inner: Arc::new(Inner {
                peers: PeerManager::new(node_id.clone(), config.max_peers),
                public_key: keypair.public_key_hex(),
                node_id,
                advertise,
                local_addr,
                events,
                height: AtomicU64::new(0),
                dialing: DashMap::new(),
                dialed_ids: DashMap::new(),
                lifecycle: Mutex::new(()),
                shutdown,
                config,
            }),
        };

        tokio::spawn(mesh.clone().accept_loop(listener));
        tokio::spawn(mesh.clone().health_loop());
        for seed in mesh.inner.config.seeds.clone() {
            mesh.connect(seed);
        }

        info!(
            node = %mesh.inner.node_id,
            listen = %local_addr,
            advertise = %mesh.inner.advertise,
            seeds = mesh.inner.config.seeds.len(),
            "peer mesh started"
        );
        Ok(mesh)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn advertise_addr(&self) -> &str {
        &self.inner.advertise
    }

    pub fn peers(&self) -> &PeerManager {
        &self.inner.peers
    }

    /// Chain height announced in handshakes and pings.
    pub fn set_height(&self, height: u64) {
        self.inner.height.store(height, Ordering::Relaxed);
    }

    pub fn height(&self) -> u64 {
        self.inner.height.load(Ordering::Relaxed)
    }

    /// Queue `message` for one peer.
    pub fn send_to(&self, node_id: &str, message: Message) -> NetworkResult<()> {
        let sender = self
            .inner
            .peers
            .sender(node_id)
            .ok_or_else(|| NetworkError::PeerNotFound(node_id.to_string()))?;
        let kind = message.kind();
        sender
            .try_send(Envelope::new(self.inner.node_id.clone(), message))
            .map_err(|_| {
                warn!(peer = %node_id, kind, "send queue full, dropping message");
                NetworkError::SendFailed(node_id.to_string())
            })
    }

    /// Queue `message` for every connected peer. Returns how many accepted
    /// it.
    pub fn broadcast(&self, message: Message) -> usize {
        let envelope = Envelope::new(self.inner.node_id.clone(), message);
        let mut delivered = 0;
        for (peer, sender) in self.inner.peers.senders() {
            match sender.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(peer = %peer, kind = envelope.message.kind(), "send queue full, dropping message")
                }
            }
        }
        delivered
    }

    /// Dial `address` in the background unless a dial is already running or
    /// the node behind it is connected.
    pub fn connect(&self, address: String) {
        if address == self.inner.advertise || *self.inner.shutdown.borrow() {
            return;
        }
        if let Some(id) = self.inner.dialed_ids.get(&address) {
            if self.inner.peers.is_connected(id.value()) {
                return;
            }
        }
        if self.inner.dialing.insert(address.clone(), ()).is_some() {
            return;
        }
        let mesh = self.clone();
        tokio::spawn(async move {
            let dial = timeout(
                mesh.inner.config.handshake_timeout,
                TcpStream::connect(address.as_str()),
            )
            .await;
            match dial {
                Ok(Ok(stream)) => mesh.run_connection(stream, Some(address)).await,
                Ok(Err(e)) => {
                    mesh.inner.dialing.remove(&address);
                    debug!(address = %address, error = %e, "dial failed");
                }
                Err(_) => {
                    mesh.inner.dialing.remove(&address);
                    debug!(address = %address, "dial timed out");
                }
            }
        });
    }

    /// Close the listener and every connection.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.peers.clear();
        info!(node = %self.inner.node_id, "peer mesh stopped");
    }

    // -- Loops ---------------------------------------------------------------

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!(remote = %addr, "inbound connection");
                        let mesh = self.clone();
                        tokio::spawn(async move { mesh.run_connection(stream, None).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }

    async fn health_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.broadcast(Message::Ping { height: self.height() });
                    for seed in &self.inner.config.seeds {
                        self.connect(seed.clone());
                    }
                    for peer in self.inner.peers.disconnected_known() {
                        self.connect(peer.address);
                    }
                }
            }
        }
    }

    // -- Connections ---------------------------------------------------------

    async fn run_connection(self, stream: TcpStream, dialed: Option<String>) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "set_nodelay failed");
        }
        let conn_id = self.inner.peers.next_conn_id();
        let (mut reader, mut writer) = stream.into_split();

        let outbound = dialed.is_some();
        let result = match timeout(
            self.inner.config.handshake_timeout,
            self.handshake(&mut reader, &mut writer, outbound),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::HandshakeTimeout),
        };
        if let Some(address) = &dialed {
            self.inner.dialing.remove(address);
        }
        let (peer, initiator) = match result {
            Ok(ok) => ok,
            Err(e) => {
                debug!(conn_id, outbound, address = ?dialed, error = %e, "handshake failed");
                return;
            }
        };

        let (queue_tx, queue_rx) = mpsc::channel(self.inner.config.send_queue);
        let Some(peer) = self
            .join(peer, conn_id, initiator, queue_tx.clone(), outbound)
            .await
        else {
            return;
        };
        if let Some(address) = dialed {
            self.inner.dialed_ids.insert(address, peer.node_id.clone());
        }
        if !outbound {
            self.share_peers(&peer.node_id, &queue_tx);
        }
        // The table holds the only sender from here on.
        drop(queue_tx);
        let writer_task = tokio::spawn(write_loop(writer, queue_rx));

        self.read_loop(reader, &peer.node_id, conn_id).await;

        writer_task.abort();
        self.leave(&peer.node_id, conn_id).await;
    }

    /// Register a handshaken connection and report it.
    async fn join(
        &self,
        mut peer: PeerInfo,
        conn_id: u64,
        initiator: NodeId,
        sender: mpsc::Sender<Envelope>,
        outbound: bool,
    ) -> Option<PeerInfo> {
        let _order = self.inner.lifecycle.lock().await;
        let replaced = match self
            .inner
            .peers
            .register(peer.clone(), conn_id, initiator, sender)
        {
            Ok(replaced) => replaced,
            Err(reason) => {
                debug!(peer = %peer.node_id, conn_id, outbound, %reason, "connection refused after handshake");
                return None;
            }
        };
        if let Some(old) = replaced {
            self.emit(MeshEvent::PeerDisconnected {
                node_id: old.node_id,
            })
            .await;
        }
        peer.status = PeerStatus::Connected;
        info!(peer = %peer.node_id, address = %peer.address, height = peer.height, outbound, "peer connected");
        self.emit(MeshEvent::PeerConnected(peer.clone())).await;
        Some(peer)
    }

    /// Drop a connection from the table and report it, unless a newer
    /// connection has taken its place.
    async fn leave(&self, node_id: &str, conn_id: u64) {
        let _order = self.inner.lifecycle.lock().await;
        if self.inner.peers.remove(node_id, conn_id).is_some() {
            info!(peer = %node_id, "peer disconnected");
            self.emit(MeshEvent::PeerDisconnected {
                node_id: node_id.to_string(),
            })
            .await;
        }
    }

    /// Discovery: tell a newcomer who else we know.
    fn share_peers(&self, node_id: &str, queue: &mpsc::Sender<Envelope>) {
        let others = self.inner.peers.addresses_except(node_id);
        if others.is_empty() {
            return;
        }
        let list = Envelope::new(
            self.inner.node_id.clone(),
            Message::PeerList { peers: others },
        );
        if queue.try_send(list).is_err() {
            debug!(peer = %node_id, "could not queue peer list");
        }
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            node_id: self.inner.node_id.clone(),
            public_key: self.inner.public_key.clone(),
            organization: self.inner.config.organization.clone(),
            height: self.height(),
            listen_addr: self.inner.advertise.clone(),
        }
    }

    fn check_identity(&self, claimed: &Handshake, from: &str) -> NetworkResult<()> {
        if claimed.node_id != from {
            return Err(NetworkError::Handshake(format!(
                "envelope sender {} does not match handshake id {}",
                from, claimed.node_id
            )));
        }
        match node_id_from_hex(&claimed.public_key) {
            Some(derived) if derived == claimed.node_id => Ok(()),
            _ => Err(NetworkError::Handshake(format!(
                "node id {} does not match its public key",
                claimed.node_id
            ))),
        }
    }

    fn peer_info(claimed: &Handshake) -> PeerInfo {
        PeerInfo {
            node_id: claimed.node_id.clone(),
            public_key: claimed.public_key.clone(),
            organization: claimed.organization.clone(),
            address: claimed.listen_addr.clone(),
            status: PeerStatus::Connecting,
            height: claimed.height,
            connected_at: now_millis(),
        }
    }

    /// Exchange and check identities. Returns the peer and the id of the
    /// node that opened the connection. Leaves the peer table untouched.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        outbound: bool,
    ) -> NetworkResult<(PeerInfo, NodeId)> {
        let local_id = self.inner.node_id.clone();

        if outbound {
            let hello = Envelope::new(local_id.clone(), Message::Handshake(self.local_handshake()));
            write_frame(writer, &hello).await?;

            let reply = read_frame(reader).await?;
            let ack = match reply.message {
                Message::HandshakeAck(ack) => ack,
                other => {
                    return Err(NetworkError::Handshake(format!(
                        "expected HandshakeAck, got {}",
                        other.kind()
                    )))
                }
            };
            if !ack.accepted {
                return Err(NetworkError::Rejected(ack.reason.unwrap_or_default()));
            }
            self.check_identity(&ack.identity, &reply.from)?;
            return Ok((Self::peer_info(&ack.identity), local_id));
        }

        let hello = read_frame(reader).await?;
        let claimed = match hello.message {
            Message::Handshake(h) => h,
            other => {
                return Err(NetworkError::Handshake(format!(
                    "expected Handshake, got {}",
                    other.kind()
                )))
            }
        };

        let verdict = self.check_identity(&claimed, &hello.from).and_then(|()| {
            self.inner
                .peers
                .admissible(&claimed.node_id, &claimed.node_id)
                .map_err(|reason| NetworkError::Rejected(reason.to_string()))
        });

        let ack = HandshakeAck {
            identity: self.local_handshake(),
            accepted: verdict.is_ok(),
            reason: verdict.as_ref().err().map(|e| match e {
                NetworkError::Rejected(reason) => reason.clone(),
                other => other.to_string(),
            }),
        };
        let sent = write_frame(writer, &Envelope::new(local_id, Message::HandshakeAck(ack))).await;
        verdict?;
        sent?;
        Ok((Self::peer_info(&claimed), claimed.node_id))
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, node_id: &str, conn_id: u64) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(peer = %node_id, error = %e, "connection closed");
                        break;
                    }
                },
            };
            if !self.inner.peers.is_live(node_id, conn_id) {
                debug!(peer = %node_id, conn_id, "superseded connection, closing");
                break;
            }
            if envelope.from != node_id {
                warn!(peer = %node_id, claimed = %envelope.from, "sender mismatch, dropping frame");
                continue;
            }
            trace!(peer = %node_id, kind = envelope.message.kind(), "frame received");

            match envelope.message {
                Message::Ping { height } => {
                    self.inner.peers.update_height(node_id, height);
                    let pong = Message::Pong {
                        height: self.height(),
                    };
                    if let Err(e) = self.send_to(node_id, pong) {
                        debug!(peer = %node_id, error = %e, "pong not sent");
                    }
                }
                Message::Pong { height } => {
                    self.inner.peers.update_height(node_id, height);
                    self.emit(MeshEvent::Message {
                        from: node_id.to_string(),
                        message: Message::Pong { height },
                    })
                    .await;
                }
                Message::PeerList { peers } => self.discover(peers),
                Message::Handshake(_) | Message::HandshakeAck(_) => {
                    debug!(peer = %node_id, "handshake after connect, ignoring");
                }
                message => {
                    self.emit(MeshEvent::Message {
                        from: node_id.to_string(),
                        message,
                    })
                    .await;
                }
            }
        }
    }

    fn discover(&self, peers: Vec<PeerAddress>) {
        for peer in peers {
            if peer.node_id == self.inner.node_id || self.inner.peers.is_connected(&peer.node_id) {
                continue;
            }
            debug!(peer = %peer.node_id, address = %peer.address, "discovered peer");
            self.inner.peers.remember(&peer.node_id, &peer.address);
            self.connect(peer.address);
        }
    }

    async fn emit(&self, event: MeshEvent) {
        if self.inner.events.send(event).await.is_err() {
            trace!("mesh event receiver gone");
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &envelope).await {
            debug!(error = %e, "write failed, closing writer");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
