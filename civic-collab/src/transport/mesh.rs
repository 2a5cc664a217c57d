//! Peer-mesh transport: direct WebSocket links between replicas.
//!
//! The hub is only a rendezvous here. Every replica listens on its own
//! socket, joins the room's channel on the first reachable signaling
//! endpoint and announces its address; announced peers are dialed
//! directly, the lower replica id dialing so each pair opens one link.
//!
//! ```text
//!            signaling hub (channel "civic-<room>")
//!             ▲  Announce{addr}        ▲  Announce{addr, reply}
//!             │                        │
//!        ┌────┴─────┐   direct link   ┌┴─────────┐
//!        │ replica 3│ ◄─────────────► │ replica 8│
//!        └──────────┘  Join, Delta,   └──────────┘
//!                      Presence
//! ```
//!
//! Status is `Connected` while at least one direct link is open, or while
//! the replica sits on the rendezvous with no announced peer it failed to
//! reach (a lone participant is healthy). A failed dial with no open link
//! leaves the transport `Connecting`, which is what lets the failover
//! monitor switch to the relay.
//!
//! Reference: Kleppmann, Chapter 5, Leaderless Replication

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    encode_presence, require_runtime, Listeners, PeerEvent, Transport, TransportError,
    TransportKind, TransportStatus,
};
use crate::document::Delta;
use crate::ids::ReplicaId;
use crate::presence::PresenceUpdate;
use crate::protocol::{MessageType, PeerInfo, Signal, SyncMessage};

/// How long a freshly opened link may take to identify itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Mesh settings.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Signaling hubs, tried in order
    pub signaling: Vec<String>,
    /// Local listen address for inbound links
    pub listen_addr: String,
    /// Upper bound on simultaneous direct links
    pub max_peers: usize,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl MeshConfig {
    pub fn new(signaling: Vec<String>) -> Self {
        Self {
            signaling,
            listen_addr: "127.0.0.1:0".to_string(),
            max_peers: 20,
            retry_min: Duration::from_millis(250),
            retry_max: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct MeshState {
    links: HashMap<ReplicaId, mpsc::UnboundedSender<Vec<u8>>>,
    dialing: HashSet<ReplicaId>,
    unreachable: HashSet<ReplicaId>,
    on_rendezvous: bool,
}

struct MeshShared {
    peer: PeerInfo,
    channel: String,
    config: MeshConfig,
    listeners: Arc<Listeners>,
    state: Mutex<MeshState>,
}

impl MeshShared {
    fn state(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh_status(&self) {
        let status = {
            let state = self.state();
            if !state.links.is_empty() || (state.on_rendezvous && state.unreachable.is_empty()) {
                TransportStatus::Connected
            } else {
                TransportStatus::Connecting
            }
        };
        self.listeners.set_status(status);
    }

    /// Reserve a dial slot for `remote`. False if linked, already dialing,
    /// or at capacity.
    fn begin_dial(&self, remote: ReplicaId) -> bool {
        let mut state = self.state();
        if state.links.contains_key(&remote) || state.dialing.contains(&remote) {
            return false;
        }
        if state.links.len() + state.dialing.len() >= self.config.max_peers {
            log::debug!("Mesh: peer budget {} reached, not dialing {remote}", self.config.max_peers);
            return false;
        }
        state.dialing.insert(remote);
        true
    }

    fn dial_failed(&self, remote: ReplicaId) {
        {
            let mut state = self.state();
            state.dialing.remove(&remote);
            state.unreachable.insert(remote);
        }
        self.refresh_status();
    }

    /// Register an open link. False for duplicates or when full.
    fn register(&self, remote: ReplicaId, tx: mpsc::UnboundedSender<Vec<u8>>) -> bool {
        {
            let mut state = self.state();
            let reserved = state.dialing.remove(&remote);
            if state.links.contains_key(&remote)
                || (!reserved && state.links.len() + state.dialing.len() >= self.config.max_peers)
            {
                return false;
            }
            state.unreachable.remove(&remote);
            state.links.insert(remote, tx);
        }
        self.refresh_status();
        true
    }

    fn unregister(&self, remote: ReplicaId) {
        self.state().links.remove(&remote);
        self.refresh_status();
    }

    fn send_all(&self, frame: Vec<u8>) {
        let state = self.state();
        for tx in state.links.values() {
            let _ = tx.send(frame.clone());
        }
    }
}

/// Peer-mesh transport.
pub struct MeshTransport {
    shared: Arc<MeshShared>,
    clock: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl MeshTransport {
    pub fn new(peer: PeerInfo, channel: impl Into<String>, config: MeshConfig) -> Self {
        Self {
            shared: Arc::new(MeshShared {
                peer,
                channel: channel.into(),
                config,
                listeners: Listeners::new(TransportKind::Mesh),
                state: Mutex::new(MeshState::default()),
            }),
            clock: AtomicU64::new(0),
            task: None,
        }
    }

    /// Replica ids of currently linked peers.
    pub fn linked_peers(&self) -> Vec<ReplicaId> {
        let mut peers: Vec<ReplicaId> = self.shared.state().links.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Transport for MeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.shared.config.signaling.is_empty() {
            return Err(TransportError::NoEndpoint);
        }
        let runtime = require_runtime()?;
        self.shared.listeners.set_status(TransportStatus::Connecting);
        self.task = Some(runtime.spawn(run_mesh(self.shared.clone())));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            // Aborting drops the JoinSet, which aborts every link task.
            task.abort();
            log::info!("Mesh: disconnected from channel {}", self.shared.channel);
        }
        *self.shared.state() = MeshState::default();
        self.shared.listeners.set_status(TransportStatus::Disconnected);
    }

    fn broadcast_delta(&self, delta: &Delta) {
        let msg = SyncMessage::delta(
            self.shared.peer.replica_id,
            &self.shared.channel,
            self.next_clock(),
            delta.as_bytes().to_vec(),
        );
        match msg.encode() {
            Ok(frame) => self.shared.send_all(frame),
            Err(e) => log::warn!("Mesh: delta could not be encoded: {e}"),
        }
    }

    fn broadcast_presence(&self, update: &PresenceUpdate) {
        if let Some(frame) = encode_presence(
            self.shared.peer.replica_id,
            &self.shared.channel,
            self.clock.load(Ordering::Relaxed),
            update,
        ) {
            self.shared.send_all(frame);
        }
    }

    fn listeners(&self) -> &Listeners {
        &self.shared.listeners
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Connection tasks ──────────────────────────────────────────────

async fn run_mesh(shared: Arc<MeshShared>) {
    let listener = match TcpListener::bind(&shared.config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::warn!("Mesh: cannot listen on {}: {e}", shared.config.listen_addr);
            shared.listeners.set_status(TransportStatus::Disconnected);
            return;
        }
    };
    let announce_addr = match listener.local_addr() {
        Ok(addr) => format!("ws://{addr}"),
        Err(e) => {
            log::warn!("Mesh: listener has no local address: {e}");
            shared.listeners.set_status(TransportStatus::Disconnected);
            return;
        }
    };
    log::info!("Mesh: accepting peer links on {announce_addr}");

    let mut links = JoinSet::new();
    let mut delay = shared.config.retry_min;

    loop {
        for endpoint in &shared.config.signaling {
            match tokio_tungstenite::connect_async(endpoint.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Mesh: joined rendezvous {endpoint}");
                    delay = shared.config.retry_min;
                    if let Err(e) =
                        serve_rendezvous(&shared, ws, &listener, &announce_addr, &mut links).await
                    {
                        log::warn!("Mesh: rendezvous {endpoint} lost: {e}");
                    }
                    shared.state().on_rendezvous = false;
                    shared.refresh_status();
                    break;
                }
                Err(e) => log::warn!("Mesh: signaling endpoint {endpoint} unreachable: {e}"),
            }
        }

        // Existing links keep working and inbound links are still accepted
        // while the rendezvous is retried.
        let retry = tokio::time::sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                accepted = listener.accept() => accept_inbound(&shared, accepted, &mut links),
                Some(_) = links.join_next(), if !links.is_empty() => {}
            }
        }
        delay = (delay * 2).min(shared.config.retry_max);
    }
}

async fn serve_rendezvous<S>(
    shared: &Arc<MeshShared>,
    ws: WebSocketStream<S>,
    listener: &TcpListener,
    announce_addr: &str,
    links: &mut JoinSet<()>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let local = shared.peer.replica_id;
    let channel = shared.channel.as_str();

    let join = SyncMessage::join(channel, &shared.peer).encode()?;
    sink.send(Message::Binary(join.into())).await?;
    let announce = Signal::Announce {
        addr: announce_addr.to_string(),
        reply: false,
    };
    sink.send(Message::Binary(SyncMessage::signal(local, channel, &announce).encode()?.into()))
        .await?;

    shared.state().on_rendezvous = true;
    shared.refresh_status();

    loop {
        tokio::select! {
            accepted = listener.accept() => accept_inbound(shared, accepted, links),

            Some(_) = links.join_next(), if !links.is_empty() => {}

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Mesh: dropping undecodable signaling frame: {e}");
                            continue;
                        }
                    };
                    if msg.msg_type != MessageType::Signal || msg.peer_id == local {
                        continue;
                    }
                    let Ok(Signal::Announce { addr, reply }) = msg.signal_payload() else {
                        log::warn!("Mesh: dropping malformed signal from {}", msg.peer_id);
                        continue;
                    };
                    log::debug!("Mesh: peer {} announced {addr}", msg.peer_id);

                    if !reply {
                        let answer = Signal::Announce {
                            addr: announce_addr.to_string(),
                            reply: true,
                        };
                        let frame = SyncMessage::signal(local, channel, &answer).encode()?;
                        sink.send(Message::Binary(frame.into())).await?;
                    }
                    if local < msg.peer_id && shared.begin_dial(msg.peer_id) {
                        links.spawn(dial(shared.clone(), msg.peer_id, addr));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

fn accept_inbound(
    shared: &Arc<MeshShared>,
    accepted: std::io::Result<(TcpStream, std::net::SocketAddr)>,
    links: &mut JoinSet<()>,
) {
    match accepted {
        Ok((stream, addr)) => {
            log::debug!("Mesh: inbound connection from {addr}");
            let shared = shared.clone();
            links.spawn(async move {
                if let Err(e) = inbound(shared, stream).await {
                    log::warn!("Mesh: inbound link from {addr} failed: {e}");
                }
            });
        }
        Err(e) => log::warn!("Mesh: accept failed: {e}"),
    }
}

async fn dial(shared: Arc<MeshShared>, remote: ReplicaId, addr: String) {
    match open_link(&shared, &addr).await {
        Ok((ws, info)) if info.replica_id == remote => run_link(shared, ws, info).await,
        Ok((_, info)) => {
            log::warn!("Mesh: {addr} identified as {} instead of {remote}", info.replica_id);
            shared.dial_failed(remote);
        }
        Err(e) => {
            log::warn!("Mesh: could not reach peer {remote} at {addr}: {e}");
            shared.dial_failed(remote);
        }
    }
}

async fn open_link(
    shared: &MeshShared,
    addr: &str,
) -> Result<(WebSocketStream<MaybeTlsStream<TcpStream>>, PeerInfo), TransportError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(addr).await?;
    let join = SyncMessage::join(&shared.channel, &shared.peer).encode()?;
    ws.send(Message::Binary(join.into())).await?;
    let info = read_join(shared, &mut ws).await?;
    Ok((ws, info))
}

async fn inbound(shared: Arc<MeshShared>, stream: TcpStream) -> Result<(), TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let info = read_join(&shared, &mut ws).await?;
    let join = SyncMessage::join(&shared.channel, &shared.peer).encode()?;
    ws.send(Message::Binary(join.into())).await?;
    run_link(shared, ws, info).await;
    Ok(())
}

/// Wait for the remote's `Join` on a fresh link.
async fn read_join<S>(
    shared: &MeshShared,
    ws: &mut WebSocketStream<S>,
) -> Result<PeerInfo, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, await_join(shared, ws))
        .await
        .map_err(|_| TransportError::Connect {
            endpoint: "peer link".into(),
            reason: "join timed out".into(),
        })?
}

async fn await_join<S>(
    shared: &MeshShared,
    ws: &mut WebSocketStream<S>,
) -> Result<PeerInfo, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        if let Message::Binary(data) = frame? {
            let msg = SyncMessage::decode(&data)?;
            if msg.msg_type == MessageType::Join && msg.channel == shared.channel {
                return Ok(msg.peer_info()?);
            }
            log::debug!("Mesh: ignoring {:?} before join", msg.msg_type);
        }
    }
    Err(TransportError::Connect {
        endpoint: "peer link".into(),
        reason: "closed before join".into(),
    })
}

/// Serve one established link until either side closes it.
async fn run_link<S>(shared: Arc<MeshShared>, ws: WebSocketStream<S>, remote: PeerInfo)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_id = remote.replica_id;
    if remote_id == shared.peer.replica_id {
        return;
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if !shared.register(remote_id, tx) {
        log::debug!("Mesh: duplicate or over-budget link to {remote_id} closed");
        return;
    }
    log::info!("Mesh: linked with {} ({remote_id})", remote.name);
    shared.listeners.peers.emit(&PeerEvent::Joined(remote));

    let (mut sink, mut stream) = ws.split();
    let local = shared.peer.replica_id;
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if sink.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => {
                        shared.listeners.dispatch(local, msg);
                    }
                    Err(e) => log::warn!("Mesh: dropping undecodable frame from {remote_id}: {e}"),
                },
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    shared.unregister(remote_id);
    log::info!("Mesh: link with {remote_id} closed");
    shared.listeners.peers.emit(&PeerEvent::Left(remote_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(id: ReplicaId, signaling: Vec<String>) -> MeshTransport {
        MeshTransport::new(PeerInfo::with_id(id, "peer"), "civic-room", MeshConfig::new(signaling))
    }

    #[test]
    fn test_mesh_creation() {
        let transport = mesh(1, vec!["ws://localhost:4444".into()]);
        assert_eq!(transport.kind(), TransportKind::Mesh);
        assert_eq!(transport.status(), TransportStatus::Disconnected);
        assert!(transport.linked_peers().is_empty());
    }

    #[test]
    fn test_connect_requires_signaling() {
        let mut transport = mesh(1, Vec::new());
        assert!(matches!(transport.connect(), Err(TransportError::NoEndpoint)));
    }

    #[test]
    fn test_dial_budget() {
        let mut config = MeshConfig::new(vec!["ws://x".into()]);
        config.max_peers = 1;
        let transport = MeshTransport::new(PeerInfo::with_id(1, "a"), "c", config);
        assert!(transport.shared.begin_dial(2));
        assert!(!transport.shared.begin_dial(2), "already dialing");
        assert!(!transport.shared.begin_dial(3), "budget exhausted");
    }

    #[test]
    fn test_status_follows_links() {
        let transport = mesh(1, vec!["ws://x".into()]);
        let shared = &transport.shared;

        shared.state().on_rendezvous = true;
        shared.refresh_status();
        assert_eq!(transport.status(), TransportStatus::Connected, "alone on the rendezvous");

        assert!(shared.begin_dial(2));
        shared.dial_failed(2);
        assert_eq!(transport.status(), TransportStatus::Connecting, "announced peer unreachable");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(shared.register(3, tx));
        assert_eq!(transport.status(), TransportStatus::Connected);

        shared.unregister(3);
        assert_eq!(transport.status(), TransportStatus::Connecting);
    }

    #[test]
    fn test_duplicate_link_rejected() {
        let transport = mesh(1, vec!["ws://x".into()]);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(transport.shared.register(2, tx1));
        assert!(!transport.shared.register(2, tx2));
        assert_eq!(transport.linked_peers(), vec![2]);
    }

    #[test]
    fn test_broadcast_reaches_every_link() {
        let transport = mesh(1, vec!["ws://x".into()]);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        transport.shared.register(2, tx_a);
        transport.shared.register(3, tx_b);

        transport.broadcast_delta(&Delta::from_bytes(vec![4, 2]));

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.try_recv().unwrap();
            let msg = SyncMessage::decode(&frame).unwrap();
            assert_eq!(msg.msg_type, MessageType::Delta);
            assert_eq!(msg.payload, vec![4, 2]);
        }
    }
}
