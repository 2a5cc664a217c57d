//! WebSocket hub: relay for rooms and rendezvous for mesh peers.
//!
//! Architecture:
//! ```text
//! Relay client A ──┐
//!                   ├── channel "civic-<room>" ── yrs Doc ── BroadcastGroup
//! Relay client B ──┘            │                                │
//!                               │ SyncStep1 → SyncStep2 (diff)   │
//! Mesh peer C ── Join, Signal ──┘                                ▼
//!                                                    A, B, C (minus origin)
//! ```
//!
//! Each channel keeps:
//! - a yrs `Doc` merged from every delta that passed through (memory only)
//! - a `BroadcastGroup` for fan-out to the connected members
//!
//! The first frame on every connection must be `Join`. Rooms are dropped
//! with their state once the last member leaves.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, Fanout, RoomManager};
use crate::document::TEXT_NAME;
use crate::ids::ReplicaId;
use crate::protocol::{DeltaFrame, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Replica id the hub uses for frames it originates.
pub const HUB_PEER_ID: ReplicaId = 0;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per channel
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
    pub merged_deltas: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct HubShared {
    config: ServerConfig,
    /// Fan-out groups by channel
    rooms: RoomManager,
    /// Merged room state by channel
    docs: RwLock<HashMap<String, Doc>>,
    stats: RwLock<ServerStats>,
}

/// Membership of one connection, set by its `Join`.
struct Membership {
    channel: String,
    info: PeerInfo,
    group: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Fanout>,
}

/// The hub.
pub struct SyncServer {
    shared: Arc<HubShared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(HubShared {
                config,
                rooms,
                docs: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Hub listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Text the hub has merged for `channel`, if the room is open.
    pub async fn room_text(&self, channel: &str) -> Option<String> {
        let docs = self.shared.docs.read().await;
        let txn = docs.get(channel)?.transact();
        Some(
            txn.get_text(TEXT_NAME)
                .map(|text| text.get_string(&txn))
                .unwrap_or_default(),
        )
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.shared.rooms.active_channels().await
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<HubShared>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let connection = Uuid::new_v4();

    log::debug!("WebSocket connection {connection} established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut member: Option<Membership> = None;
    let result = serve_connection(&shared, connection, addr, ws_stream, &mut member).await;

    if let Some(membership) = member {
        leave(&shared, connection, membership).await;
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = shared.rooms.room_count().await;
    }
    result
}

async fn serve_connection(
    shared: &HubShared,
    connection: Uuid,
    addr: SocketAddr,
    ws_stream: WebSocketStream<TcpStream>,
    member: &mut Option<Membership>,
) -> Result<(), ServerError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let data = match incoming {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {connection} closed by {addr}");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                {
                    let mut s = shared.stats.write().await;
                    s.total_messages += 1;
                    s.total_bytes += data.len() as u64;
                }

                let msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame from {addr}: {e}");
                        continue;
                    }
                };

                let Some(joined) = member.as_ref() else {
                    if msg.msg_type != MessageType::Join {
                        log::warn!("{addr} sent {:?} before joining; closing", msg.msg_type);
                        return Ok(());
                    }
                    match join(shared, connection, &msg).await {
                        Some((membership, roster)) => {
                            for frame in roster {
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            *member = Some(membership);
                        }
                        None => {
                            ws_sender.send(Message::Close(None)).await?;
                            return Ok(());
                        }
                    }
                    continue;
                };

                match msg.msg_type {
                    MessageType::SyncStep1 => {
                        if let Some(frame) = answer_state_request(shared, &joined.channel, &msg.payload).await? {
                            ws_sender.send(Message::Binary(frame.into())).await?;
                        }
                    }
                    MessageType::Delta => {
                        if merge_delta(shared, &joined.channel, &msg.payload).await {
                            joined.group.broadcast_raw(connection, Arc::new(data.to_vec()));
                        }
                    }
                    MessageType::Presence | MessageType::Signal => {
                        log::trace!("{:?} from {} in {}", msg.msg_type, msg.peer_id, joined.channel);
                        joined.group.broadcast_raw(connection, Arc::new(data.to_vec()));
                    }
                    MessageType::Ping => {
                        let pong = SyncMessage::pong(HUB_PEER_ID).encode()?;
                        ws_sender.send(Message::Binary(pong.into())).await?;
                    }
                    other => log::debug!("Unhandled message type from {addr}: {other:?}"),
                }
            }

            fanout = async {
                match member.as_mut() {
                    Some(m) => m.rx.recv().await,
                    // Not joined yet: nothing to forward.
                    None => std::future::pending().await,
                }
            } => {
                match forward(connection, fanout) {
                    Forward::Skip => {}
                    Forward::Send(frame) => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    Forward::Resync(n) => {
                        // The skipped deltas are gone for this member. Closing
                        // makes the client reconnect and redo the handshake.
                        log::warn!("Connection {connection} lagged by {n} frames; closing for resync");
                        ws_sender.send(Message::Close(None)).await?;
                        return Ok(());
                    }
                    Forward::Closed => return Ok(()),
                }
            }
        }
    }
}

/// Admit a connection to its channel. Returns the membership plus the
/// `PeerJoined` frames describing members already present, or `None` when
/// the room is full.
async fn join(
    shared: &HubShared,
    connection: Uuid,
    msg: &SyncMessage,
) -> Option<(Membership, Vec<Vec<u8>>)> {
    let channel = msg.channel.clone();
    let info = msg
        .peer_info()
        .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));

    // Held for the whole join so a concurrent last leave cannot drop the
    // room between lookup and registration.
    let mut docs = shared.docs.write().await;
    let group = shared.rooms.get_or_create(&channel).await;
    if group.peer_count().await >= shared.config.max_peers_per_room {
        log::warn!("Rejecting {} from {channel}: room is full", info.replica_id);
        shared.stats.write().await.rejected_joins += 1;
        shared.rooms.remove_if_empty(&channel).await;
        return None;
    }

    let existing = group.peers().await;
    let rx = group.add_peer(connection, info.clone()).await;
    docs.entry(channel.clone()).or_insert_with(Doc::new);
    drop(docs);

    if let Err(e) = group.broadcast(connection, &SyncMessage::peer_joined(&channel, &info)) {
        log::warn!("Join of {} could not be announced: {e}", info.replica_id);
    }
    let roster = existing
        .iter()
        .filter(|peer| peer.replica_id != info.replica_id)
        .filter_map(|peer| SyncMessage::peer_joined(&channel, peer).encode().ok())
        .collect();

    {
        let mut s = shared.stats.write().await;
        s.active_rooms = shared.rooms.room_count().await;
    }
    log::info!("Peer {} ({}) joined {channel}", info.name, info.replica_id);

    Some((
        Membership {
            channel,
            info,
            group,
            rx,
        },
        roster,
    ))
}

async fn leave(shared: &HubShared, connection: Uuid, membership: Membership) {
    let Membership {
        channel,
        info,
        group,
        rx,
    } = membership;
    drop(rx);
    group.remove_peer(&connection).await;
    if let Err(e) = group.broadcast(connection, &SyncMessage::peer_left(info.replica_id, &channel)) {
        log::warn!("Leave of {} could not be announced: {e}", info.replica_id);
    }
    log::info!("Peer {} ({}) left {channel}", info.name, info.replica_id);

    let mut docs = shared.docs.write().await;
    if shared.rooms.remove_if_empty(&channel).await {
        docs.remove(&channel);
        log::info!("Room {channel} closed (empty)");
    }
}

/// Merge a client delta into the room state. Returns false when the delta
/// was rejected and must not be fanned out.
async fn merge_delta(shared: &HubShared, channel: &str, payload: &[u8]) -> bool {
    let frame = match DeltaFrame::decode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping malformed delta for {channel}: {e}");
            return false;
        }
    };

    let merged = {
        let docs = shared.docs.write().await;
        let Some(doc) = docs.get(channel) else {
            return false;
        };
        // yrs updates are !Send: decode and apply without crossing an await.
        match Update::decode_v1(&frame.update) {
            Ok(update) => {
                let mut txn = doc.transact_mut();
                match txn.apply_update(update) {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("Delta for {channel} could not be integrated: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                log::warn!("Dropping malformed delta for {channel}: {e}");
                false
            }
        }
    };
    if merged {
        shared.stats.write().await.merged_deltas += 1;
    }
    merged
}

/// What to do with one item received from the room's fan-out.
#[derive(Debug, PartialEq)]
enum Forward {
    /// Own frame coming back
    Skip,
    Send(Arc<Vec<u8>>),
    /// Frames were lost for this member; it has to resynchronize
    Resync(u64),
    Closed,
}

fn forward(connection: Uuid, received: Result<Fanout, broadcast::error::RecvError>) -> Forward {
    match received {
        Ok(fanout) if fanout.origin == connection => Forward::Skip,
        Ok(fanout) => Forward::Send(fanout.frame),
        Err(broadcast::error::RecvError::Lagged(n)) => Forward::Resync(n),
        Err(broadcast::error::RecvError::Closed) => Forward::Closed,
    }
}

/// Build the `SyncStep2` answer to a state-vector request.
async fn answer_state_request(
    shared: &HubShared,
    channel: &str,
    state_vector: &[u8],
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let remote = match StateVector::decode_v1(state_vector) {
        Ok(sv) => sv,
        Err(e) => {
            log::warn!("Dropping malformed state vector for {channel}: {e}");
            return Ok(None);
        }
    };
    let frame = {
        let docs = shared.docs.read().await;
        let Some(doc) = docs.get(channel) else {
            return Ok(None);
        };
        let txn = doc.transact();
        DeltaFrame::new(txn.state_vector().encode_v1(), txn.encode_diff_v1(&remote))
    };
    let reply = SyncMessage::sync_step2(HUB_PEER_ID, channel, frame.encode()?);
    Ok(Some(reply.encode()?))
}
