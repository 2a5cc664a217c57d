//! Transports carry deltas and presence between replicas of one room.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │ trait Transport              │
//!                 │  connect / disconnect        │
//!                 │  broadcast_delta / _presence │
//!                 │  on_delta / on_presence /    │
//!                 │  on_peer  → Subscription     │
//!                 │  status / watch_status       │
//!                 └──────────────┬───────────────┘
//!          ┌─────────────────────┼──────────────────────┐
//!          ▼                     ▼                      ▼
//!   MeshTransport         RelayTransport        LoopbackTransport
//!   (direct WebSocket     (one WebSocket to     (in-process, for
//!    links, hub only       the hub, offline      tests and embedding)
//!    for rendezvous)       queue)
//! ```
//!
//! Socket I/O runs on spawned tasks; received frames are handed to
//! [`Listeners::dispatch`], which fans them out to the registered
//! callbacks. Callbacks are expected to forward into a channel and return.

pub mod loopback;
pub mod mesh;
pub mod relay;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::document::Delta;
use crate::ids::ReplicaId;
use crate::presence::PresenceUpdate;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::subscription::{Subscribers, Subscription};

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use mesh::{MeshConfig, MeshTransport};
pub use relay::{OfflineQueue, RelayConfig, RelayTransport};

/// Link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Which transport variant is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Mesh,
    Relay,
    Loopback,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Mesh => write!(f, "mesh"),
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Loopback => write!(f, "loopback"),
        }
    }
}

/// Membership notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Joined(PeerInfo),
    Left(ReplicaId),
    /// The remote side answered the initial state request
    StateReceived,
}

pub type DeltaCallback = Arc<dyn Fn(&Delta) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(&PresenceUpdate) + Send + Sync>;
pub type PeerCallback = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transports must be connected from inside a tokio runtime")]
    NoRuntime,
    #[error("could not connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("no endpoint configured")]
    NoEndpoint,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback registries and status shared between a transport handle and its
/// connection tasks.
pub struct Listeners {
    pub deltas: Subscribers<Delta>,
    pub presence: Subscribers<PresenceUpdate>,
    pub peers: Subscribers<PeerEvent>,
    status: watch::Sender<TransportStatus>,
    kind: TransportKind,
}

impl Listeners {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        let (status, _) = watch::channel(TransportStatus::Disconnected);
        Arc::new(Self {
            deltas: Subscribers::new(),
            presence: Subscribers::new(),
            peers: Subscribers::new(),
            status,
            kind,
        })
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    /// Update the status, notifying watchers only on change.
    pub fn set_status(&self, status: TransportStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::info!("{} transport: {status:?}", self.kind);
        }
    }

    /// Route one received frame to the subscribers. Frames sent by
    /// `local` are skipped. Returns true when the frame was consumed.
    pub fn dispatch(&self, local: ReplicaId, msg: SyncMessage) -> bool {
        if msg.peer_id == local {
            return false;
        }
        match msg.msg_type {
            MessageType::Delta => {
                log::debug!(
                    "{} transport: delta from {} ({} bytes)",
                    self.kind,
                    msg.peer_id,
                    msg.payload.len()
                );
                self.deltas.emit(&Delta::from_bytes(msg.payload));
                true
            }
            MessageType::SyncStep2 => {
                self.deltas.emit(&Delta::from_bytes(msg.payload));
                self.peers.emit(&PeerEvent::StateReceived);
                true
            }
            MessageType::Presence => match PresenceUpdate::decode(&msg.payload) {
                Ok(update) => {
                    log::trace!("{} transport: presence from {}", self.kind, update.replica_id);
                    self.presence.emit(&update);
                    true
                }
                Err(e) => {
                    log::warn!(
                        "{} transport: dropping malformed presence from {}: {e}",
                        self.kind,
                        msg.peer_id
                    );
                    false
                }
            },
            MessageType::PeerJoined => match msg.peer_info() {
                Ok(info) => {
                    self.peers.emit(&PeerEvent::Joined(info));
                    true
                }
                Err(e) => {
                    log::warn!("{} transport: dropping malformed join: {e}", self.kind);
                    false
                }
            },
            MessageType::PeerLeft => {
                self.peers.emit(&PeerEvent::Left(msg.peer_id));
                true
            }
            _ => false,
        }
    }
}

/// A way to exchange deltas and presence with the rest of a room.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Start connecting. Returns immediately; progress is reported through
    /// [`Transport::status`].
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Close every link. Idempotent.
    fn disconnect(&mut self);

    fn broadcast_delta(&self, delta: &Delta);

    fn broadcast_presence(&self, update: &PresenceUpdate);

    fn listeners(&self) -> &Listeners;

    fn on_delta(&self, callback: DeltaCallback) -> Subscription {
        self.listeners().deltas.subscribe_arc(callback)
    }

    fn on_presence(&self, callback: PresenceCallback) -> Subscription {
        self.listeners().presence.subscribe_arc(callback)
    }

    fn on_peer(&self, callback: PeerCallback) -> Subscription {
        self.listeners().peers.subscribe_arc(callback)
    }

    fn status(&self) -> TransportStatus {
        self.listeners().status()
    }

    fn watch_status(&self) -> watch::Receiver<TransportStatus> {
        self.listeners().watch()
    }
}

/// The session's callbacks, kept so they can be attached to whichever
/// transport is current.
#[derive(Clone)]
pub struct TransportCallbacks {
    pub delta: DeltaCallback,
    pub presence: PresenceCallback,
    pub peer: PeerCallback,
}

impl TransportCallbacks {
    /// Subscribe all three callbacks to `transport`.
    pub fn attach(&self, transport: &dyn Transport) -> Vec<Subscription> {
        vec![
            transport.on_delta(self.delta.clone()),
            transport.on_presence(self.presence.clone()),
            transport.on_peer(self.peer.clone()),
        ]
    }

    /// Callbacks that ignore everything.
    pub fn noop() -> Self {
        Self {
            delta: Arc::new(|_| {}),
            presence: Arc::new(|_| {}),
            peer: Arc::new(|_| {}),
        }
    }
}

pub(crate) fn require_runtime() -> Result<tokio::runtime::Handle, TransportError> {
    tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)
}

pub(crate) fn encode_presence(
    peer: ReplicaId,
    channel: &str,
    clock: u64,
    update: &PresenceUpdate,
) -> Option<Vec<u8>> {
    let json = match update.encode() {
        Ok(json) => json,
        Err(e) => {
            log::warn!("Presence update could not be encoded: {e}");
            return None;
        }
    };
    SyncMessage::presence(peer, channel, clock, json).encode().ok()
}
