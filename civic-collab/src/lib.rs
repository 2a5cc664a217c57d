//! # civic-collab: real-time collaborative plain-text editing
//!
//! Replicates one text document per room across peers with a CRDT, shows
//! who else is present, and keeps a local copy so editing survives with no
//! network at all.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   edits    ┌──────────────┐  local ops  ┌───────────────┐
//! │ Surface      │ ─────────► │ Reconciler   │ ──────────► │ DocumentStore │
//! │ (text+caret) │ ◄───────── │ (diff, caret │ ◄────────── │ (yrs Y.Text)  │
//! └──────────────┘  remote    │  echo, seed) │  changes    └───────────────┘
//!                   text      └──────┬───────┘
//!                                    │ Outbox (deltas, presence)
//!                                    ▼
//!                           ┌──────────────────┐   mesh first, relay on
//!                           │ FailoverMonitor  │   deadline (exactly once)
//!                           └────────┬─────────┘
//!                    ┌───────────────┴───────────────┐
//!                    ▼                               ▼
//!            ┌───────────────┐  rendezvous   ┌───────────────┐
//!            │ MeshTransport │ ────────────► │ SyncServer    │
//!            │ (direct links)│               │ (hub: relay + │
//!            └───────────────┘               │  signaling)   │
//!                                            └───────▲───────┘
//!                                    ┌───────────────┘
//!                            ┌───────┴───────┐
//!                            │RelayTransport │
//!                            └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Replicated text (local ops, remote merge, snapshots)
//! - [`reconciler`]: Surface ↔ document bridge
//! - [`session`]: Solo and collaborative session lifecycle
//! - [`presence`]: Ephemeral per-peer state (name, color, caret, typing)
//! - [`transport`]: Mesh, relay and in-process transports
//! - [`failover`]: Mesh → relay fallback
//! - [`server`]: WebSocket hub
//! - [`protocol`]: Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`storage`]: Local text cache (RocksDB + LZ4)
//! - [`rewrite`]: `/rewrite` command and its HTTP collaborator
//! - [`config`]: File and environment configuration
//! - [`ids`]: Injectable randomness

pub mod broadcast;
pub mod config;
pub mod document;
pub mod error;
pub mod failover;
pub mod ids;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::{CollabConfig, ConfigError, RoomConfig};
pub use document::{ChangeOrigin, Delta, DocumentChange, DocumentError, DocumentStore};
pub use error::{CollabError, Result};
pub use failover::{
    preflight_restricted, FailoverMonitor, FailoverState, LoopbackTransports, NetworkTransports,
    TransportFactory,
};
pub use ids::{IdSource, RandomIds, ReplicaId, SeededIds};
pub use presence::{Color, PresenceEntry, PresenceFields, PresenceRegistry, PresenceUpdate};
pub use protocol::{DeltaFrame, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use reconciler::{Outbox, Reconciler, RejectedDelta, Surface, TextSurface};
pub use rewrite::{HttpRewriter, LocalRewriter, RewriteError, RewriteService, StyleTag};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionConfig, SessionStatus};
pub use storage::{CacheConfig, LocalCache, MemoryCache, StoreError, TextCache};
pub use subscription::Subscription;
pub use transport::{
    LoopbackHub, MeshConfig, MeshTransport, PeerEvent, RelayConfig, RelayTransport, Transport,
    TransportError, TransportKind, TransportStatus,
};
