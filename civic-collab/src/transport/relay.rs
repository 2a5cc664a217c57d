//! Relay transport: one WebSocket to the hub, all traffic through it.
//!
//! Provides:
//! - Connection lifecycle with reconnect and exponential backoff
//! - State-vector handshake on every (re)join
//! - Offline queue for deltas broadcast while the link is down
//!
//! ```text
//! broadcast_delta ──► LinkState ──┬─ outgoing (connected) ──► writer ──► hub
//!                                 └─ OfflineQueue (offline)  ── replayed on join
//! hub ──► reader ──► Listeners::dispatch ──► on_delta / on_presence / on_peer
//! ```
//!
//! Reference: Kleppmann, Chapter 5, Replication

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use super::{
    encode_presence, require_runtime, Listeners, Transport, TransportError, TransportKind,
    TransportStatus,
};
use crate::document::Delta;
use crate::presence::PresenceUpdate;
use crate::protocol::{PeerInfo, SyncMessage};

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:4444`
    pub endpoint: String,
    /// Deltas kept while offline
    pub offline_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl RelayConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            offline_queue_capacity: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

/// Deltas broadcast while disconnected, replayed in order on reconnect.
///
/// When full, new deltas are refused; the full-state exchange that follows
/// every reconnect still brings the hub up to date.
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    clock: u64,
    frame: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded frame. Returns false when the queue is full.
    pub fn enqueue(&mut self, clock: u64, frame: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedFrame {
            clock,
            frame,
            queued_at: Instant::now(),
        });
        true
    }

    /// Take every queued frame in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|q| (q.clock, q.frame)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.frame.len()).sum()
    }

    /// Age of the oldest queued frame.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

struct LinkState {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queue: OfflineQueue,
}

struct RelayShared {
    peer: PeerInfo,
    channel: String,
    config: RelayConfig,
    listeners: Arc<Listeners>,
    link: Mutex<LinkState>,
}

impl RelayShared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Relay transport.
pub struct RelayTransport {
    shared: Arc<RelayShared>,
    clock: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl RelayTransport {
    pub fn new(peer: PeerInfo, channel: impl Into<String>, config: RelayConfig) -> Self {
        let queue = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            shared: Arc::new(RelayShared {
                peer,
                channel: channel.into(),
                config,
                listeners: Listeners::new(TransportKind::Relay),
                link: Mutex::new(LinkState {
                    outgoing: None,
                    queue,
                }),
            }),
            clock: AtomicU64::new(0),
            task: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.config.endpoint
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn offline_queue_len(&self) -> usize {
        self.shared.link().queue.len()
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.shared.config.endpoint.is_empty() {
            return Err(TransportError::NoEndpoint);
        }
        let runtime = require_runtime()?;
        self.shared.listeners.set_status(TransportStatus::Connecting);
        self.task = Some(runtime.spawn(run_relay(self.shared.clone())));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::info!("Relay {} disconnected", self.shared.config.endpoint);
        }
        self.shared.link().outgoing = None;
        self.shared.listeners.set_status(TransportStatus::Disconnected);
    }

    fn broadcast_delta(&self, delta: &Delta) {
        let clock = self.next_clock();
        let msg = SyncMessage::delta(
            self.shared.peer.replica_id,
            &self.shared.channel,
            clock,
            delta.as_bytes().to_vec(),
        );
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Relay: delta could not be encoded: {e}");
                return;
            }
        };

        let mut link = self.shared.link();
        let frame = match &link.outgoing {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        if !link.queue.enqueue(clock, frame) {
            log::warn!("Relay: offline queue full, delta {clock} will travel with the next full sync");
        }
    }

    fn broadcast_presence(&self, update: &PresenceUpdate) {
        let link = self.shared.link();
        // Presence is ephemeral; nothing is queued while offline.
        let Some(tx) = &link.outgoing else { return };
        if let Some(frame) = encode_presence(
            self.shared.peer.replica_id,
            &self.shared.channel,
            self.clock.load(Ordering::Relaxed),
            update,
        ) {
            let _ = tx.send(frame);
        }
    }

    fn listeners(&self) -> &Listeners {
        &self.shared.listeners
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connect, serve, and reconnect with backoff until aborted.
async fn run_relay(shared: Arc<RelayShared>) {
    let mut delay = shared.config.reconnect_min;
    loop {
        shared.listeners.set_status(TransportStatus::Connecting);
        match tokio_tungstenite::connect_async(shared.config.endpoint.as_str()).await {
            Ok((ws, _)) => {
                delay = shared.config.reconnect_min;
                match serve_relay(&shared, ws).await {
                    Ok(()) => log::info!("Relay {}: connection closed", shared.config.endpoint),
                    Err(e) => log::warn!("Relay {}: connection lost: {e}", shared.config.endpoint),
                }
            }
            Err(e) => {
                log::warn!("Relay {} unreachable: {e}", shared.config.endpoint);
            }
        }

        shared.link().outgoing = None;
        shared.listeners.set_status(TransportStatus::Disconnected);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(shared.config.reconnect_max);
    }
}

async fn serve_relay<S>(
    shared: &RelayShared,
    ws: tokio_tungstenite::WebSocketStream<S>,
) -> Result<(), TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let local = shared.peer.replica_id;

    let join = SyncMessage::join(&shared.channel, &shared.peer).encode()?;
    sink.send(Message::Binary(join.into())).await?;
    // Empty state vector: ask for everything the hub holds.
    let request =
        SyncMessage::sync_step1(local, &shared.channel, StateVector::default().encode_v1()).encode()?;
    sink.send(Message::Binary(request.into())).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut link = shared.link();
        let queued = link.queue.drain();
        if !queued.is_empty() {
            log::info!("Relay: replaying {} queued deltas", queued.len());
        }
        for (_, frame) in queued {
            let _ = out_tx.send(frame);
        }
        link.outgoing = Some(out_tx);
    }
    shared.listeners.set_status(TransportStatus::Connected);

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(frame) => sink.send(Message::Binary(frame.into())).await?,
                None => return Ok(()),
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => {
                        shared.listeners.dispatch(local, msg);
                    }
                    Err(e) => log::warn!("Relay: dropping undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            _ = heartbeat.tick() => {
                let ping = SyncMessage::ping(local).encode()?;
                sink.send(Message::Binary(ping.into())).await?;
            }
        }
    }
}
