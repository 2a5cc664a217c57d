//! Fan-out of encoded frames to every member of a channel.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind observes `Lagged` and the
//! skipped frames are lost for it. The hub then closes that member's
//! connection, and the client recovers the document through the
//! state-vector handshake when it reconnects.
//!
//! Members are keyed by a per-connection [`Uuid`], not by replica id: the
//! same replica may hold two connections to one channel (for example a
//! mesh peer's signaling socket next to a relay socket during failover).
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One frame on its way to the members of a channel.
#[derive(Debug, Clone)]
pub struct Fanout {
    /// Connection that produced the frame (skipped on delivery)
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Broadcast group for a single channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Fanout>,
    /// Members by connection id
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per member.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a member; returns its receiver.
    pub async fn add_peer(&self, connection: Uuid, info: PeerInfo) -> broadcast::Receiver<Fanout> {
        let mut peers = self.peers.write().await;
        peers.insert(connection, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection)
    }

    /// Encode and fan out `msg`. Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Fanout { origin, frame }) {
            Ok(count) => count,
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, channel: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(channel).cloned()
    }

    /// Drop the channel if nobody is left in it.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel) {
            if room.peer_count().await == 0 {
                rooms.remove(channel);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn, PeerInfo::with_id(1, "Alice")).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        let removed = group.remove_peer(&conn).await.unwrap();
        assert_eq!(removed.name, "Alice");
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(alice, PeerInfo::with_id(1, "Alice")).await;
        let mut rx_bob = group.add_peer(bob, PeerInfo::with_id(2, "Bob")).await;

        let msg = SyncMessage::delta(1, "civic-room", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(alice, &msg).unwrap(), 2);

        // Filtering own frames is the receiver's job.
        assert_eq!(rx_alice.recv().await.unwrap().origin, alice);
        let fanout = rx_bob.recv().await.unwrap();
        assert_eq!(fanout.origin, alice);
        assert_eq!(SyncMessage::decode(&fanout.frame).unwrap().payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_counts_drop() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(Uuid::nil(), Arc::new(vec![1])), 0);
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create("civic-a").await;
        let b = manager.get_or_create("civic-a").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get("civic-b").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("civic-a").await;
        let conn = Uuid::new_v4();
        let _rx = room.add_peer(conn, PeerInfo::with_id(1, "Alice")).await;

        assert!(!manager.remove_if_empty("civic-a").await);
        room.remove_peer(&conn).await;
        assert!(manager.remove_if_empty("civic-a").await);
        assert!(manager.active_channels().await.is_empty());
    }
}
