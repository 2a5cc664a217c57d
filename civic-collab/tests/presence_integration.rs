//! Integration tests for presence: names, typing indicators, leave and
//! liveness expiry, through a real hub.

use civic_collab::ids::{channel_name, IdSource, SeededIds};
use civic_collab::presence::PresenceUpdate;
use civic_collab::protocol::{PeerInfo, SyncMessage};
use civic_collab::reconciler::TextSurface;
use civic_collab::rewrite::LocalRewriter;
use civic_collab::server::{ServerConfig, SyncServer};
use civic_collab::session::{Session, SessionConfig};
use civic_collab::storage::MemoryCache;
use civic_collab::failover::NetworkTransports;
use civic_collab::transport::{MeshConfig, RelayConfig};
use futures_util::SinkExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type Editor = Session<TextSurface>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return its URL.
async fn start_test_hub() -> String {
    let port = free_port().await;
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn room(seed: u64) -> String {
    channel_name("civic", &SeededIds::new(seed).room_id())
}

fn join(url: &str, channel: &str, id: u64, name: &str, grace: Duration) -> Editor {
    let peer = PeerInfo::with_id(id, name);
    let transports = NetworkTransports {
        peer: peer.clone(),
        channel: channel.to_string(),
        mesh: MeshConfig::new(vec![url.to_string()]),
        relay: RelayConfig::new(url),
    };
    let config = SessionConfig {
        restricted: true,
        presence_grace: grace,
        ..SessionConfig::default()
    };
    Session::collaborative(
        TextSurface::new(""),
        peer,
        Box::new(MemoryCache::new()),
        Arc::new(LocalRewriter),
        Box::new(transports),
        config,
    )
    .unwrap()
}

async fn pump(a: &mut Editor, b: &mut Editor, period: Duration) {
    tokio::join!(a.run_for(period), b.run_for(period));
}

// ─── Presence over the relay ────────────────────────────────────

#[tokio::test]
async fn test_presence_names_reach_peers() {
    let url = start_test_hub().await;
    let channel = room(1);
    let grace = Duration::from_secs(30);

    let mut alice = join(&url, &channel, 1, "Alice", grace);
    let mut bob = join(&url, &channel, 2, "Bob", grace);

    for _ in 0..40 {
        if !alice.status().collaborators.is_empty() && !bob.status().collaborators.is_empty() {
            break;
        }
        pump(&mut alice, &mut bob, Duration::from_millis(50)).await;
    }
    assert_eq!(alice.status().collaborators, vec!["Bob".to_string()]);
    assert_eq!(bob.status().collaborators, vec!["Alice".to_string()]);

    let entries = bob.reconciler().presence().unwrap().all();
    assert_eq!(entries[0].replica_id, 1);
    assert_eq!(entries[0].color, PeerInfo::with_id(1, "Alice").color);
}

#[tokio::test]
async fn test_typing_indicator_over_relay() {
    let url = start_test_hub().await;
    let channel = room(2);
    let grace = Duration::from_secs(30);

    let mut alice = join(&url, &channel, 1, "Alice", grace);
    let mut bob = join(&url, &channel, 2, "Bob", grace);
    pump(&mut alice, &mut bob, Duration::from_millis(200)).await;

    alice.edit(|s| s.append("t"));
    assert!(bob.run_until(Duration::from_secs(2), |s| s.status().someone_typing).await);
    assert!(!alice.status().someone_typing, "own typing is not someone else's");

    // One second of quiet clears the indicator.
    pump(&mut alice, &mut bob, Duration::from_millis(1_300)).await;
    assert!(!bob.status().someone_typing);
}

#[tokio::test]
async fn test_leave_removes_collaborator() {
    let url = start_test_hub().await;
    let channel = room(3);
    let grace = Duration::from_secs(30);

    let mut alice = join(&url, &channel, 1, "Alice", grace);
    let mut bob = join(&url, &channel, 2, "Bob", grace);
    for _ in 0..40 {
        if !bob.status().collaborators.is_empty() {
            break;
        }
        pump(&mut alice, &mut bob, Duration::from_millis(50)).await;
    }
    assert_eq!(bob.status().collaborators.len(), 1);

    alice.shutdown();
    assert!(
        bob.run_until(Duration::from_secs(2), |s| s.status().collaborators.is_empty())
            .await
    );
}

// ─── Raw peers ──────────────────────────────────────────────────

fn ghost_presence(replica_id: u64, updated_at: u64) -> PresenceUpdate {
    let mut fields = Map::new();
    fields.insert("name".into(), Value::from("Ghost"));
    fields.insert("color".into(), Value::from("#ff8800"));
    PresenceUpdate {
        replica_id,
        fields,
        updated_at,
        left: false,
    }
}

#[tokio::test]
async fn test_silent_peer_expires_after_grace() {
    let url = start_test_hub().await;
    let channel = room(4);
    let mut bob = join(&url, &channel, 2, "Bob", Duration::from_millis(500));
    bob.run_for(Duration::from_millis(200)).await;

    // A peer that announces itself once, then stays connected but silent.
    let (mut ghost, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::join(&channel, &PeerInfo::with_id(77, "Ghost"));
    ghost.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    let json = ghost_presence(77, 1).encode().unwrap();
    let frame = SyncMessage::presence(77, &channel, 1, json).encode().unwrap();
    ghost.send(Message::Binary(frame.into())).await.unwrap();

    assert!(
        bob.run_until(Duration::from_secs(2), |s| s.status().collaborators == vec!["Ghost".to_string()])
            .await
    );
    assert!(
        bob.run_until(Duration::from_secs(4), |s| s.status().collaborators.is_empty())
            .await,
        "entries are dropped once the grace window passes"
    );
    drop(ghost);
}

#[tokio::test]
async fn test_malformed_presence_is_ignored() {
    let url = start_test_hub().await;
    let channel = room(5);
    let mut bob = join(&url, &channel, 2, "Bob", Duration::from_secs(30));
    bob.run_for(Duration::from_millis(200)).await;

    let (mut ghost, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::join(&channel, &PeerInfo::with_id(78, "Ghost"));
    ghost.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();
    let garbage = SyncMessage::presence(78, &channel, 1, b"{not json".to_vec());
    ghost.send(Message::Binary(garbage.encode().unwrap().into())).await.unwrap();

    bob.run_for(Duration::from_millis(300)).await;
    assert!(bob.status().collaborators.is_empty());

    let json = ghost_presence(78, 2).encode().unwrap();
    let frame = SyncMessage::presence(78, &channel, 2, json).encode().unwrap();
    ghost.send(Message::Binary(frame.into())).await.unwrap();
    assert!(
        bob.run_until(Duration::from_secs(2), |s| s.status().collaborators.len() == 1)
            .await
    );
}
