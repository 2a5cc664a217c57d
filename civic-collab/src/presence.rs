//! Presence side channel: who is here, where their caret is, who is typing.
//!
//! ## Architecture
//!
//! ```text
//! Local field change
//!       │
//!       ▼
//! PresenceRegistry::set_local()      (Lamport clock += 1)
//!       │
//!       ▼
//! PresenceUpdate { replicaId, fields, updatedAt }   (JSON)
//!       │
//!       ▼   (Transport::broadcast_presence)
//! Remote PresenceRegistry::apply_remote()
//!       │   last-writer-wins on (updatedAt, replicaId)
//!       ▼
//! on_change subscribers
//! ```
//!
//! Entries are never persisted. A peer that stops sending updates is
//! removed by [`PresenceRegistry::expire`] once the grace window passes;
//! an explicit leave removes it immediately.
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::ids::ReplicaId;
use crate::subscription::{Subscribers, Subscription};

/// Default liveness window for remote entries.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

const FIELD_NAME: &str = "name";
const FIELD_COLOR: &str = "color";
const FIELD_CURSOR: &str = "cursor";
const FIELD_TYPING: &str = "typing";

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// sRGB color, serialized as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Colors handed out to new participants.
    pub const PALETTE: [&'static str; 10] = [
        "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7",
        "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E9",
    ];

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Palette entry `idx` (wrapping).
    pub fn palette(idx: usize) -> Self {
        let hex = Self::PALETTE[idx % Self::PALETTE.len()];
        Self::from_hex(hex).unwrap_or_default()
    }

    /// Parse `#RRGGBB` (leading `#` optional).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Stable, vivid color for a replica that did not announce one.
    pub fn from_replica(id: ReplicaId) -> Self {
        let hue = ((id % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self::rgb(
            (r * 255.0).round() as u8,
            (g * 255.0).round() as u8,
            (b * 255.0).round() as u8,
        )
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::rgb(0x45, 0xB7, 0xD1)
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid color {value:?}"))
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_hex()
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire message
// ───────────────────────────────────────────────────────────────────

/// Presence wire message. Always carries the sender's full field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub replica_id: ReplicaId,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub updated_at: u64,
    /// Explicit leave
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub left: bool,
}

impl PresenceUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// One participant's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub color: Color,
    /// Caret as a plain-text offset
    pub cursor_offset: Option<usize>,
    pub typing: bool,
    /// Lamport timestamp of the last accepted update
    pub updated_at: u64,
}

impl PresenceEntry {
    fn new(replica_id: ReplicaId, display_name: String, color: Color) -> Self {
        Self {
            replica_id,
            display_name,
            color,
            cursor_offset: None,
            typing: false,
            updated_at: 0,
        }
    }

    /// Last-writer-wins ordering; ties go to the higher replica id.
    fn supersedes(&self, other: &PresenceEntry) -> bool {
        (self.updated_at, self.replica_id) > (other.updated_at, other.replica_id)
    }

    fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(FIELD_NAME.into(), Value::from(self.display_name.clone()));
        fields.insert(FIELD_COLOR.into(), Value::from(self.color.to_hex()));
        fields.insert(
            FIELD_CURSOR.into(),
            self.cursor_offset.map_or(Value::Null, |c| Value::from(c as u64)),
        );
        fields.insert(FIELD_TYPING.into(), Value::from(self.typing));
        fields
    }

    /// Build an entry from a wire update. Missing or malformed fields fall
    /// back to `previous`, then to defaults.
    fn from_update(update: &PresenceUpdate, previous: Option<&PresenceEntry>) -> Self {
        let fields = &update.fields;
        let display_name = fields
            .get(FIELD_NAME)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| previous.map(|p| p.display_name.clone()))
            .unwrap_or_else(|| format!("User{}", update.replica_id % 1000));
        let color = fields
            .get(FIELD_COLOR)
            .and_then(Value::as_str)
            .and_then(Color::from_hex)
            .or_else(|| previous.map(|p| p.color))
            .unwrap_or_else(|| Color::from_replica(update.replica_id));
        let cursor_offset = match fields.get(FIELD_CURSOR) {
            Some(value) => value.as_u64().map(|c| c as usize),
            None => previous.and_then(|p| p.cursor_offset),
        };
        let typing = fields
            .get(FIELD_TYPING)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            replica_id: update.replica_id,
            display_name,
            color,
            cursor_offset,
            typing,
            updated_at: update.updated_at,
        }
    }
}

/// Partial change to the local entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceFields {
    pub name: Option<String>,
    pub color: Option<Color>,
    pub cursor: Option<Option<usize>>,
    pub typing: Option<bool>,
}

impl PresenceFields {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn cursor(mut self, cursor: Option<usize>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn typing(mut self, typing: bool) -> Self {
        self.typing = Some(typing);
        self
    }
}

/// Change notification delivered to `on_change` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Updated(ReplicaId),
    Removed(ReplicaId),
    Cleared,
}

struct RemotePeer {
    entry: PresenceEntry,
    last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Presence state for one session: the local entry plus every live peer.
pub struct PresenceRegistry {
    local: PresenceEntry,
    /// Lamport clock for outgoing updates
    clock: u64,
    peers: HashMap<ReplicaId, RemotePeer>,
    grace: Duration,
    subscribers: Subscribers<PresenceChange>,
}

impl PresenceRegistry {
    pub fn new(replica_id: ReplicaId, display_name: impl Into<String>, color: Color) -> Self {
        Self {
            local: PresenceEntry::new(replica_id, display_name.into(), color),
            clock: 0,
            peers: HashMap::new(),
            grace: DEFAULT_GRACE,
            subscribers: Subscribers::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Apply a partial change to the local entry and return the message to
    /// broadcast.
    pub fn set_local(&mut self, fields: PresenceFields) -> PresenceUpdate {
        if let Some(name) = fields.name {
            self.local.display_name = name;
        }
        if let Some(color) = fields.color {
            self.local.color = color;
        }
        if let Some(cursor) = fields.cursor {
            self.local.cursor_offset = cursor;
        }
        if let Some(typing) = fields.typing {
            self.local.typing = typing;
        }
        self.tick();
        self.local_update()
    }

    /// Re-announce the local entry unchanged (heartbeat).
    pub fn refresh_local(&mut self) -> PresenceUpdate {
        self.tick();
        self.local_update()
    }

    /// Explicit leave message for teardown.
    pub fn leave(&mut self) -> PresenceUpdate {
        self.tick();
        PresenceUpdate {
            replica_id: self.local.replica_id,
            fields: Map::new(),
            updated_at: self.clock,
            left: true,
        }
    }

    fn tick(&mut self) {
        self.clock += 1;
        self.local.updated_at = self.clock;
    }

    fn local_update(&self) -> PresenceUpdate {
        PresenceUpdate {
            replica_id: self.local.replica_id,
            fields: self.local.to_fields(),
            updated_at: self.local.updated_at,
            left: false,
        }
    }

    /// Merge a remote update. Returns true when the visible state changed.
    pub fn apply_remote(&mut self, update: &PresenceUpdate) -> bool {
        if update.replica_id == self.local.replica_id {
            return false;
        }
        self.clock = self.clock.max(update.updated_at);

        if update.left {
            return self.remove(update.replica_id);
        }

        let now = Instant::now();
        let previous = self.peers.get(&update.replica_id).map(|p| &p.entry);
        let candidate = PresenceEntry::from_update(update, previous);

        match self.peers.get_mut(&update.replica_id) {
            Some(peer) => {
                // A replayed stale update is no sign of life.
                if !candidate.supersedes(&peer.entry) {
                    log::trace!("Presence: stale update from {} ignored", update.replica_id);
                    return false;
                }
                peer.last_seen = now;
                peer.entry = candidate;
            }
            None => {
                log::debug!("Presence: {} ({}) appeared", candidate.display_name, update.replica_id);
                self.peers.insert(
                    update.replica_id,
                    RemotePeer {
                        entry: candidate,
                        last_seen: now,
                    },
                );
            }
        }

        self.subscribers.emit(&PresenceChange::Updated(update.replica_id));
        true
    }

    /// Drop a peer immediately (explicit leave or transport peer-left).
    pub fn remove(&mut self, replica: ReplicaId) -> bool {
        if self.peers.remove(&replica).is_some() {
            log::debug!("Presence: {replica} removed");
            self.subscribers.emit(&PresenceChange::Removed(replica));
            true
        } else {
            false
        }
    }

    /// Remove peers not heard from within the grace window.
    pub fn expire(&mut self, now: Instant) -> Vec<ReplicaId> {
        let grace = self.grace;
        let mut expired: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > grace)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            self.peers.remove(id);
            log::debug!("Presence: {id} expired");
            self.subscribers.emit(&PresenceChange::Removed(*id));
        }
        expired
    }

    /// Forget every peer (teardown).
    pub fn clear(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.subscribers.emit(&PresenceChange::Cleared);
        }
    }

    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Remote entries, sorted by replica id.
    pub fn all(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> =
            self.peers.values().map(|p| p.entry.clone()).collect();
        entries.sort_by_key(|e| e.replica_id);
        entries
    }

    /// Display names of remote participants.
    pub fn collaborators(&self) -> Vec<String> {
        self.all().into_iter().map(|e| e.display_name).collect()
    }

    pub fn anyone_typing(&self) -> bool {
        self.peers.values().any(|p| p.entry.typing)
    }

    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn remote(replica_id: ReplicaId, updated_at: u64, name: &str) -> PresenceUpdate {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::from(name));
        fields.insert("color".into(), Value::from("#4ECDC4"));
        fields.insert("cursor".into(), Value::from(3u64));
        fields.insert("typing".into(), Value::from(false));
        PresenceUpdate {
            replica_id,
            fields,
            updated_at,
            left: false,
        }
    }

    #[test]
    fn test_color_hex_roundtrip() {
        let color = Color::from_hex("#FF6B6B").unwrap();
        assert_eq!(color, Color::rgb(0xFF, 0x6B, 0x6B));
        assert_eq!(color.to_hex(), "#FF6B6B");
        assert!(Color::from_hex("#GG0000").is_none());
        assert!(Color::from_hex("#FFF").is_none());
    }

    #[test]
    fn test_color_from_replica_stable() {
        assert_eq!(Color::from_replica(42), Color::from_replica(42));
        assert_ne!(Color::from_replica(0), Color::from_replica(180));
    }

    #[test]
    fn test_set_local_bumps_clock() {
        let mut registry = PresenceRegistry::new(1, "User1", Color::palette(0));
        let a = registry.set_local(PresenceFields::default().cursor(Some(4)));
        let b = registry.set_local(PresenceFields::default().typing(true));

        assert!(b.updated_at > a.updated_at);
        assert_eq!(b.fields["cursor"], Value::from(4u64));
        assert_eq!(b.fields["typing"], Value::from(true));
        assert_eq!(b.fields["name"], Value::from("User1"));
        assert_eq!(b.fields["color"], Value::from("#FF6B6B"));
    }

    #[tokio::test]
    async fn test_apply_remote_lww() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());

        assert!(registry.apply_remote(&remote(2, 5, "new")));
        // Older update loses.
        assert!(!registry.apply_remote(&remote(2, 3, "old")));
        assert_eq!(registry.all()[0].display_name, "new");
        // Duplicate does not notify either.
        assert!(!registry.apply_remote(&remote(2, 5, "new")));
    }

    #[tokio::test]
    async fn test_lamport_clock_advances_past_remote() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        registry.apply_remote(&remote(2, 100, "peer"));
        let update = registry.refresh_local();
        assert!(update.updated_at > 100);
    }

    #[tokio::test]
    async fn test_own_updates_ignored() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        assert!(!registry.apply_remote(&remote(1, 10, "echo")));
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_leave_removes() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        registry.apply_remote(&remote(2, 1, "peer"));

        let mut other = PresenceRegistry::new(2, "peer", Color::default());
        let leave = other.leave();
        assert!(leave.left);
        assert!(registry.apply_remote(&leave));
        assert!(registry.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_grace() {
        let mut registry =
            PresenceRegistry::new(1, "me", Color::default()).with_grace(Duration::from_secs(30));
        registry.apply_remote(&remote(2, 1, "quiet"));

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.apply_remote(&remote(3, 1, "chatty"));
        assert!(registry.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(registry.expire(Instant::now()), vec![2]);
        assert_eq!(registry.collaborators(), vec!["chatty".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_replay_does_not_keep_peer_alive() {
        let mut registry =
            PresenceRegistry::new(1, "me", Color::default()).with_grace(Duration::from_secs(30));
        registry.apply_remote(&remote(2, 5, "gone"));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!registry.apply_remote(&remote(2, 5, "gone")));
        assert!(!registry.apply_remote(&remote(2, 4, "gone")));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(registry.expire(Instant::now()), vec![2]);
    }

    #[tokio::test]
    async fn test_on_change_notifications() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = registry.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        registry.apply_remote(&remote(2, 1, "peer"));
        registry.remove(2);
        registry.apply_remote(&remote(3, 1, "peer3"));
        registry.clear();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PresenceChange::Updated(2),
                PresenceChange::Removed(2),
                PresenceChange::Updated(3),
                PresenceChange::Cleared,
            ]
        );
    }

    #[tokio::test]
    async fn test_anyone_typing_and_sorted_all() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        let mut typing = remote(9, 1, "b");
        typing.fields.insert("typing".into(), Value::from(true));
        registry.apply_remote(&typing);
        registry.apply_remote(&remote(4, 1, "a"));

        assert!(registry.anyone_typing());
        let ids: Vec<_> = registry.all().iter().map(|e| e.replica_id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn test_wire_ignores_unknown_fields() {
        let json = br#"{"replicaId":7,"fields":{"name":"x"},"updatedAt":3,"future":"field"}"#;
        let update = PresenceUpdate::decode(json).unwrap();
        assert_eq!(update.replica_id, 7);
        assert!(!update.left);
    }

    #[tokio::test]
    async fn test_malformed_fields_fall_back() {
        let mut registry = PresenceRegistry::new(1, "me", Color::default());
        let mut update = remote(5, 1, "peer");
        update.fields.insert("color".into(), Value::from("not-a-color"));
        registry.apply_remote(&update);
        assert_eq!(registry.all()[0].color, Color::from_replica(5));
    }
}
