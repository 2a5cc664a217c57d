//! In-process transport. Every transport attached to the same
//! [`LoopbackHub`] and channel sees the others' frames synchronously, on
//! the caller's thread.
//!
//! A hub can be marked unreachable, in which case `connect` never gets past
//! `Connecting`; the failover tests use this to stand in for a blocked
//! peer-to-peer network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Listeners, PeerEvent, Transport, TransportError, TransportKind, TransportStatus};
use crate::document::Delta;
use crate::presence::PresenceUpdate;
use crate::protocol::{PeerInfo, SyncMessage};

#[derive(Clone)]
struct Member {
    info: PeerInfo,
    listeners: Arc<Listeners>,
}

struct HubState {
    channels: HashMap<String, Vec<Member>>,
    reachable: bool,
}

/// Shared switchboard for loopback transports.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                channels: HashMap::new(),
                reachable: true,
            })),
        }
    }

    /// A hub that never lets anyone connect.
    pub fn unreachable() -> Self {
        let hub = Self::new();
        hub.set_reachable(false);
        hub
    }

    /// Only affects later `connect` calls.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Create a transport for `peer` on `channel`.
    pub fn transport(&self, peer: PeerInfo, channel: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            peer,
            channel: channel.into(),
            listeners: Listeners::new(TransportKind::Loopback),
            clock: AtomicU64::new(0),
            joined: false,
        }
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map_or(0, Vec::len)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everyone on `channel` except the member owning `listeners`.
    fn others(&self, channel: &str, listeners: &Arc<Listeners>) -> Vec<Member> {
        self.state()
            .channels
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| !Arc::ptr_eq(&m.listeners, listeners))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Transport half of a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    peer: PeerInfo,
    channel: String,
    listeners: Arc<Listeners>,
    clock: AtomicU64,
    joined: bool,
}

impl LoopbackTransport {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn deliver(&self, msg: SyncMessage) {
        for member in self.hub.others(&self.channel, &self.listeners) {
            member.listeners.dispatch(member.info.replica_id, msg.clone());
        }
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.joined {
            return Ok(());
        }
        let others = {
            let mut state = self.hub.state();
            if !state.reachable {
                drop(state);
                log::debug!("Loopback: hub unreachable for {}", self.peer.replica_id);
                self.listeners.set_status(TransportStatus::Connecting);
                return Ok(());
            }
            let members = state.channels.entry(self.channel.clone()).or_default();
            let others = members.clone();
            members.push(Member {
                info: self.peer.clone(),
                listeners: self.listeners.clone(),
            });
            others
        };
        self.joined = true;
        self.listeners.set_status(TransportStatus::Connected);

        for other in others {
            other.listeners.peers.emit(&PeerEvent::Joined(self.peer.clone()));
            self.listeners.peers.emit(&PeerEvent::Joined(other.info));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.joined {
            {
                let mut state = self.hub.state();
                if let Some(members) = state.channels.get_mut(&self.channel) {
                    members.retain(|m| !Arc::ptr_eq(&m.listeners, &self.listeners));
                    if members.is_empty() {
                        state.channels.remove(&self.channel);
                    }
                }
            }
            self.joined = false;
            for other in self.hub.others(&self.channel, &self.listeners) {
                other.listeners.peers.emit(&PeerEvent::Left(self.peer.replica_id));
            }
        }
        self.listeners.set_status(TransportStatus::Disconnected);
    }

    fn broadcast_delta(&self, delta: &Delta) {
        if !self.joined {
            return;
        }
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.deliver(SyncMessage::delta(
            self.peer.replica_id,
            &self.channel,
            clock,
            delta.as_bytes().to_vec(),
        ));
    }

    fn broadcast_presence(&self, update: &PresenceUpdate) {
        if !self.joined {
            return;
        }
        match update.encode() {
            Ok(json) => self.deliver(SyncMessage::presence(
                self.peer.replica_id,
                &self.channel,
                self.clock.load(Ordering::Relaxed),
                json,
            )),
            Err(e) => log::warn!("Loopback: presence could not be encoded: {e}"),
        }
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if self.joined {
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<dyn Fn(&T) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |item: &T| sink.lock().unwrap().push(item.clone())))
    }

    #[test]
    fn test_deltas_reach_other_members_only() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport(PeerInfo::with_id(1, "a"), "civic-room");
        let mut b = hub.transport(PeerInfo::with_id(2, "b"), "civic-room");
        let mut other_room = hub.transport(PeerInfo::with_id(3, "c"), "civic-elsewhere");

        let (at_a, cb_a) = recorder::<Delta>();
        let (at_b, cb_b) = recorder::<Delta>();
        let (at_c, cb_c) = recorder::<Delta>();
        let _subs = [a.on_delta(cb_a), b.on_delta(cb_b), other_room.on_delta(cb_c)];

        a.connect().unwrap();
        b.connect().unwrap();
        other_room.connect().unwrap();

        a.broadcast_delta(&Delta::from_bytes(vec![1, 2]));

        assert!(at_a.lock().unwrap().is_empty());
        assert_eq!(at_b.lock().unwrap().as_slice(), &[Delta::from_bytes(vec![1, 2])]);
        assert!(at_c.lock().unwrap().is_empty());
    }

    #[test]
    fn test_membership_events() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport(PeerInfo::with_id(1, "a"), "ch");
        let mut b = hub.transport(PeerInfo::with_id(2, "b"), "ch");
        let (events_a, cb_a) = recorder::<PeerEvent>();
        let (events_b, cb_b) = recorder::<PeerEvent>();
        let _sa = a.on_peer(cb_a);
        let _sb = b.on_peer(cb_b);

        a.connect().unwrap();
        b.connect().unwrap();
        assert_eq!(hub.member_count("ch"), 2);
        assert!(matches!(events_a.lock().unwrap()[0], PeerEvent::Joined(ref p) if p.replica_id == 2));
        assert!(matches!(events_b.lock().unwrap()[0], PeerEvent::Joined(ref p) if p.replica_id == 1));

        b.disconnect();
        assert_eq!(events_a.lock().unwrap().last(), Some(&PeerEvent::Left(2)));
        assert_eq!(hub.member_count("ch"), 1);
        assert_eq!(b.status(), TransportStatus::Disconnected);
    }

    #[test]
    fn test_presence_round_trips_through_json() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport(PeerInfo::with_id(1, "a"), "ch");
        let mut b = hub.transport(PeerInfo::with_id(2, "b"), "ch");
        let (seen, cb) = recorder::<PresenceUpdate>();
        let _sub = b.on_presence(cb);
        a.connect().unwrap();
        b.connect().unwrap();

        let update = PresenceUpdate {
            replica_id: 1,
            fields: serde_json::Map::new(),
            updated_at: 4,
            left: false,
        };
        a.broadcast_presence(&update);

        assert_eq!(seen.lock().unwrap().as_slice(), &[update]);
    }

    #[test]
    fn test_unreachable_hub_stays_connecting() {
        let hub = LoopbackHub::unreachable();
        let mut a = hub.transport(PeerInfo::with_id(1, "a"), "ch");
        a.connect().unwrap();
        assert_eq!(a.status(), TransportStatus::Connecting);
        assert_eq!(hub.member_count("ch"), 0);
    }

    #[test]
    fn test_drop_leaves_channel() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport(PeerInfo::with_id(1, "a"), "ch");
        a.connect().unwrap();
        drop(a);
        assert_eq!(hub.member_count("ch"), 0);
    }
}
