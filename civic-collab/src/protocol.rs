//! Binary protocol shared by the hub, the relay transport and mesh links.
//!
//! Wire format (bincode-encoded, standard config):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ channel      │ clock    │ payload  │
//! │ 1 byte   │ varint    │ len + utf-8  │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type:
//! - `Join`, `PeerJoined`: bincode [`PeerInfo`]
//! - `SyncStep1`: encoded yrs state vector
//! - `SyncStep2`, `Delta`: bincode [`DeltaFrame`]
//! - `Presence`: JSON presence update (see [`crate::presence::PresenceUpdate`])
//! - `Signal`: bincode [`Signal`]
//!
//! Decoders ignore trailing bytes, so a newer peer may append fields to a
//! payload without breaking older ones.
//!
//! Reference: Kleppmann, Chapter 4, Encoding and Evolution

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ReplicaId;
use crate::presence::Color;

/// Current [`DeltaFrame`] version.
pub const DELTA_FRAME_VERSION: u8 = 1;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame on every connection: join a channel
    Join = 1,
    /// State vector request
    SyncStep1 = 2,
    /// State diff response
    SyncStep2 = 3,
    /// Incremental CRDT delta
    Delta = 4,
    /// Presence side channel
    Presence = 5,
    /// Peer joined notification
    PeerJoined = 6,
    /// Peer left notification
    PeerLeft = 7,
    /// Mesh signaling (rendezvous only)
    Signal = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub replica_id: ReplicaId,
    pub name: String,
    pub color: Color,
}

impl PeerInfo {
    pub fn new(replica_id: ReplicaId, name: impl Into<String>, color: Color) -> Self {
        Self {
            replica_id,
            name: name.into(),
            color,
        }
    }

    /// Identity with a color derived from the replica id.
    pub fn with_id(replica_id: ReplicaId, name: impl Into<String>) -> Self {
        Self::new(replica_id, name, Color::from_replica(replica_id))
    }
}

/// Mesh rendezvous messages, carried in `Signal` frames through the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    /// "I am reachable at `addr`". `reply` is set on the answer to an
    /// announce so the exchange does not loop.
    Announce { addr: String, reply: bool },
}

/// Payload of `Delta` and `SyncStep2` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaFrame {
    pub version: u8,
    /// Encoded state vector of the sender after producing `update`
    pub state_vector: Vec<u8>,
    /// yrs v1 update
    pub update: Vec<u8>,
}

impl DeltaFrame {
    pub fn new(state_vector: Vec<u8>, update: Vec<u8>) -> Self {
        Self {
            version: DELTA_FRAME_VERSION,
            state_vector,
            update,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender's replica id (0 for hub-originated frames)
    pub peer_id: ReplicaId,
    pub channel: String,
    /// Sender-local counter, informational
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(
        msg_type: MessageType,
        peer_id: ReplicaId,
        channel: &str,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            peer_id,
            channel: channel.to_string(),
            clock,
            payload,
        }
    }

    /// Join a channel.
    pub fn join(channel: &str, info: &PeerInfo) -> Self {
        let payload = encode(info).unwrap_or_default();
        Self::with_payload(MessageType::Join, info.replica_id, channel, 0, payload)
    }

    /// Request everything not covered by `state_vector`.
    pub fn sync_step1(peer_id: ReplicaId, channel: &str, state_vector: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep1, peer_id, channel, 0, state_vector)
    }

    /// Answer a state vector request with an encoded [`DeltaFrame`].
    pub fn sync_step2(peer_id: ReplicaId, channel: &str, frame: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep2, peer_id, channel, 0, frame)
    }

    /// Incremental delta (encoded [`DeltaFrame`]).
    pub fn delta(peer_id: ReplicaId, channel: &str, clock: u64, frame: Vec<u8>) -> Self {
        Self::with_payload(MessageType::Delta, peer_id, channel, clock, frame)
    }

    /// Presence update (JSON payload).
    pub fn presence(peer_id: ReplicaId, channel: &str, clock: u64, json: Vec<u8>) -> Self {
        Self::with_payload(MessageType::Presence, peer_id, channel, clock, json)
    }

    pub fn peer_joined(channel: &str, info: &PeerInfo) -> Self {
        let payload = encode(info).unwrap_or_default();
        Self::with_payload(MessageType::PeerJoined, info.replica_id, channel, 0, payload)
    }

    pub fn peer_left(peer_id: ReplicaId, channel: &str) -> Self {
        Self::with_payload(MessageType::PeerLeft, peer_id, channel, 0, Vec::new())
    }

    pub fn signal(peer_id: ReplicaId, channel: &str, signal: &Signal) -> Self {
        let payload = encode(signal).unwrap_or_default();
        Self::with_payload(MessageType::Signal, peer_id, channel, 0, payload)
    }

    pub fn ping(peer_id: ReplicaId) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: ReplicaId) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Parse the peer info carried by `Join` and `PeerJoined`.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        match self.msg_type {
            MessageType::Join | MessageType::PeerJoined => decode(&self.payload),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }

    /// Parse the signaling payload.
    pub fn signal_payload(&self) -> Result<Signal, ProtocolError> {
        if self.msg_type != MessageType::Signal {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        decode(&self.payload)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_message_roundtrip() {
        let frame = DeltaFrame::new(vec![1], vec![1, 2, 3, 4, 5]).encode().unwrap();
        let msg = SyncMessage::delta(42, "civic-room", 7, frame.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.peer_id, 42);
        assert_eq!(decoded.channel, "civic-room");
        assert_eq!(decoded.clock, 7);
        assert_eq!(decoded.payload, frame);
    }

    #[test]
    fn test_join_carries_peer_info() {
        let info = PeerInfo::with_id(9, "User12");
        let msg = SyncMessage::join("civic-abc", &info);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.peer_id, 9);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_signal_roundtrip() {
        let signal = Signal::Announce {
            addr: "ws://127.0.0.1:4000".into(),
            reply: false,
        };
        let msg = SyncMessage::signal(3, "civic-abc", &signal);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.signal_payload().unwrap(), signal);
    }

    #[test]
    fn test_delta_frame_tolerates_trailing_bytes() {
        let frame = DeltaFrame::new(vec![1, 2], vec![3, 4, 5]);
        let mut bytes = frame.encode().unwrap();
        // A newer peer appending a field must not break decoding.
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(DeltaFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_delta_frame_version() {
        let frame = DeltaFrame::new(Vec::new(), Vec::new());
        assert_eq!(frame.version, DELTA_FRAME_VERSION);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(1);
        assert!(matches!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        ));
        assert!(msg.signal_payload().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(DeltaFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_delta_size_efficient() {
        let frame = DeltaFrame::new(vec![0u8; 8], vec![0u8; 50]).encode().unwrap();
        let msg = SyncMessage::delta(123_456, "civic-abcdefghijklmnopqrstuvwxyz", 1, frame);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 150,
            "Encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::SyncStep1 as u8, 2);
        assert_eq!(MessageType::Delta as u8, 4);
        assert_eq!(MessageType::Signal as u8, 8);
        assert_eq!(MessageType::Pong as u8, 10);
    }
}
