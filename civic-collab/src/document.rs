//! Replicated plain-text document backed by a yrs `Y.Text`.
//!
//! ```text
//! apply_local_insert / apply_local_delete
//!        │  (char offsets → byte offsets)
//!        ▼
//!   yrs TransactionMut ──► encode_update_v1 ──► Delta (DeltaFrame bytes)
//!        │
//!        ▼
//!   DocumentChange ──► subscribers
//!
//! apply_remote_delta(Delta)
//!        │  decode frame, decode update, integrate
//!        ▼
//!   state vector or text changed? ──► DocumentChange ──► subscribers
//! ```
//!
//! Integration is idempotent and commutative: a delta seen twice, or deltas
//! seen out of order, leave every replica with the same text. Updates whose
//! causal dependencies are missing stay pending inside yrs until the
//! dependencies arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

use crate::ids::ReplicaId;
use crate::protocol::DeltaFrame;
use crate::subscription::{Subscribers, Subscription};

/// Name of the shared text inside the yrs document.
pub const TEXT_NAME: &str = "content";

/// Opaque, replayable encoding of one or more operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta(Vec<u8>);

impl Delta {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification sent to document subscribers after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Materialized text after the change
    pub text: String,
    pub origin: ChangeOrigin,
    /// Monotonic change counter for this replica
    pub version: u64,
}

/// Document errors.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("delta could not be decoded: {0}")]
    DeltaDecode(String),
    #[error("delta could not be integrated: {0}")]
    Integrate(String),
    #[error("state vector could not be decoded: {0}")]
    StateVector(String),
}

/// One replica of the shared document.
pub struct DocumentStore {
    doc: Doc,
    text: TextRef,
    replica_id: ReplicaId,
    version: AtomicU64,
    subscribers: Subscribers<DocumentChange>,
}

impl DocumentStore {
    /// Create an empty replica. `replica_id` must be unique across the room.
    pub fn new(replica_id: ReplicaId) -> Self {
        let options = Options {
            client_id: replica_id,
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        };
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            doc,
            text,
            replica_id,
            version: AtomicU64::new(0),
            subscribers: Subscribers::new(),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Insert `text` at char offset `pos` (clamped to the end).
    pub fn apply_local_insert(&mut self, pos: usize, text: &str) -> Delta {
        if text.is_empty() {
            return self.empty_delta();
        }
        let current = self.materialize();
        let at = byte_offset(&current, pos) as u32;

        let update = {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, at, text);
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::Local);
        self.frame(update)
    }

    /// Delete `len` chars starting at char offset `pos` (clamped to the text).
    pub fn apply_local_delete(&mut self, pos: usize, len: usize) -> Delta {
        let current = self.materialize();
        let start = byte_offset(&current, pos);
        let end = byte_offset(&current, pos.saturating_add(len));
        if end <= start {
            return self.empty_delta();
        }

        let update = {
            let mut txn = self.doc.transact_mut();
            self.text
                .remove_range(&mut txn, start as u32, (end - start) as u32);
            txn.encode_update_v1()
        };
        self.notify(ChangeOrigin::Local);
        self.frame(update)
    }

    /// Integrate a delta from another replica. Returns true when the
    /// document's state changed; duplicates and empty deltas return false
    /// and do not notify.
    pub fn apply_remote_delta(&mut self, delta: &Delta) -> Result<bool, DocumentError> {
        let frame = DeltaFrame::decode(delta.as_bytes())
            .map_err(|e| DocumentError::DeltaDecode(e.to_string()))?;
        if frame.update.is_empty() {
            return Ok(false);
        }
        let update = Update::decode_v1(&frame.update)
            .map_err(|e| DocumentError::DeltaDecode(e.to_string()))?;

        let before_text = self.materialize();
        let before_sv = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Integrate(e.to_string()))?;
        }
        let after_sv = self.doc.transact().state_vector();

        if after_sv == before_sv && self.materialize() == before_text {
            log::trace!("Replica {}: duplicate delta ignored", self.replica_id);
            return Ok(false);
        }
        self.notify(ChangeOrigin::Remote);
        Ok(true)
    }

    /// Visible text.
    pub fn materialize(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.materialize().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }

    /// Encoded state vector (per-replica high-water marks).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica knows, for bringing a peer up to date.
    pub fn full_state(&self) -> Delta {
        let update = self
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        self.frame(update)
    }

    /// Everything this replica knows that `state_vector` does not cover.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Delta, DocumentError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::StateVector(e.to_string()))?;
        let update = self.doc.transact().encode_diff_v1(&remote);
        Ok(self.frame(update))
    }

    /// Register for change notifications.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    fn notify(&self, origin: ChangeOrigin) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let change = DocumentChange {
            text: self.materialize(),
            origin,
            version,
        };
        self.subscribers.emit(&change);
    }

    /// Frame `update` for the wire. A frame that cannot be encoded is
    /// logged and comes back as an empty delta, which is never broadcast.
    fn frame(&self, update: Vec<u8>) -> Delta {
        match DeltaFrame::new(self.state_vector(), update).encode() {
            Ok(bytes) => Delta(bytes),
            Err(e) => {
                log::warn!("Replica {}: delta could not be framed: {e}", self.replica_id);
                Delta(Vec::new())
            }
        }
    }

    fn empty_delta(&self) -> Delta {
        self.frame(Vec::new())
    }
}

/// Byte offset of char `pos` in `s`, clamped to `s.len()`.
fn byte_offset(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map_or(s.len(), |(idx, _)| idx)
}
