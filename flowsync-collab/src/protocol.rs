//! Binary protocol for operation synchronization.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`]:
//! ```text
//! client                                   hub
//!   │ Subscribe{doc, since} ─────────────▶ │
//!   │ ◀───────────── Snapshot{rev, snap, ops}
//!   │ Submit{doc, base, op, id} ─────────▶ │
//!   │ ◀────────────── Ack{id, rev} | Error{id, kind}
//!   │ ◀────────────── Broadcast{rev, op}   (other clients' commits)
//! ```

use crate::error::{ErrorKind, SyncError};
use flowsync_core::{CommittedOperation, Conflict, Operation, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Start receiving a document. `since` asks for the operations
    /// committed after that revision along with the snapshot.
    Subscribe { doc_id: String, since: Option<u64> },

    /// Authoritative state at `revision`; `operations` are those after
    /// the requested `since`, in order.
    Snapshot {
        doc_id: String,
        revision: u64,
        snapshot: Value,
        operations: Vec<CommittedOperation>,
    },

    Submit {
        doc_id: String,
        base_revision: u64,
        operation: Operation,
        client_op_id: Uuid,
    },

    /// The submitter's operation was committed at `revision`. `partial`
    /// is set when components were dropped at apply time, in which case
    /// the submitter must resync.
    Ack {
        doc_id: String,
        client_op_id: Uuid,
        revision: u64,
        conflicts: Vec<Conflict>,
        partial: bool,
    },

    Error {
        doc_id: String,
        client_op_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
    },

    /// Someone else's operation was committed at `revision`.
    Broadcast {
        doc_id: String,
        revision: u64,
        operation: Operation,
        origin_client_op_id: Uuid,
    },

    Unsubscribe { doc_id: String },

    /// Heartbeat ping
    Ping,
    /// Heartbeat pong
    Pong,
}

impl SyncMessage {
    pub fn error(doc_id: impl Into<String>, client_op_id: Option<Uuid>, err: &SyncError) -> Self {
        SyncMessage::Error {
            doc_id: doc_id.into(),
            client_op_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Document this message concerns, if any.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            SyncMessage::Subscribe { doc_id, .. }
            | SyncMessage::Snapshot { doc_id, .. }
            | SyncMessage::Submit { doc_id, .. }
            | SyncMessage::Ack { doc_id, .. }
            | SyncMessage::Error { doc_id, .. }
            | SyncMessage::Broadcast { doc_id, .. }
            | SyncMessage::Unsubscribe { doc_id } => Some(doc_id),
            SyncMessage::Ping | SyncMessage::Pong => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}
