//! Persistent storage collaborator for the hub.
//!
//! ```text
//! ┌─────────────┐  commit(op, checkpoint?)  ┌──────────────────┐
//! │ SyncHub     │ ────────────────────────► │ DocumentStorage  │
//! │ (rooms)     │ ◄──────────────────────── │ memory | RocksDB │
//! └─────────────┘  checkpoint + ops since   └──────────────────┘
//! ```
//!
//! A document is recovered by loading its latest checkpoint and replaying
//! the operation log after it.

pub mod memory;
pub mod rocks;

use flowsync_core::{CommittedOperation, Value};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable home of checkpoints and operation logs.
///
/// Calls are synchronous and made from inside the document's critical
/// section, so a successful return means the write is visible to the
/// next load.
pub trait DocumentStorage: Send + Sync {
    /// Latest checkpoint: `(snapshot, revision)`.
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<(Value, u64)>, StoreError>;

    /// Committed operations with `revision > since`, in order.
    fn load_operations(&self, doc_id: &str, since: u64) -> Result<Vec<CommittedOperation>, StoreError>;

    fn append_operation(&self, doc_id: &str, op: &CommittedOperation) -> Result<(), StoreError>;

    fn checkpoint(&self, doc_id: &str, revision: u64, snapshot: &Value) -> Result<(), StoreError>;

    /// Record `op` and, when given, a checkpoint of the snapshot it
    /// produced. Implementations that can should make this atomic.
    fn commit(&self, doc_id: &str, op: &CommittedOperation, checkpoint: Option<&Value>) -> Result<(), StoreError> {
        self.append_operation(doc_id, op)?;
        if let Some(snapshot) = checkpoint {
            self.checkpoint(doc_id, op.revision, snapshot)?;
        }
        Ok(())
    }
}

pub(crate) fn encode_record<T: serde::Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}
