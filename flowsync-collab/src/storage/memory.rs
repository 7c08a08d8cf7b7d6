//! In-process document storage, for tests and ephemeral servers.

use super::{DocumentStorage, StoreError};
use flowsync_core::{CommittedOperation, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StoredDocument {
    checkpoint: Option<(Value, u64)>,
    operations: Vec<CommittedOperation>,
}

/// Volatile [`DocumentStorage`] with write-failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of logged operations for a document.
    pub fn operation_count(&self, doc_id: &str) -> usize {
        self.documents
            .lock()
            .map(|docs| docs.get(doc_id).map_or(0, |d| d.operations.len()))
            .unwrap_or(0)
    }

    /// Revision of the latest checkpoint for a document.
    pub fn checkpoint_revision(&self, doc_id: &str) -> Option<u64> {
        self.documents
            .lock()
            .ok()?
            .get(doc_id)?
            .checkpoint
            .as_ref()
            .map(|(_, revision)| *revision)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".into()));
        }
        Ok(())
    }

    fn with_documents<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, StoredDocument>) -> R,
    ) -> Result<R, StoreError> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(f(&mut docs))
    }
}

impl DocumentStorage for MemoryStore {
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<(Value, u64)>, StoreError> {
        self.with_documents(|docs| docs.get(doc_id).and_then(|d| d.checkpoint.clone()))
    }

    fn load_operations(&self, doc_id: &str, since: u64) -> Result<Vec<CommittedOperation>, StoreError> {
        self.with_documents(|docs| {
            docs.get(doc_id)
                .map(|d| {
                    d.operations
                        .iter()
                        .filter(|op| op.revision > since)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn append_operation(&self, doc_id: &str, op: &CommittedOperation) -> Result<(), StoreError> {
        self.check_writable()?;
        self.with_documents(|docs| {
            docs.entry(doc_id.to_string())
                .or_default()
                .operations
                .push(op.clone())
        })
    }

    fn checkpoint(&self, doc_id: &str, revision: u64, snapshot: &Value) -> Result<(), StoreError> {
        self.check_writable()?;
        self.with_documents(|docs| {
            docs.entry(doc_id.to_string()).or_default().checkpoint = Some((snapshot.clone(), revision));
        })
    }

    fn commit(&self, doc_id: &str, op: &CommittedOperation, checkpoint: Option<&Value>) -> Result<(), StoreError> {
        self.check_writable()?;
        self.with_documents(|docs| {
            let doc = docs.entry(doc_id.to_string()).or_default();
            doc.operations.push(op.clone());
            if let Some(snapshot) = checkpoint {
                doc.checkpoint = Some((snapshot.clone(), op.revision));
            }
        })
    }
}
