//! Error types for the operation model and the document replica.

use crate::value::Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Structural failure while applying a component to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OpError {
    /// An intermediate segment does not resolve to a container of the
    /// right kind, or a sequence index is out of range.
    #[error("path not found: {0}")]
    PathNotFound(Path),

    /// A delete/replace expectation failed, or an insert hit an occupied key.
    #[error("conflicting expected value at {0}")]
    ConflictingExpectedValue(Path),
}

impl OpError {
    pub fn path(&self) -> &Path {
        match self {
            OpError::PathNotFound(p) | OpError::ConflictingExpectedValue(p) => p,
        }
    }
}

/// Failure of a replica state transition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicaError {
    /// A remote operation did not carry `revision == local + 1`.
    #[error("revision gap: expected {expected}, received {received}")]
    RevisionGap { expected: u64, received: u64 },

    /// An acknowledgement did not match the in-flight operation.
    #[error("unexpected acknowledgement for {0}")]
    UnexpectedAcknowledgement(Uuid),

    /// A committed remote operation failed to apply locally; the
    /// replica must resync from an authoritative snapshot.
    #[error("replica diverged from the authoritative copy: {0}")]
    Diverged(OpError),

    /// A local operation failed to apply.
    #[error(transparent)]
    Op(#[from] OpError),
}
