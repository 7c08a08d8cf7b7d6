//! Error types shared by the hub, the transport and the client.

use crate::storage::StoreError;
use flowsync_core::OpError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error classification carried by `SyncMessage::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PathNotFound,
    ConflictingExpectedValue,
    InvalidRevision,
    Unauthorized,
    PersistenceFailure,
    TransportClosed,
    TransportTimeout,
    Protocol,
}

impl ErrorKind {
    /// Structural kinds mean the operation itself is bad; retrying it
    /// unchanged cannot succeed.
    pub fn is_structural(self) -> bool {
        matches!(self, ErrorKind::PathNotFound | ErrorKind::ConflictingExpectedValue)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("conflicting expected value at {0}")]
    ConflictingExpectedValue(String),

    #[error("invalid revision: claimed {claimed}, document is at {current}")]
    InvalidRevision { claimed: u64, current: u64 },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport timeout")]
    TransportTimeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::PathNotFound(_) => ErrorKind::PathNotFound,
            SyncError::ConflictingExpectedValue(_) => ErrorKind::ConflictingExpectedValue,
            SyncError::InvalidRevision { .. } => ErrorKind::InvalidRevision,
            SyncError::Unauthorized => ErrorKind::Unauthorized,
            SyncError::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            SyncError::TransportClosed => ErrorKind::TransportClosed,
            SyncError::TransportTimeout => ErrorKind::TransportTimeout,
            SyncError::Serialization(_) | SyncError::Deserialization(_) => ErrorKind::Protocol,
        }
    }
}

impl From<OpError> for SyncError {
    fn from(err: OpError) -> Self {
        match err {
            OpError::PathNotFound(path) => SyncError::PathNotFound(path.to_string()),
            OpError::ConflictingExpectedValue(path) => SyncError::ConflictingExpectedValue(path.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::PersistenceFailure(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) if response.status() == 401 => SyncError::Unauthorized,
            other => {
                log::debug!("Transport error: {other}");
                SyncError::TransportClosed
            }
        }
    }
}
