//! # flowsync-collab - Real-time sync of graph documents
//!
//! Server hub, client session manager and WebSocket transport around the
//! operational-transform core in `flowsync-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per doc)   │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────────┐                ┌─────────────────┐
//! │ DocumentReplica │                │ SyncHub         │
//! │ (local + queue) │                │ (authority)     │
//! └─────────────────┘                └──────┬──────────┘
//!                                           │
//!                               ┌───────────┴───────────┐
//!                               │ BroadcastGroup        │
//!                               │ DocumentStorage       │
//!                               └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`] - WebSocket handshake, frames, reconnect backoff
//! - [`auth`] - Handshake credential checks
//! - [`hub`] - Per-document serialized commit path
//! - [`broadcast`] - Room fan-out with lag detection
//! - [`server`] - WebSocket sync server
//! - [`client`] - Sync client with offline edits and reconnect
//! - [`storage`] - Checkpoints and operation log (RocksDB or memory)

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use auth::{AllowAnonymous, Authenticator, Identity, JwtAuthenticator, StaticTokens};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomEvent};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use error::{ErrorKind, SyncError};
pub use hub::{CommitPolicy, HubConfig, HubStats, SubmitReceipt, Subscription, SyncHub};
pub use protocol::SyncMessage;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{Backoff, BackoffConfig};
