//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── DocumentRoom (doc_id) ── BroadcastGroup
//!             ├── connection ────▶│        │
//! Client B ──┘   (reader loop)    │        ├── DocumentStorage (RocksDB | memory)
//!                                 │        │       ├── checkpoints (LZ4)
//!                                 │        │       └── operations
//!                                 │        │
//!                     ┌───────────┴────────┼───────────┐
//!                     ▼ forwarder          ▼           ▼
//!                 outgoing queue ── writer task ── socket
//! ```
//!
//! Each connection runs:
//! - a reader loop handling `Subscribe` / `Submit` / `Unsubscribe` / `Ping`
//! - one forwarder task per subscribed document, turning room events into
//!   `Ack` (own commits) or `Broadcast` (everyone else's)
//! - a writer task draining the outgoing queue, so socket writes never
//!   happen inside a room's critical section
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 9

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{AllowAnonymous, Authenticator, Identity, JwtAuthenticator};
use crate::broadcast::{RoomEvent, RoomReceiver};
use crate::error::{ErrorKind, SyncError};
use crate::hub::{HubConfig, SyncHub};
use crate::protocol::SyncMessage;
use crate::storage::{DocumentStorage, MemoryStore, RocksStore, StoreConfig};
use crate::transport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret for JWT handshakes (None = anonymous access)
    pub jwt_secret: Option<String>,
    /// Outgoing frames buffered per connection
    pub outgoing_capacity: usize,
    /// How often idle rooms are checked for eviction
    pub eviction_interval: Duration,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            jwt_secret: None,
            outgoing_capacity: 256,
            eviction_interval: Duration::from_secs(60),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            outgoing_capacity: 64,
            eviction_interval: Duration::from_millis(100),
            hub: HubConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `FLOWSYNC_BIND`, `FLOWSYNC_STORAGE`,
    /// `FLOWSYNC_JWT_SECRET` and `FLOWSYNC_CHECKPOINT_INTERVAL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("FLOWSYNC_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(path) = std::env::var("FLOWSYNC_STORAGE") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Ok(secret) = std::env::var("FLOWSYNC_JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }
        match std::env::var("FLOWSYNC_CHECKPOINT_INTERVAL").map(|v| v.parse::<u64>()) {
            Ok(Ok(interval)) if interval > 0 => config.hub.checkpoint_interval = interval,
            Ok(_) => log::warn!("Ignoring invalid FLOWSYNC_CHECKPOINT_INTERVAL"),
            Err(_) => {}
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub active_documents: usize,
    pub subscribers: usize,
}

#[derive(Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
    messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<SyncHub>,
    authenticator: Arc<dyn Authenticator>,
    counters: Arc<ConnectionCounters>,
}

impl SyncServer {
    /// Create a server from configuration: RocksDB when `storage_path` is
    /// set, JWT handshakes when `jwt_secret` is set.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let storage: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Opened document store at {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let authenticator: Arc<dyn Authenticator> = match &config.jwt_secret {
            Some(secret) => Arc::new(JwtAuthenticator::new(secret.as_bytes())),
            None => Arc::new(AllowAnonymous),
        };
        Ok(Self::with_storage(config, storage).with_authenticator(authenticator))
    }

    /// Create over an already opened storage backend.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        let hub = Arc::new(SyncHub::new(config.hub.clone(), storage));
        Self {
            config,
            hub,
            authenticator: Arc::new(AllowAnonymous),
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn hub(&self) -> Arc<SyncHub> {
        self.hub.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        let hub = self.hub.stats().await;
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_handshakes: self.counters.rejected.load(Ordering::Relaxed),
            total_messages: self.counters.messages.load(Ordering::Relaxed),
            active_documents: hub.documents,
            subscribers: hub.subscribers,
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        // Weak so a dropped server releases its storage
        let hub = Arc::downgrade(&self.hub);
        let interval = self.config.eviction_interval;
        let evictor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let evicted = hub.evict_idle().await;
                if evicted > 0 {
                    log::debug!("Evicted {evicted} idle documents");
                }
            }
        });

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let authenticator = self.authenticator.clone();
            let counters = self.counters.clone();
            let capacity = self.config.outgoing_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, authenticator, counters, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        evictor.abort();
        Ok(result?)
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<SyncHub>,
    authenticator: Arc<dyn Authenticator>,
    counters: Arc<ConnectionCounters>,
    outgoing_capacity: usize,
) -> Result<(), SyncError> {
    let (ws, identity) = match transport::accept(stream, authenticator.as_ref()).await {
        Ok(accepted) => accepted,
        Err(SyncError::Unauthorized) => {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected unauthenticated connection from {addr}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let connection_id = Uuid::new_v4();
    counters.total.fetch_add(1, Ordering::Relaxed);
    counters.active.fetch_add(1, Ordering::Relaxed);
    log::info!("Connection {connection_id} from {addr} authenticated as {identity}");

    let (mut writer, mut reader) = transport::split(ws);
    let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(outgoing_capacity.max(1));

    // Writer task: drain the outgoing queue into the socket
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = writer.send(&msg).await {
                log::debug!("Write to {connection_id} failed: {e}");
                return;
            }
        }
        let _ = writer.close().await;
    });

    let mut session = Session {
        connection_id,
        identity,
        hub,
        out: out_tx,
        forwarders: HashMap::new(),
    };

    while let Some(frame) = reader.recv().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(SyncError::Deserialization(e)) => {
                log::warn!("Undecodable frame from {connection_id}: {e}");
                continue;
            }
            Err(e) => {
                log::debug!("Connection {connection_id} read error: {e}");
                break;
            }
        };
        counters.messages.fetch_add(1, Ordering::Relaxed);

        if session.handle(msg).await == Flow::Close {
            log::info!("Closing connection {connection_id}");
            break;
        }
    }

    session.close().await;
    // Every sender is gone now; the writer flushes and closes the socket
    let _ = writer_task.await;

    counters.active.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection {connection_id} from {addr} closed");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection state owned by the reader loop.
struct Session {
    connection_id: Uuid,
    identity: Identity,
    hub: Arc<SyncHub>,
    out: mpsc::Sender<SyncMessage>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Session {
    async fn handle(&mut self, msg: SyncMessage) -> Flow {
        match msg {
            SyncMessage::Subscribe { doc_id, since } => self.subscribe(doc_id, since).await,
            SyncMessage::Submit {
                doc_id,
                base_revision,
                operation,
                client_op_id,
            } => {
                let result = self
                    .hub
                    .submit(&doc_id, self.connection_id, &self.identity, client_op_id, base_revision, operation)
                    .await;
                match result {
                    // Fresh commits are acknowledged by the forwarder, in
                    // revision order with the broadcasts around them
                    Ok(receipt) if !receipt.duplicate && self.forwarders.contains_key(&doc_id) => Flow::Continue,
                    Ok(receipt) => {
                        self.send(SyncMessage::Ack {
                            doc_id,
                            client_op_id,
                            revision: receipt.revision,
                            conflicts: receipt.conflicts,
                            partial: receipt.partial,
                        })
                        .await
                    }
                    Err(e) => self.fail(doc_id, Some(client_op_id), e).await,
                }
            }
            SyncMessage::Unsubscribe { doc_id } => {
                self.unsubscribe(&doc_id).await;
                Flow::Continue
            }
            SyncMessage::Ping => self.send(SyncMessage::Pong).await,
            other => {
                log::debug!("Ignoring unexpected message from {}: {other:?}", self.connection_id);
                Flow::Continue
            }
        }
    }

    async fn subscribe(&mut self, doc_id: String, since: Option<u64>) -> Flow {
        // Re-subscribing resets the stream for this document
        self.unsubscribe(&doc_id).await;

        let subscription = match self
            .hub
            .subscribe(&doc_id, self.connection_id, self.identity.clone(), since)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => return self.fail(doc_id, None, e).await,
        };

        // Snapshot goes out before the forwarder can queue anything
        let flow = self
            .send(SyncMessage::Snapshot {
                doc_id: doc_id.clone(),
                revision: subscription.revision,
                snapshot: subscription.snapshot,
                operations: subscription.operations,
            })
            .await;
        if flow == Flow::Close {
            self.hub.unsubscribe(&doc_id, self.connection_id).await;
            return flow;
        }

        let forwarder = tokio::spawn(forward_room(
            self.hub.clone(),
            doc_id.clone(),
            self.connection_id,
            subscription.receiver,
            subscription.revision,
            self.out.clone(),
        ));
        self.forwarders.insert(doc_id, forwarder);
        Flow::Continue
    }

    async fn unsubscribe(&mut self, doc_id: &str) {
        if let Some(forwarder) = self.forwarders.remove(doc_id) {
            forwarder.abort();
            self.hub.unsubscribe(doc_id, self.connection_id).await;
        }
    }

    /// Report an error; `InvalidRevision` also ends the connection.
    async fn fail(&mut self, doc_id: String, client_op_id: Option<Uuid>, err: SyncError) -> Flow {
        log::warn!("Connection {} on {doc_id}: {err}", self.connection_id);
        let flow = self.send(SyncMessage::error(doc_id, client_op_id, &err)).await;
        if err.kind() == ErrorKind::InvalidRevision {
            Flow::Close
        } else {
            flow
        }
    }

    async fn send(&self, msg: SyncMessage) -> Flow {
        match self.out.send(msg).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close,
        }
    }

    async fn close(&mut self) {
        let docs: Vec<String> = self.forwarders.keys().cloned().collect();
        for doc_id in docs {
            self.unsubscribe(&doc_id).await;
        }
    }
}

/// Relay one document's room events to a connection, starting after
/// `delivered`.
async fn forward_room(
    hub: Arc<SyncHub>,
    doc_id: String,
    connection_id: Uuid,
    mut receiver: RoomReceiver,
    mut delivered: u64,
    out: mpsc::Sender<SyncMessage>,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if event.commit.revision <= delivered {
                    continue;
                }
                delivered = event.commit.revision;
                if out.send(event_message(&event, connection_id)).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Connection {connection_id} lagged {missed} events on {doc_id}, catching up");
                let events = match hub.events_since(&doc_id, delivered).await {
                    Ok(events) => events,
                    Err(e) => {
                        log::error!("Catch-up for {connection_id} on {doc_id} failed: {e}");
                        return;
                    }
                };
                for event in events {
                    delivered = event.commit.revision;
                    if out.send(event_message(&event, connection_id)).await.is_err() {
                        return;
                    }
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn event_message(event: &RoomEvent, connection_id: Uuid) -> SyncMessage {
    if event.origin_connection == connection_id {
        SyncMessage::Ack {
            doc_id: event.doc_id.clone(),
            client_op_id: event.commit.client_op_id,
            revision: event.commit.revision,
            conflicts: event.commit.conflicts.clone(),
            partial: event.commit.partial,
        }
    } else {
        SyncMessage::Broadcast {
            doc_id: event.doc_id.clone(),
            revision: event.commit.revision,
            operation: event.commit.operation.clone(),
            origin_client_op_id: event.commit.client_op_id,
        }
    }
}
