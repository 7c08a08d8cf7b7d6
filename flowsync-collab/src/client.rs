//! WebSocket sync client for one document.
//!
//! Provides:
//! - Optimistic local edits through a [`DocumentReplica`]
//! - A background session task: connect, subscribe, pump messages
//! - Size-1 submission window with acks, rollbacks and retries
//! - Reconnect with exponential backoff; pending edits survive disconnects
//!
//! ```text
//!  Disconnected ──▶ Connecting ──▶ Subscribing ──Snapshot──▶ Synced
//!        ▲              │               ▲                      │
//!        └── backoff ◀──┴── transport lost ◀───────────────────┘
//!                               gap / partial ack ──▶ Subscribing
//! ```
//!
//! Reference: Kleppmann, DDIA Chapter 5 (Replication)

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::MaybeTlsStream;
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError};
use crate::protocol::SyncMessage;
use crate::transport::{self, Backoff, BackoffConfig, FrameReader, FrameWriter};
use flowsync_core::graph::empty_document;
use flowsync_core::{CommittedOperation, Conflict, DocumentReplica, Operation, ReplicaError, Value};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub doc_id: String,
    /// Sent as the `Authorization` cookie
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
    /// Events buffered for the application before new ones are dropped
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            doc_id: doc_id.into(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            event_capacity: 1024,
        }
    }

    pub fn for_testing(url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            backoff: BackoffConfig::for_testing(),
            ..Self::new(url, doc_id)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Waiting for the authoritative snapshot
    Subscribing,
    Synced,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    /// Authoritative snapshot received and pending edits re-applied
    Synced { revision: u64 },
    /// Someone else's operation, as applied to the local view
    RemoteOperation { revision: u64, operation: Operation },
    Acknowledged { client_op_id: Uuid, revision: u64 },
    /// Part or all of an edit was dropped to keep replicas convergent
    Conflict { client_op_id: Option<Uuid>, conflict: Conflict },
    /// The hub refused an edit; it has been rolled back locally
    Rejected {
        client_op_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
}

/// State shared between the handle and the session task.
struct ClientShared {
    replica: Mutex<DocumentReplica>,
    state: RwLock<ConnectionState>,
    /// Signalled when a local edit may be ready to submit
    wake: Notify,
    events: mpsc::Sender<SyncEvent>,
}

impl ClientShared {
    fn emit(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => log::debug!("Event queue full, dropping {event:?}"),
        }
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next;
            drop(state);
            self.emit(SyncEvent::StateChanged(next));
        }
    }
}

/// The sync client.
///
/// Owns the local replica of one document and, once started, a background
/// task that keeps it in sync with the server.
pub struct SyncClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client. Local edits are accepted immediately; nothing
    /// touches the network until [`start`](Self::start).
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let replica = DocumentReplica::new(config.doc_id.clone(), empty_document());
        Self {
            config,
            shared: Arc::new(ClientShared {
                replica: Mutex::new(replica),
                state: RwLock::new(ConnectionState::Disconnected),
                wake: Notify::new(),
                events: event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx,
            task: None,
        }
    }

    /// Spawn the session task. Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let shutdown = self.shutdown_tx.subscribe();
        self.task = Some(tokio::spawn(run_session(self.config.clone(), self.shared.clone(), shutdown)));
    }

    /// Apply an edit locally and queue it for the server.
    pub async fn submit(&self, operation: Operation) -> Result<Uuid, ReplicaError> {
        let client_op_id = self.shared.replica.lock().await.apply_local(operation)?;
        self.shared.wake.notify_one();
        Ok(client_op_id)
    }

    /// Local view: last authoritative state plus pending edits.
    pub async fn snapshot(&self) -> Value {
        self.shared.replica.lock().await.snapshot().clone()
    }

    /// Last revision confirmed by the server.
    pub async fn revision(&self) -> u64 {
        self.shared.replica.lock().await.revision()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.replica.lock().await.pending_len()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn doc_id(&self) -> &str {
        &self.config.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.url
    }

    /// Stop the session task and wait for it. Pending edits are kept; a
    /// later [`start`](Self::start) resumes submitting them.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Session task for {} ended abnormally: {e}", self.config.doc_id);
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Reconnect loop. Runs until shutdown; never gives up on the server.
async fn run_session(config: ClientConfig, shared: Arc<ClientShared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(config.backoff.clone());
    let mut full_resync = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting).await;

        let end = match transport::connect(&config.url, config.token.as_deref(), config.connect_timeout).await {
            Ok(stream) => {
                log::info!("Connected to {} for {}", config.url, config.doc_id);
                let (writer, reader) = transport::split(stream);
                let mut session = Session {
                    doc_id: &config.doc_id,
                    shared: &shared,
                    writer,
                    backoff: &mut backoff,
                    full_resync: &mut full_resync,
                    awaiting_snapshot: true,
                    retry_at: None,
                };
                session.run(reader, &mut shutdown, config.heartbeat_interval).await
            }
            Err(e) => Err(e),
        };

        shared.replica.lock().await.disconnect();
        match end {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Lost) => log::info!("Connection to {} lost", config.url),
            Err(SyncError::Unauthorized) => log::error!("Server {} refused our credentials", config.url),
            Err(e) => log::warn!("Connection to {} failed: {e}", config.url),
        }
        shared.set_state(ConnectionState::Disconnected).await;

        let delay = backoff.next_delay();
        log::debug!("Reconnecting in {delay:?} (attempt {})", backoff.attempt());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.replica.lock().await.disconnect();
    shared.set_state(ConnectionState::Disconnected).await;
}

/// One live connection.
struct Session<'a> {
    doc_id: &'a str,
    shared: &'a ClientShared,
    writer: FrameWriter<MaybeTlsStream<TcpStream>>,
    backoff: &'a mut Backoff,
    /// Subscribe without `since` next time
    full_resync: &'a mut bool,
    awaiting_snapshot: bool,
    /// Resubmit the in-flight op at this time (persistence failure)
    retry_at: Option<Instant>,
}

impl Session<'_> {
    async fn run(
        &mut self,
        mut reader: FrameReader<MaybeTlsStream<TcpStream>>,
        shutdown: &mut watch::Receiver<bool>,
        heartbeat: Duration,
    ) -> Result<SessionEnd, SyncError> {
        self.resubscribe().await?;

        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                frame = reader.recv() => match frame {
                    None => return Ok(SessionEnd::Lost),
                    Some(Ok(msg)) => self.on_message(msg).await?,
                    Some(Err(SyncError::Deserialization(e))) => log::warn!("Undecodable frame: {e}"),
                    Some(Err(e)) => return Err(e),
                },
                _ = self.shared.wake.notified() => self.send_next().await?,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.send_next().await?;
                }
                _ = ticker.tick() => self.writer.send(&SyncMessage::Ping).await?,
                _ = shutdown.changed() => {
                    let _ = self.writer.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    async fn on_message(&mut self, msg: SyncMessage) -> Result<(), SyncError> {
        if msg.doc_id().is_some_and(|doc_id| doc_id != self.doc_id) {
            log::debug!("Ignoring message for another document: {msg:?}");
            return Ok(());
        }
        match msg {
            SyncMessage::Snapshot {
                revision,
                snapshot,
                operations,
                ..
            } => self.on_snapshot(revision, snapshot, operations).await,
            SyncMessage::Ack {
                client_op_id,
                revision,
                conflicts,
                partial,
                ..
            } => self.on_ack(client_op_id, revision, conflicts, partial).await,
            SyncMessage::Broadcast {
                revision,
                operation,
                origin_client_op_id,
                ..
            } => self.on_broadcast(revision, operation, origin_client_op_id).await,
            SyncMessage::Error {
                client_op_id,
                kind,
                message,
                ..
            } => self.on_error(client_op_id, kind, message).await,
            SyncMessage::Pong => Ok(()),
            other => {
                log::debug!("Ignoring unexpected message: {other:?}");
                Ok(())
            }
        }
    }

    async fn on_snapshot(
        &mut self,
        revision: u64,
        snapshot: Value,
        operations: Vec<CommittedOperation>,
    ) -> Result<(), SyncError> {
        let outcome = self
            .shared
            .replica
            .lock()
            .await
            .resync(snapshot, revision, &operations);

        self.awaiting_snapshot = false;
        *self.full_resync = false;
        self.backoff.reset();

        for (client_op_id, revision) in outcome.acknowledged {
            self.shared.emit(SyncEvent::Acknowledged { client_op_id, revision });
        }
        self.emit_conflicts(outcome.conflicts);

        log::info!("Synced {} at revision {revision}", self.doc_id);
        self.shared.set_state(ConnectionState::Synced).await;
        self.shared.emit(SyncEvent::Synced { revision });
        self.send_next().await
    }

    async fn on_ack(
        &mut self,
        client_op_id: Uuid,
        revision: u64,
        conflicts: Vec<Conflict>,
        partial: bool,
    ) -> Result<(), SyncError> {
        if self.awaiting_snapshot {
            return Ok(());
        }
        let result = {
            let mut replica = self.shared.replica.lock().await;
            if replica.in_flight() != Some(client_op_id) {
                log::debug!("Ignoring ack for {client_op_id}, not in flight");
                return Ok(());
            }
            replica.acknowledge(client_op_id, revision)
        };

        if let Err(e) = result {
            log::warn!("Ack for {client_op_id} out of order ({e}), resyncing");
            return self.resubscribe().await;
        }

        self.shared.emit(SyncEvent::Acknowledged { client_op_id, revision });
        for conflict in conflicts {
            self.shared.emit(SyncEvent::Conflict {
                client_op_id: Some(client_op_id),
                conflict,
            });
        }
        if partial {
            log::warn!("Revision {revision} committed {client_op_id} partially, resyncing");
            return self.resubscribe().await;
        }
        self.send_next().await
    }

    async fn on_broadcast(&mut self, revision: u64, operation: Operation, origin: Uuid) -> Result<(), SyncError> {
        if self.awaiting_snapshot {
            return Ok(());
        }
        let result = {
            let mut replica = self.shared.replica.lock().await;
            if replica.in_flight() == Some(origin) {
                // Committed, but the conflicts only come with the snapshot
                drop(replica);
                log::debug!("Own operation {origin} relayed as a broadcast, resyncing");
                return self.resubscribe().await;
            }
            if revision <= replica.revision() {
                return Ok(());
            }
            replica.apply_remote(revision, operation)
        };

        match result {
            Ok(applied) => {
                self.shared.emit(SyncEvent::RemoteOperation {
                    revision,
                    operation: applied.operation,
                });
                self.emit_conflicts(applied.conflicts);
                Ok(())
            }
            Err(e) => {
                log::warn!("Remote revision {revision} not applicable ({e}), resyncing");
                self.resubscribe().await
            }
        }
    }

    async fn on_error(&mut self, client_op_id: Option<Uuid>, kind: ErrorKind, message: String) -> Result<(), SyncError> {
        if kind == ErrorKind::InvalidRevision {
            // The server closes the connection; start over from scratch
            log::warn!("Server rejected our revision: {message}");
            *self.full_resync = true;
            return Ok(());
        }
        let Some(client_op_id) = client_op_id else {
            log::warn!("Server error on {}: {message}", self.doc_id);
            return Ok(());
        };

        let mut replica = self.shared.replica.lock().await;
        if replica.in_flight() != Some(client_op_id) {
            return Ok(());
        }

        if kind == ErrorKind::PersistenceFailure {
            replica.requeue_in_flight();
            let delay = self.backoff.base_delay();
            log::warn!("Server could not persist {client_op_id}, retrying in {delay:?}");
            self.retry_at = Some(Instant::now() + delay);
            return Ok(());
        }

        if kind.is_structural() {
            let result = replica.reject(client_op_id);
            drop(replica);
            log::warn!("Server rejected {client_op_id}: {message}");
            self.shared.emit(SyncEvent::Rejected {
                client_op_id,
                kind,
                message,
            });
            return match result {
                Ok(conflicts) => {
                    self.emit_conflicts(conflicts);
                    self.send_next().await
                }
                Err(e) => {
                    log::warn!("Rollback of {client_op_id} failed ({e}), resyncing");
                    self.resubscribe().await
                }
            };
        }

        replica.requeue_in_flight();
        drop(replica);
        log::warn!("Submit of {client_op_id} failed ({kind:?}: {message}), resyncing");
        self.resubscribe().await
    }

    fn emit_conflicts(&self, conflicts: Vec<(Uuid, Conflict)>) {
        for (client_op_id, conflict) in conflicts {
            self.shared.emit(SyncEvent::Conflict {
                client_op_id: Some(client_op_id),
                conflict,
            });
        }
    }

    /// Ask for the authoritative state again. Nothing is submitted until
    /// the snapshot arrives.
    async fn resubscribe(&mut self) -> Result<(), SyncError> {
        let since = {
            let mut replica = self.shared.replica.lock().await;
            replica.disconnect();
            (!*self.full_resync).then(|| replica.revision())
        };
        self.awaiting_snapshot = true;
        self.retry_at = None;
        self.shared.set_state(ConnectionState::Subscribing).await;
        self.writer
            .send(&SyncMessage::Subscribe {
                doc_id: self.doc_id.to_string(),
                since,
            })
            .await
    }

    async fn send_next(&mut self) -> Result<(), SyncError> {
        if self.awaiting_snapshot || self.retry_at.is_some() {
            return Ok(());
        }
        let submission = self.shared.replica.lock().await.take_submission();
        if let Some(submission) = submission {
            log::debug!(
                "Submitting {} on {} at base {}",
                submission.client_op_id,
                self.doc_id,
                submission.base_revision
            );
            self.writer
                .send(&SyncMessage::Submit {
                    doc_id: self.doc_id.to_string(),
                    base_revision: submission.base_revision,
                    operation: submission.operation,
                    client_op_id: submission.client_op_id,
                })
                .await?;
        }
        Ok(())
    }
}
