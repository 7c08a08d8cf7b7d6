//! Server hub: the authoritative copy of every open document.
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!  submit ──────▶ │ DocumentRoom (tokio Mutex)               │
//!                 │  1. base > rev        → InvalidRevision  │
//!                 │  2. transform past (base, rev]  (Later)  │
//!                 │  3. apply (Divisible | Atomic)           │
//!                 │  4. storage.commit  (op [+ checkpoint])  │
//!                 │  5. rev += 1, history, publish           │
//!                 └──────────────────┬───────────────────────┘
//!                                    │ BroadcastGroup
//!                     ┌──────────────┼──────────────┐
//!                     ▼              ▼              ▼
//!                 forwarder      forwarder      forwarder   (one per connection)
//! ```
//!
//! Rooms are loaded lazily from storage (checkpoint + log replay) and
//! evicted after sitting idle without subscribers. The room map lock only
//! guards slot creation; loading happens inside the document's own slot.

use crate::auth::Identity;
use crate::broadcast::{BroadcastGroup, RoomEvent, RoomReceiver};
use crate::error::SyncError;
use crate::storage::DocumentStorage;
use flowsync_core::graph::empty_document;
use flowsync_core::{transform, CommittedOperation, Conflict, InsertPolicy, Operation, Side, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// What happens when some components of a (transformed) operation fail
/// to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Drop the failing components, commit the rest, report them.
    #[default]
    Divisible,
    /// Reject the whole operation.
    Atomic,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Write a checkpoint every N revisions
    pub checkpoint_interval: u64,
    /// Committed operations kept in memory per room
    pub history_limit: usize,
    /// Evict rooms without subscribers after this long
    pub idle_eviction: Duration,
    pub commit_policy: CommitPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            checkpoint_interval: 100,
            history_limit: 1000,
            idle_eviction: Duration::from_secs(300),
            commit_policy: CommitPolicy::Divisible,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            checkpoint_interval: 10,
            history_limit: 100,
            idle_eviction: Duration::from_millis(50),
            commit_policy: CommitPolicy::Divisible,
        }
    }
}

/// Initial state handed to a new subscriber.
pub struct Subscription {
    pub revision: u64,
    pub snapshot: Value,
    /// Operations after the requested `since`, empty when none was given.
    pub operations: Vec<CommittedOperation>,
    pub receiver: RoomReceiver,
}

/// Outcome of an accepted submit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub revision: u64,
    pub conflicts: Vec<Conflict>,
    /// Components were dropped at apply time.
    pub partial: bool,
    /// The operation had already been committed; nothing new was written.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub documents: usize,
    pub subscribers: usize,
    pub events_sent: u64,
    pub events_lagged: u64,
}

/// A document's entry in the room map, filled on first access.
type RoomSlot = Arc<OnceCell<Arc<Mutex<DocumentRoom>>>>;

struct DocumentRoom {
    doc_id: String,
    snapshot: Value,
    revision: u64,
    /// Contiguous tail of the log, ending at `revision`. Events replayed
    /// from storage carry a nil origin connection.
    history: VecDeque<Arc<RoomEvent>>,
    broadcast: BroadcastGroup,
    last_checkpoint: u64,
    idle_since: Option<Instant>,
    evicted: bool,
}

impl DocumentRoom {
    /// Recover from the latest checkpoint plus the log after it; a document
    /// never seen before starts empty and is checkpointed right away.
    fn load(doc_id: &str, storage: &dyn DocumentStorage, config: &HubConfig) -> Result<Self, SyncError> {
        let stored = storage.load_snapshot(doc_id)?;
        let has_checkpoint = stored.is_some();
        let (mut snapshot, checkpoint) = stored.unwrap_or_else(|| (empty_document(), 0));
        let replay = storage.load_operations(doc_id, checkpoint)?;
        let is_new = !has_checkpoint && replay.is_empty();

        let mut revision = checkpoint;
        let mut history = VecDeque::new();
        for committed in replay {
            if committed.revision != revision + 1 {
                return Err(SyncError::PersistenceFailure(format!(
                    "log for {doc_id} jumps from {revision} to {}",
                    committed.revision
                )));
            }
            snapshot = committed
                .operation
                .apply(&snapshot)
                .map_err(|e| SyncError::PersistenceFailure(format!("replay of {doc_id} failed: {e}")))?;
            revision = committed.revision;
            history.push_back(Arc::new(RoomEvent {
                doc_id: doc_id.to_string(),
                commit: committed,
                origin_connection: Uuid::nil(),
            }));
            if history.len() > config.history_limit {
                history.pop_front();
            }
        }

        if is_new {
            storage.checkpoint(doc_id, 0, &snapshot)?;
            log::info!("Created document {doc_id}");
        } else {
            log::info!("Loaded document {doc_id} at revision {revision} (checkpoint {checkpoint})");
        }

        Ok(Self {
            doc_id: doc_id.to_string(),
            snapshot,
            revision,
            history,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            last_checkpoint: checkpoint,
            idle_since: Some(Instant::now()),
            evicted: false,
        })
    }

    /// Revision just before the first operation held in memory.
    fn history_base(&self) -> u64 {
        self.revision - self.history.len() as u64
    }

    fn operations_since(&self, since: u64, storage: &dyn DocumentStorage) -> Result<Vec<CommittedOperation>, SyncError> {
        Ok(self
            .events_since(since, storage)?
            .into_iter()
            .map(|event| event.commit.clone())
            .collect())
    }

    /// Room events with revision in `(since, revision]`. Only the memory
    /// history knows origin connections; older events come back with a nil
    /// origin.
    fn events_since(&self, since: u64, storage: &dyn DocumentStorage) -> Result<Vec<Arc<RoomEvent>>, SyncError> {
        if since >= self.revision {
            return Ok(Vec::new());
        }
        if since >= self.history_base() {
            return Ok(self
                .history
                .iter()
                .filter(|event| event.commit.revision > since)
                .cloned()
                .collect());
        }
        let operations = storage.load_operations(&self.doc_id, since)?;
        Ok(operations
            .into_iter()
            .filter(|c| c.revision <= self.revision)
            .map(|commit| {
                Arc::new(RoomEvent {
                    doc_id: self.doc_id.clone(),
                    commit,
                    origin_connection: Uuid::nil(),
                })
            })
            .collect())
    }
}

/// Owner of all document rooms.
pub struct SyncHub {
    config: HubConfig,
    storage: Arc<dyn DocumentStorage>,
    rooms: RwLock<HashMap<String, RoomSlot>>,
}

impl SyncHub {
    pub fn new(config: HubConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        Self {
            config,
            storage,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get or load the room for `doc_id`.
    async fn room(&self, doc_id: &str) -> Result<Arc<Mutex<DocumentRoom>>, SyncError> {
        let slot = self.slot(doc_id).await;
        // Other documents stay reachable while this one loads
        let room = slot
            .get_or_try_init(|| async {
                DocumentRoom::load(doc_id, self.storage.as_ref(), &self.config).map(|room| Arc::new(Mutex::new(room)))
            })
            .await?;
        Ok(room.clone())
    }

    async fn slot(&self, doc_id: &str) -> RoomSlot {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(slot) = rooms.get(doc_id) {
                return slot.clone();
            }
        }

        // Slow path: write lock to create; the entry API double-checks
        let mut rooms = self.rooms.write().await;
        rooms.entry(doc_id.to_string()).or_default().clone()
    }

    /// The room for `doc_id` if it is resident and loaded.
    async fn resident(&self, doc_id: &str) -> Option<Arc<Mutex<DocumentRoom>>> {
        self.rooms.read().await.get(doc_id).and_then(|slot| slot.get().cloned())
    }

    /// Enter the document's critical section. Retries when the room was
    /// evicted between lookup and lock.
    async fn lock_room(&self, doc_id: &str) -> Result<OwnedMutexGuard<DocumentRoom>, SyncError> {
        loop {
            let guard = self.room(doc_id).await?.lock_owned().await;
            if !guard.evicted {
                return Ok(guard);
            }
        }
    }

    /// Register `connection_id` and return the current state. Snapshot and
    /// receiver are taken in the same critical section, so no commit falls
    /// between them.
    pub async fn subscribe(
        &self,
        doc_id: &str,
        connection_id: Uuid,
        identity: Identity,
        since: Option<u64>,
    ) -> Result<Subscription, SyncError> {
        let mut room = self.lock_room(doc_id).await?;

        let operations = match since {
            Some(since) if since > room.revision => {
                return Err(SyncError::InvalidRevision {
                    claimed: since,
                    current: room.revision,
                });
            }
            Some(since) => room.operations_since(since, self.storage.as_ref())?,
            None => Vec::new(),
        };

        let receiver = room.broadcast.add_subscriber(connection_id, identity);
        room.idle_since = None;
        log::debug!(
            "Connection {connection_id} subscribed to {doc_id} at revision {} ({} ops since)",
            room.revision,
            operations.len()
        );

        Ok(Subscription {
            revision: room.revision,
            snapshot: room.snapshot.clone(),
            operations,
            receiver,
        })
    }

    pub async fn unsubscribe(&self, doc_id: &str, connection_id: Uuid) {
        let Some(room) = self.resident(doc_id).await else {
            return;
        };
        let mut room = room.lock().await;
        room.broadcast.remove_subscriber(&connection_id);
        if room.broadcast.subscriber_count() == 0 {
            room.idle_since = Some(Instant::now());
        }
    }

    /// Commit an operation submitted against `base_revision`.
    pub async fn submit(
        &self,
        doc_id: &str,
        connection_id: Uuid,
        identity: &Identity,
        client_op_id: Uuid,
        base_revision: u64,
        operation: Operation,
    ) -> Result<SubmitReceipt, SyncError> {
        let mut room = self.lock_room(doc_id).await?;
        let current = room.revision;

        if base_revision > current {
            return Err(SyncError::InvalidRevision {
                claimed: base_revision,
                current,
            });
        }

        let concurrent = room.operations_since(base_revision, self.storage.as_ref())?;
        if let Some(existing) = concurrent.iter().find(|c| c.client_op_id == client_op_id) {
            log::debug!("Re-acknowledging {client_op_id} on {doc_id} at revision {}", existing.revision);
            return Ok(SubmitReceipt {
                revision: existing.revision,
                conflicts: existing.conflicts.clone(),
                partial: existing.partial,
                duplicate: true,
            });
        }

        let mut conflicts = Vec::new();
        let mut rebased = operation;
        for committed in &concurrent {
            let transformed = transform(&rebased, &committed.operation, Side::Later);
            conflicts.extend(transformed.conflicts);
            rebased = transformed.operation;
        }

        let (snapshot, applied, partial) = match self.config.commit_policy {
            CommitPolicy::Atomic => {
                let snapshot = rebased.apply(&room.snapshot)?;
                (snapshot, rebased, false)
            }
            CommitPolicy::Divisible => {
                let result = rebased.apply_divisible(&room.snapshot, InsertPolicy::Strict);
                let partial = !result.dropped.is_empty();
                conflicts.extend(result.dropped.iter().map(|(_, e)| Conflict::from(e)));
                (result.snapshot, result.applied, partial)
            }
        };

        let revision = current + 1;
        let commit = CommittedOperation {
            author: Some(identity.as_str().to_string()),
            conflicts: conflicts.clone(),
            partial,
            ..CommittedOperation::new(revision, applied, client_op_id)
        };
        let checkpoint_due = revision - room.last_checkpoint >= self.config.checkpoint_interval;

        // Nothing changes in memory unless the write succeeded
        self.storage
            .commit(doc_id, &commit, checkpoint_due.then_some(&snapshot))
            .map_err(|e| {
                log::error!("Failed to persist revision {revision} of {doc_id}: {e}");
                SyncError::from(e)
            })?;

        room.snapshot = snapshot;
        room.revision = revision;
        if checkpoint_due {
            room.last_checkpoint = revision;
        }

        let event = Arc::new(RoomEvent {
            doc_id: doc_id.to_string(),
            commit,
            origin_connection: connection_id,
        });
        room.history.push_back(event.clone());
        if room.history.len() > self.config.history_limit {
            room.history.pop_front();
        }

        if !conflicts.is_empty() {
            log::warn!(
                "Revision {revision} of {doc_id} dropped {} component(s) from {client_op_id}",
                conflicts.len()
            );
        }

        room.broadcast.publish(event);

        Ok(SubmitReceipt {
            revision,
            conflicts,
            partial,
            duplicate: false,
        })
    }

    /// Committed operations with revision in `(since, current]`.
    pub async fn operations_since(&self, doc_id: &str, since: u64) -> Result<Vec<CommittedOperation>, SyncError> {
        let room = self.lock_room(doc_id).await?;
        room.operations_since(since, self.storage.as_ref())
    }

    /// Room events with revision in `(since, current]`, for subscribers that
    /// fell behind the broadcast buffer.
    pub async fn events_since(&self, doc_id: &str, since: u64) -> Result<Vec<Arc<RoomEvent>>, SyncError> {
        let room = self.lock_room(doc_id).await?;
        room.events_since(since, self.storage.as_ref())
    }

    /// Current `(snapshot, revision)` of a document.
    pub async fn snapshot(&self, doc_id: &str) -> Result<(Value, u64), SyncError> {
        let room = self.lock_room(doc_id).await?;
        Ok((room.snapshot.clone(), room.revision))
    }

    /// Drop rooms that have had no subscribers for `idle_eviction`,
    /// checkpointing them first. Returns the number evicted.
    pub async fn evict_idle(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut evicted = Vec::new();

        for (doc_id, slot) in rooms.iter() {
            // Still loading
            let Some(room) = slot.get() else {
                continue;
            };
            let mut room = room.lock().await;
            let idle = room
                .idle_since
                .is_some_and(|since| since.elapsed() >= self.config.idle_eviction);
            if !idle || room.broadcast.subscriber_count() > 0 {
                continue;
            }
            if room.last_checkpoint < room.revision {
                if let Err(e) = self.storage.checkpoint(doc_id, room.revision, &room.snapshot) {
                    log::error!("Keeping {doc_id} resident, checkpoint failed: {e}");
                    continue;
                }
                room.last_checkpoint = room.revision;
            }
            room.evicted = true;
            evicted.push(doc_id.clone());
        }

        for doc_id in &evicted {
            rooms.remove(doc_id);
            log::info!("Evicted idle document {doc_id}");
        }
        evicted.len()
    }

    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.read().await;
        let mut stats = HubStats::default();
        for room in rooms.values().filter_map(|slot| slot.get()) {
            stats.documents += 1;
            let room = room.lock().await;
            let broadcast = room.broadcast.stats();
            stats.subscribers += broadcast.active_subscribers;
            stats.events_sent += broadcast.events_sent;
            stats.events_lagged += broadcast.events_lagged;
        }
        stats
    }
}
