//! Per-document fan-out of committed operations.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver buffering up to `capacity`
//! events; a receiver that falls further behind observes a lag and must
//! catch up from the room history.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use crate::auth::Identity;
use flowsync_core::CommittedOperation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// A commit as seen by subscribers. The originating connection turns it
/// into an `Ack`, everyone else into a `Broadcast`.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub doc_id: String,
    pub commit: CommittedOperation,
    /// Nil when the commit was replayed from storage.
    pub origin_connection: Uuid,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_lagged: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters shared with every receiver.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_lagged: AtomicU64,
}

/// Subscriber side of a [`BroadcastGroup`].
pub struct RoomReceiver {
    rx: broadcast::Receiver<Arc<RoomEvent>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomReceiver {
    /// Next event. `RecvError::Lagged(n)` is counted before being returned.
    pub async fn recv(&mut self) -> Result<Arc<RoomEvent>, RecvError> {
        let result = self.rx.recv().await;
        if let Err(RecvError::Lagged(n)) = &result {
            self.stats.events_lagged.fetch_add(*n, Ordering::Relaxed);
        }
        result
    }
}

/// Broadcast group for a single document room.
///
/// Mutated only from inside the room's critical section, so the
/// subscriber table needs no lock of its own.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    subscribers: HashMap<Uuid, Identity>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of events buffered per receiver before a
    /// slow subscriber starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: HashMap::new(),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a connection and return its receiver.
    pub fn add_subscriber(&mut self, connection_id: Uuid, identity: Identity) -> RoomReceiver {
        self.subscribers.insert(connection_id, identity);
        RoomReceiver {
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub fn remove_subscriber(&mut self, connection_id: &Uuid) -> Option<Identity> {
        self.subscribers.remove(connection_id)
    }

    /// Fan out to every receiver. Never blocks; returns the receiver count.
    pub fn publish(&self, event: Arc<RoomEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, connection_id: &Uuid) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    pub fn subscribers(&self) -> Vec<Identity> {
        self.subscribers.values().cloned().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_lagged: self.stats.events_lagged.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
