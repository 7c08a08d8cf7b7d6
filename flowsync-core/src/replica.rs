//! Document replica: a local copy plus the queue of operations the
//! authoritative copy has not confirmed yet.
//!
//! ```text
//!   apply_local ──▶ pending [p0 (in flight), p1, p2]
//!                        │
//!   take_submission ─────┘  (size-1 window, only while synced)
//!
//!   acknowledge(p0) ─▶ pop, revision+1
//!   apply_remote    ─▶ transform remote past p0..pn, rewrite p0..pn
//!   resync          ─▶ authoritative snapshot, pending re-applied
//! ```

use crate::error::ReplicaError;
use crate::operation::{CommittedOperation, Operation};
use crate::transform::{transform_pair, Conflict, Side};
use crate::value::Value;
use std::collections::VecDeque;
use uuid::Uuid;

/// A locally applied operation awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub client_op_id: Uuid,
    /// Rebased onto the replica's current revision.
    pub operation: Operation,
}

/// What to send to the hub next.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub client_op_id: Uuid,
    pub base_revision: u64,
    pub operation: Operation,
}

/// Result of [`DocumentReplica::apply_remote`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteApply {
    /// The remote operation as applied to the local view.
    pub operation: Operation,
    /// Queued operations that lost components to the remote one. The
    /// in-flight operation is left out; the hub reports its losses.
    pub conflicts: Vec<(Uuid, Conflict)>,
}

/// Result of [`DocumentReplica::resync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResyncOutcome {
    /// Pending operations found already committed: `(client_op_id, revision)`.
    pub acknowledged: Vec<(Uuid, u64)>,
    /// Components lost by pending operations: those recorded on our own
    /// commits, those lost while rebasing past others' commits, and whole
    /// operations that no longer applied and were dropped.
    pub conflicts: Vec<(Uuid, Conflict)>,
}

/// Client-side replica of one document.
#[derive(Debug, Clone)]
pub struct DocumentReplica {
    doc_id: String,
    snapshot: Value,
    revision: u64,
    pending: VecDeque<PendingOperation>,
    in_flight: bool,
    synced: bool,
    initialized: bool,
}

impl DocumentReplica {
    /// Fresh replica at revision 0. A new document on the hub starts from
    /// the same `initial` snapshot, so local edits can begin before the
    /// first sync.
    pub fn new(doc_id: impl Into<String>, initial: Value) -> Self {
        Self {
            doc_id: doc_id.into(),
            snapshot: initial,
            revision: 0,
            pending: VecDeque::new(),
            in_flight: false,
            synced: false,
            initialized: false,
        }
    }

    pub fn from_snapshot(doc_id: impl Into<String>, snapshot: Value, revision: u64) -> Self {
        Self {
            snapshot,
            revision,
            initialized: true,
            synced: true,
            ..Self::new(doc_id, Value::Null)
        }
    }

    /// Optimistically apply a local edit and queue it for submission.
    pub fn apply_local(&mut self, operation: Operation) -> Result<Uuid, ReplicaError> {
        self.snapshot = operation.apply(&self.snapshot)?;
        let client_op_id = Uuid::new_v4();
        self.pending.push_back(PendingOperation {
            client_op_id,
            operation,
        });
        Ok(client_op_id)
    }

    /// Mark the oldest pending operation in flight and return it.
    pub fn take_submission(&mut self) -> Option<Submission> {
        if !self.synced || self.in_flight {
            return None;
        }
        let head = self.pending.front()?;
        self.in_flight = true;
        Some(Submission {
            client_op_id: head.client_op_id,
            base_revision: self.revision,
            operation: head.operation.clone(),
        })
    }

    /// Apply an operation committed by someone else at `revision`.
    /// On error the replica is unchanged.
    pub fn apply_remote(&mut self, revision: u64, operation: Operation) -> Result<RemoteApply, ReplicaError> {
        let expected = self.revision + 1;
        if revision != expected {
            return Err(ReplicaError::RevisionGap {
                expected,
                received: revision,
            });
        }

        let mut pending = self.pending.clone();
        let (remote, mut conflicts) = rebase_queue(&mut pending, operation);
        self.snapshot = remote.apply(&self.snapshot).map_err(ReplicaError::Diverged)?;
        self.pending = pending;
        self.revision = revision;

        if let Some(in_flight) = self.in_flight() {
            conflicts.retain(|(id, _)| *id != in_flight);
        }
        Ok(RemoteApply {
            operation: remote,
            conflicts,
        })
    }

    /// The in-flight operation was committed at `revision`.
    pub fn acknowledge(&mut self, client_op_id: Uuid, revision: u64) -> Result<(), ReplicaError> {
        match self.pending.front() {
            Some(head) if self.in_flight && head.client_op_id == client_op_id => {}
            _ => return Err(ReplicaError::UnexpectedAcknowledgement(client_op_id)),
        }
        let expected = self.revision + 1;
        if revision != expected {
            return Err(ReplicaError::RevisionGap {
                expected,
                received: revision,
            });
        }

        self.pending.pop_front();
        self.in_flight = false;
        self.revision = revision;
        Ok(())
    }

    /// Roll back the in-flight operation after the hub refused it.
    /// Returns the later pending operations' components that depended on
    /// it. On error the replica is unchanged.
    pub fn reject(&mut self, client_op_id: Uuid) -> Result<Vec<(Uuid, Conflict)>, ReplicaError> {
        match self.pending.front() {
            Some(head) if self.in_flight && head.client_op_id == client_op_id => {}
            _ => return Err(ReplicaError::UnexpectedAcknowledgement(client_op_id)),
        }

        let mut pending = self.pending.clone();
        let Some(rejected) = pending.pop_front() else {
            return Err(ReplicaError::UnexpectedAcknowledgement(client_op_id));
        };
        let (inverse, conflicts) = rebase_queue(&mut pending, rejected.operation.invert());
        self.snapshot = inverse.apply(&self.snapshot).map_err(ReplicaError::Diverged)?;
        self.pending = pending;
        self.in_flight = false;
        Ok(conflicts)
    }

    /// Keep the in-flight operation queued for another attempt.
    pub fn requeue_in_flight(&mut self) {
        self.in_flight = false;
    }

    /// Transport lost: nothing is in flight any more and the replica is no
    /// longer synced. Pending operations are kept.
    pub fn disconnect(&mut self) {
        self.in_flight = false;
        self.synced = false;
    }

    /// Reset to an authoritative snapshot.
    ///
    /// `ops_since` are the operations committed after the replica's
    /// revision, in order. Those carrying the head pending operation's id
    /// acknowledge it; the others rebase the pending queue. Pending
    /// operations are then re-applied to `snapshot`; any that fail are
    /// dropped. Every lost component is reported in the outcome.
    pub fn resync(
        &mut self,
        snapshot: Value,
        revision: u64,
        ops_since: &[CommittedOperation],
    ) -> ResyncOutcome {
        let mut outcome = ResyncOutcome::default();
        let since = self.revision;
        // Losses found while rebasing; superseded by the hub's record once
        // the operation turns up committed
        let mut rebased: Vec<(Uuid, Conflict)> = Vec::new();

        for committed in ops_since.iter().filter(|c| c.revision > since) {
            let ours = self
                .pending
                .front()
                .is_some_and(|head| head.client_op_id == committed.client_op_id);
            if ours {
                self.pending.pop_front();
                outcome.acknowledged.push((committed.client_op_id, committed.revision));
                rebased.retain(|(id, _)| *id != committed.client_op_id);
                outcome
                    .conflicts
                    .extend(committed.conflicts.iter().map(|c| (committed.client_op_id, c.clone())));
            } else {
                let (_, conflicts) = rebase_queue(&mut self.pending, committed.operation.clone());
                rebased.extend(conflicts);
            }
        }
        outcome.conflicts.extend(rebased);

        let mut rebuilt = snapshot.clone();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            match pending.operation.apply(&rebuilt) {
                Ok(next) => {
                    rebuilt = next;
                    kept.push_back(pending);
                }
                Err(e) => {
                    log::warn!("Dropping pending operation {} on resync: {e}", pending.client_op_id);
                    outcome.conflicts.push((pending.client_op_id, Conflict::from(&e)));
                }
            }
        }

        self.pending = kept;
        self.snapshot = rebuilt;
        self.revision = revision;
        self.in_flight = false;
        self.synced = true;
        self.initialized = true;
        outcome
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Local view: authoritative state plus pending edits.
    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    /// Last revision confirmed by the hub.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id of the operation currently awaiting an ack, if any.
    pub fn in_flight(&self) -> Option<Uuid> {
        self.pending
            .front()
            .filter(|_| self.in_flight)
            .map(|p| p.client_op_id)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// True once an authoritative snapshot has been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Transform `remote` past every queued operation, rewriting them so they
/// apply after it. Returns `remote` rebased onto the local state and the
/// components the queued operations lost, by `client_op_id`.
fn rebase_queue(queue: &mut VecDeque<PendingOperation>, mut remote: Operation) -> (Operation, Vec<(Uuid, Conflict)>) {
    let mut conflicts = Vec::new();
    for pending in queue.iter_mut() {
        let (past, rebased) = transform_pair(&remote, &pending.operation, Side::Earlier);
        if !rebased.conflicts.is_empty() {
            log::warn!(
                "Pending operation {} lost {} component(s) to a concurrent edit",
                pending.client_op_id,
                rebased.conflicts.len()
            );
        }
        conflicts.extend(rebased.conflicts.into_iter().map(|c| (pending.client_op_id, c)));
        pending.operation = rebased.operation;
        remote = past.operation;
    }
    (remote, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ConflictKind;
    use crate::value::Path;

    fn base() -> Value {
        Value::map()
            .with("nodes", Value::map().with("a", Value::map().with("text", "x")))
            .with("edges", Value::seq())
    }

    fn node(id: &str) -> Path {
        Path::root().key("nodes").key(id)
    }

    fn synced_replica() -> DocumentReplica {
        DocumentReplica::from_snapshot("doc", base(), 5)
    }

    #[test]
    fn test_apply_local_is_optimistic() {
        let mut replica = synced_replica();
        replica
            .apply_local(Operation::new().insert(node("b"), Value::map()))
            .unwrap();
        assert!(replica.snapshot().at(&node("b")).is_some());
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.revision(), 5);
    }

    #[test]
    fn test_apply_local_failure_leaves_state() {
        let mut replica = synced_replica();
        let err = replica
            .apply_local(Operation::new().delete(node("zz"), Value::Null))
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Op(_)));
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.snapshot(), &base());
    }

    #[test]
    fn test_single_in_flight_window() {
        let mut replica = synced_replica();
        let first = replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        replica.apply_local(Operation::new().insert(node("c"), Value::map())).unwrap();

        let submission = replica.take_submission().unwrap();
        assert_eq!(submission.client_op_id, first);
        assert_eq!(submission.base_revision, 5);
        assert!(replica.take_submission().is_none());

        replica.acknowledge(first, 6).unwrap();
        assert_eq!(replica.revision(), 6);
        let next = replica.take_submission().unwrap();
        assert_eq!(next.base_revision, 6);
    }

    #[test]
    fn test_no_submission_until_synced() {
        let mut replica = DocumentReplica::new("doc", base());
        replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        assert!(replica.take_submission().is_none());
        assert!(!replica.is_initialized());
    }

    fn delete_a() -> Operation {
        Operation::new().delete(node("a"), Value::map().with("text", "x"))
    }

    #[test]
    fn test_apply_remote_rebases_pending() {
        let mut replica = synced_replica();
        let id = replica
            .apply_local(Operation::new().replace(node("a").key("text"), "x", "mine"))
            .unwrap();

        // a concurrent delete of the node wins
        let applied = replica.apply_remote(6, delete_a()).unwrap();

        assert!(replica.snapshot().at(&node("a")).is_none());
        assert_eq!(replica.revision(), 6);
        assert!(replica.pending().all(|p| p.operation.is_empty()));
        assert_eq!(applied.conflicts.len(), 1);
        assert_eq!(applied.conflicts[0].0, id);
        assert_eq!(applied.conflicts[0].1.kind, ConflictKind::TargetRemoved);
        assert_eq!(applied.conflicts[0].1.path, node("a").key("text"));
        assert_eq!(applied.conflicts[0].1.value, Some(Value::from("mine")));
    }

    #[test]
    fn test_apply_remote_reports_queued_behind_in_flight() {
        let mut replica = synced_replica();
        let in_flight = replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        let queued = replica
            .apply_local(Operation::new().replace(node("a").key("text"), "x", "y"))
            .unwrap();
        assert_eq!(replica.take_submission().map(|s| s.client_op_id), Some(in_flight));

        let applied = replica.apply_remote(6, delete_a()).unwrap();

        let lengths: Vec<usize> = replica.pending().map(|p| p.operation.len()).collect();
        assert_eq!(lengths, vec![1, 0]);
        assert_eq!(applied.conflicts.len(), 1);
        assert_eq!(applied.conflicts[0].0, queued);
        assert_eq!(applied.conflicts[0].1.kind, ConflictKind::TargetRemoved);
    }

    #[test]
    fn test_apply_remote_in_flight_losses_left_to_hub() {
        let mut replica = synced_replica();
        replica
            .apply_local(Operation::new().replace(node("a").key("text"), "x", "y"))
            .unwrap();
        replica.take_submission().unwrap();

        let applied = replica.apply_remote(6, delete_a()).unwrap();
        assert!(applied.conflicts.is_empty());
    }

    #[test]
    fn test_apply_remote_divergence_leaves_replica_unchanged() {
        let mut replica = synced_replica();
        replica
            .apply_local(Operation::new().insert(Path::root().key("edges").index(0), "mine"))
            .unwrap();
        let before: Vec<PendingOperation> = replica.pending().cloned().collect();
        let snapshot = replica.snapshot().clone();

        // shifts the queued insert, then fails on a node that is not there
        let remote = Operation::new()
            .insert(Path::root().key("edges").index(0), "theirs")
            .delete(node("zz"), Value::Null);
        let err = replica.apply_remote(6, remote).unwrap_err();

        assert!(matches!(err, ReplicaError::Diverged(_)));
        assert_eq!(replica.pending().cloned().collect::<Vec<_>>(), before);
        assert_eq!(replica.snapshot(), &snapshot);
        assert_eq!(replica.revision(), 5);
    }

    #[test]
    fn test_apply_remote_gap() {
        let mut replica = synced_replica();
        let err = replica.apply_remote(8, Operation::new()).unwrap_err();
        assert_eq!(err, ReplicaError::RevisionGap { expected: 6, received: 8 });
    }

    #[test]
    fn test_unexpected_ack() {
        let mut replica = synced_replica();
        let id = replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        // not in flight yet
        assert_eq!(replica.acknowledge(id, 6), Err(ReplicaError::UnexpectedAcknowledgement(id)));
    }

    #[test]
    fn test_reject_rolls_back() {
        let mut replica = synced_replica();
        let id = replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        replica
            .apply_local(Operation::new().insert(node("c"), Value::map()))
            .unwrap();
        replica.take_submission().unwrap();

        let conflicts = replica.reject(id).unwrap();
        assert!(conflicts.is_empty());
        assert!(replica.snapshot().at(&node("b")).is_none());
        assert!(replica.snapshot().at(&node("c")).is_some());
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.in_flight(), None);
    }

    #[test]
    fn test_reject_reports_dependent_edits() {
        let mut replica = synced_replica();
        let id = replica
            .apply_local(Operation::new().insert(node("b"), Value::map().with("text", "b")))
            .unwrap();
        let dependent = replica
            .apply_local(Operation::new().replace(node("b").key("text"), "b", "edited"))
            .unwrap();
        replica.take_submission().unwrap();

        let conflicts = replica.reject(id).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0, dependent);
        assert_eq!(conflicts[0].1.kind, ConflictKind::TargetRemoved);
        assert!(replica.snapshot().at(&node("b")).is_none());
        assert_eq!(replica.snapshot(), &base());
    }

    #[test]
    fn test_disconnect_keeps_pending() {
        let mut replica = synced_replica();
        replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        replica.take_submission().unwrap();
        replica.disconnect();

        assert_eq!(replica.pending_len(), 1);
        assert!(!replica.is_synced());
        assert_eq!(replica.in_flight(), None);
        assert!(replica.take_submission().is_none());
    }

    #[test]
    fn test_requeue_in_flight() {
        let mut replica = synced_replica();
        let id = replica.apply_local(Operation::new().insert(node("b"), Value::map())).unwrap();
        replica.take_submission().unwrap();
        replica.requeue_in_flight();
        assert_eq!(replica.take_submission().map(|s| s.client_op_id), Some(id));
    }

    #[test]
    fn test_resync_detects_committed_in_flight() {
        let mut replica = synced_replica();
        let op = Operation::new().insert(node("b"), Value::map());
        let id = replica.apply_local(op.clone()).unwrap();
        replica.take_submission().unwrap();
        replica.disconnect();

        // the op was committed at 6 before the transport dropped
        let committed = CommittedOperation {
            revision: 6,
            operation: op.clone(),
            client_op_id: id,
            author: None,
            conflicts: Vec::new(),
            partial: false,
        };
        let server_snapshot = op.apply(&base()).unwrap();
        let outcome = replica.resync(server_snapshot.clone(), 6, &[committed]);

        assert_eq!(outcome.acknowledged, vec![(id, 6)]);
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.snapshot(), &server_snapshot);
        assert!(replica.is_synced());
    }

    #[test]
    fn test_resync_reports_conflicts_recorded_on_own_commit() {
        let mut replica = synced_replica();
        let op = Operation::new().replace(node("a").key("text"), "x", "y");
        let id = replica.apply_local(op).unwrap();
        replica.take_submission().unwrap();
        replica.disconnect();

        let lost = Conflict {
            kind: ConflictKind::TargetRemoved,
            path: node("a").key("text"),
            value: Some(Value::from("y")),
        };
        let committed = CommittedOperation {
            conflicts: vec![lost.clone()],
            ..CommittedOperation::new(6, Operation::new(), id)
        };
        let outcome = replica.resync(base(), 6, &[committed]);

        assert_eq!(outcome.acknowledged, vec![(id, 6)]);
        assert_eq!(outcome.conflicts, vec![(id, lost)]);
        assert_eq!(replica.snapshot(), &base());
    }

    #[test]
    fn test_resync_rebases_and_reapplies() {
        let mut replica = synced_replica();
        replica
            .apply_local(Operation::new().insert(node("mine"), Value::map()))
            .unwrap();
        replica.disconnect();

        let theirs = Operation::new().insert(node("theirs"), Value::map());
        let committed = CommittedOperation {
            revision: 6,
            operation: theirs.clone(),
            client_op_id: Uuid::new_v4(),
            author: Some("bob".into()),
            conflicts: Vec::new(),
            partial: false,
        };
        let server_snapshot = theirs.apply(&base()).unwrap();
        let outcome = replica.resync(server_snapshot, 6, &[committed]);

        assert!(outcome.acknowledged.is_empty());
        assert!(outcome.conflicts.is_empty());
        assert_eq!(replica.revision(), 6);
        assert!(replica.snapshot().at(&node("mine")).is_some());
        assert!(replica.snapshot().at(&node("theirs")).is_some());
        assert_eq!(replica.pending_len(), 1);
    }

    #[test]
    fn test_resync_reports_offline_edit_lost_to_delete() {
        let mut replica = synced_replica();
        let id = replica
            .apply_local(Operation::new().replace(node("a").key("text"), "x", "y"))
            .unwrap();
        replica.disconnect();

        let committed = CommittedOperation {
            revision: 6,
            operation: delete_a(),
            client_op_id: Uuid::new_v4(),
            author: Some("bob".into()),
            conflicts: Vec::new(),
            partial: false,
        };
        let server_snapshot = delete_a().apply(&base()).unwrap();
        let outcome = replica.resync(server_snapshot.clone(), 6, &[committed]);

        assert!(outcome.acknowledged.is_empty());
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].0, id);
        assert_eq!(outcome.conflicts[0].1.kind, ConflictKind::TargetRemoved);
        assert_eq!(outcome.conflicts[0].1.value, Some(Value::from("y")));
        assert_eq!(replica.snapshot(), &server_snapshot);
        assert_eq!(replica.revision(), 6);
    }

    #[test]
    fn test_resync_drops_inapplicable() {
        let mut replica = synced_replica();
        let id = replica
            .apply_local(Operation::new().replace(node("a").key("text"), "x", "y"))
            .unwrap();
        replica.disconnect();

        // full snapshot without history: node a is gone
        let server_snapshot = Value::map().with("nodes", Value::map()).with("edges", Value::seq());
        let outcome = replica.resync(server_snapshot.clone(), 9, &[]);

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].0, id);
        assert_eq!(outcome.conflicts[0].1.kind, ConflictKind::PathNotFound);
        assert_eq!(replica.snapshot(), &server_snapshot);
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_resync_is_idempotent() {
        let mut replica = synced_replica();
        replica
            .apply_local(Operation::new().insert(node("mine"), Value::map()))
            .unwrap();
        let theirs = Operation::new().insert(node("theirs"), Value::map());
        let committed = vec![CommittedOperation {
            revision: 6,
            operation: theirs.clone(),
            client_op_id: Uuid::new_v4(),
            author: None,
            conflicts: Vec::new(),
            partial: false,
        }];
        let server_snapshot = theirs.apply(&base()).unwrap();

        replica.resync(server_snapshot.clone(), 6, &committed);
        let once = (replica.snapshot().clone(), replica.revision(), replica.pending_len());
        replica.resync(server_snapshot, 6, &committed);
        let twice = (replica.snapshot().clone(), replica.revision(), replica.pending_len());
        assert_eq!(once, twice);
    }
}
