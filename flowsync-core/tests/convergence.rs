//! Replicas driven through an in-test authority under interleaved
//! schedules must end up with the authoritative snapshot.

use flowsync_core::graph::{self, Edge, Node};
use flowsync_core::{
    transform, CommittedOperation, ConflictKind, DocumentReplica, InsertPolicy, Operation, Side,
    Submission, Value,
};
use std::collections::VecDeque;

/// Minimal authority: transform with `Side::Later`, apply, log.
struct Authority {
    snapshot: Value,
    log: Vec<CommittedOperation>,
}

impl Authority {
    fn new(snapshot: Value) -> Self {
        Self {
            snapshot,
            log: Vec::new(),
        }
    }

    fn submit(&mut self, submission: Submission) -> (CommittedOperation, Vec<ConflictKind>) {
        let mut op = submission.operation;
        let mut conflicts = Vec::new();
        for committed in &self.log[submission.base_revision as usize..] {
            let transformed = transform(&op, &committed.operation, Side::Later);
            conflicts.extend(transformed.conflicts.iter().map(|c| c.kind));
            op = transformed.operation;
        }

        let result = op.apply_divisible(&self.snapshot, InsertPolicy::Strict);
        assert!(result.dropped.is_empty(), "authority dropped {:?}", result.dropped);
        self.snapshot = result.snapshot;

        let committed = CommittedOperation {
            revision: self.log.len() as u64 + 1,
            operation: result.applied,
            client_op_id: submission.client_op_id,
            author: None,
            conflicts: Vec::new(),
            partial: false,
        };
        self.log.push(committed.clone());
        (committed, conflicts)
    }
}

fn deliver(replica: &mut DocumentReplica, committed: &CommittedOperation) {
    if replica.in_flight() == Some(committed.client_op_id) {
        replica.acknowledge(committed.client_op_id, committed.revision).unwrap();
    } else {
        replica.apply_remote(committed.revision, committed.operation.clone()).unwrap();
    }
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize
    }
}

fn local_edit(snapshot: &Value, client: usize, counter: usize, rng: &mut Lcg) -> Option<Operation> {
    let node_ids: Vec<String> = graph::nodes(snapshot).into_keys().collect();
    let edge_count = graph::edges(snapshot).len();
    let pick_node = |r: usize| node_ids.get(r % node_ids.len().max(1)).cloned();

    match rng.next() % 7 {
        0 => Some(graph::add_node(&format!("c{client}-{counter}"), &Node::new("new"))),
        1 => {
            let id = pick_node(rng.next())?;
            graph::set_text(snapshot, &id, &format!("t{}", rng.next() % 5))
        }
        2 => graph::remove_node(snapshot, &pick_node(rng.next())?),
        3 => {
            let edge = Edge {
                source: pick_node(rng.next()),
                target: pick_node(rng.next()).unwrap_or_else(|| "root".into()),
            };
            graph::connect(snapshot, &edge)
        }
        4 => graph::disconnect(snapshot, rng.next() % edge_count.max(1)),
        5 => {
            let edge = Edge {
                source: None,
                target: format!("c{client}"),
            };
            Some(Operation::new().insert(graph::edge_path(0), edge.to_value()))
        }
        _ => {
            let id = format!("c{client}-{counter}-linked");
            let edge = Edge {
                source: None,
                target: id.clone(),
            };
            Some(graph::add_node(&id, &Node::new("linked")).compose(graph::connect(snapshot, &edge)?))
        }
    }
}

fn run_schedule(seed: u64, clients: usize, steps: usize) {
    let mut rng = Lcg(seed);
    let mut authority = Authority::new(graph::empty_document());
    let mut replicas: Vec<_> = (0..clients)
        .map(|_| DocumentReplica::from_snapshot("doc", graph::empty_document(), 0))
        .collect();
    let mut inboxes: Vec<VecDeque<CommittedOperation>> = vec![VecDeque::new(); clients];
    let mut in_transit: VecDeque<Submission> = VecDeque::new();

    let pump = |replica: &mut DocumentReplica, in_transit: &mut VecDeque<Submission>| {
        if let Some(submission) = replica.take_submission() {
            in_transit.push_back(submission);
        }
    };

    for step in 0..steps {
        let client = rng.next() % clients;
        match rng.next() % 4 {
            0 | 1 => {
                let replica = &mut replicas[client];
                if let Some(op) = local_edit(replica.snapshot(), client, step, &mut rng) {
                    replica.apply_local(op).unwrap();
                }
                pump(replica, &mut in_transit);
            }
            2 => {
                if let Some(submission) = in_transit.pop_front() {
                    let (committed, _) = authority.submit(submission);
                    inboxes.iter_mut().for_each(|inbox| inbox.push_back(committed.clone()));
                }
            }
            _ => {
                if let Some(committed) = inboxes[client].pop_front() {
                    deliver(&mut replicas[client], &committed);
                    pump(&mut replicas[client], &mut in_transit);
                }
            }
        }
    }

    // drain
    loop {
        let mut progressed = false;
        while let Some(submission) = in_transit.pop_front() {
            let (committed, _) = authority.submit(submission);
            inboxes.iter_mut().for_each(|inbox| inbox.push_back(committed.clone()));
            progressed = true;
        }
        for (replica, inbox) in replicas.iter_mut().zip(inboxes.iter_mut()) {
            while let Some(committed) = inbox.pop_front() {
                deliver(replica, &committed);
                pump(replica, &mut in_transit);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    for (i, replica) in replicas.iter().enumerate() {
        assert_eq!(replica.pending_len(), 0, "seed {seed}: client {i} still has pending work");
        assert_eq!(replica.revision(), authority.log.len() as u64);
        assert_eq!(
            replica.snapshot(),
            &authority.snapshot,
            "seed {seed}: client {i} diverged"
        );
    }
}

#[test]
fn test_two_clients_interleaved() {
    for seed in 0..25 {
        run_schedule(seed, 2, 80);
    }
}

#[test]
fn test_four_clients_interleaved() {
    for seed in 100..115 {
        run_schedule(seed, 4, 150);
    }
}

#[test]
fn test_delete_vs_edit_scenario() {
    // revision 5, node a present
    let base = graph::add_node("a", &Node::new("x")).apply(&graph::empty_document()).unwrap();
    let mut authority = Authority::new(base.clone());
    for i in 0..5 {
        let noop = Submission {
            client_op_id: uuid::Uuid::new_v4(),
            base_revision: i,
            operation: Operation::new(),
        };
        authority.submit(noop);
    }

    let mut one = DocumentReplica::from_snapshot("doc", base.clone(), 5);
    let mut two = DocumentReplica::from_snapshot("doc", base.clone(), 5);
    one.apply_local(graph::remove_node(&base, "a").unwrap()).unwrap();
    two.apply_local(graph::set_text(&base, "a", "edited").unwrap()).unwrap();

    let first = one.take_submission().unwrap();
    let second = two.take_submission().unwrap();
    let (c1, conflicts1) = authority.submit(first);
    let (c2, conflicts2) = authority.submit(second);

    assert_eq!(c1.revision, 6);
    assert_eq!(c2.revision, 7);
    assert!(conflicts1.is_empty());
    assert_eq!(conflicts2, vec![ConflictKind::TargetRemoved]);

    for committed in [&c1, &c2] {
        deliver(&mut one, committed);
        deliver(&mut two, committed);
    }
    assert_eq!(one.snapshot(), &authority.snapshot);
    assert_eq!(two.snapshot(), &authority.snapshot);
    assert!(graph::nodes(&authority.snapshot).is_empty());
}

#[test]
fn test_concurrent_disjoint_inserts() {
    let mut authority = Authority::new(graph::empty_document());
    let mut one = DocumentReplica::from_snapshot("doc", graph::empty_document(), 0);
    let mut two = DocumentReplica::from_snapshot("doc", graph::empty_document(), 0);

    one.apply_local(graph::add_node("n1", &Node::new("one"))).unwrap();
    two.apply_local(graph::add_node("n2", &Node::new("two"))).unwrap();

    let (c1, _) = authority.submit(one.take_submission().unwrap());
    let (c2, _) = authority.submit(two.take_submission().unwrap());
    for committed in [&c1, &c2] {
        deliver(&mut one, committed);
        deliver(&mut two, committed);
    }

    assert_eq!(authority.log.len(), 2);
    let ids: Vec<_> = graph::nodes(&authority.snapshot).into_keys().collect();
    assert_eq!(ids, vec!["n1", "n2"]);
    assert_eq!(one.snapshot(), two.snapshot());
}
