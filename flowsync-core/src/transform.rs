//! Transform engine.
//!
//! Rewrites an operation so that it applies after a concurrent one:
//!
//! ```text
//!            S
//!       A ╱     ╲ B
//!        ╱       ╲
//!    S·A           S·B
//!        ╲       ╱
//!  T(B,A,Later) ╲ ╱ T(A,B,Earlier)
//!            S'
//! ```
//!
//! `Side` records arrival order: the hub always transforms an incoming
//! operation with `Side::Later`, a replica transforms a committed remote
//! operation against its own pending work with `Side::Earlier`. Ties are
//! broken towards the earlier operation, so both orders converge.

use crate::error::OpError;
use crate::operation::{apply_component, Component, InsertPolicy, Operation};
use crate::value::{Path, PathSegment, Value};
use serde::{Deserialize, Serialize};

/// Arrival order of the operation being transformed, relative to the one
/// it is transformed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Earlier,
    Later,
}

impl Side {
    pub fn flip(self) -> Side {
        match self {
            Side::Earlier => Side::Later,
            Side::Later => Side::Earlier,
        }
    }
}

/// Why a component was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both sides inserted different values under the same key.
    DuplicateInsert,
    /// The edit addressed a subtree that was concurrently deleted or replaced.
    TargetRemoved,
    /// A concurrent replace of the same path won.
    Superseded,
    /// Apply-time: the path no longer resolves.
    PathNotFound,
    /// Apply-time: the expected value no longer matches.
    ConflictingExpectedValue,
}

/// A dropped component, reported back to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub path: Path,
    /// The value the dropped component would have written, if any.
    pub value: Option<Value>,
}

impl From<&OpError> for Conflict {
    fn from(err: &OpError) -> Self {
        let kind = match err {
            OpError::PathNotFound(_) => ConflictKind::PathNotFound,
            OpError::ConflictingExpectedValue(_) => ConflictKind::ConflictingExpectedValue,
        };
        Conflict {
            kind,
            path: err.path().clone(),
            value: None,
        }
    }
}

/// An operation rewritten past a concurrent one, plus what was lost.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transformed {
    pub operation: Operation,
    pub conflicts: Vec<Conflict>,
}

/// Rewrite `op` so it applies after `applied`.
pub fn transform(op: &Operation, applied: &Operation, side: Side) -> Transformed {
    transform_pair(op, applied, side).0
}

/// Rewrite both operations at once: `op` past `applied` (with `side`) and
/// `applied` past `op` (with the flipped side). Each side carries the
/// components it lost.
pub fn transform_pair(op: &Operation, applied: &Operation, side: Side) -> (Transformed, Transformed) {
    let mut ours = op.components.clone();
    let mut theirs = Vec::with_capacity(applied.components.len());
    let mut conflicts = Vec::new();
    let mut their_conflicts = Vec::new();

    for d in &applied.components {
        let mut current = Some(d.clone());
        let mut next = Vec::with_capacity(ours.len());

        for c in ours {
            let Some(d_now) = current.as_ref() else {
                next.push(c);
                continue;
            };
            let (c_out, conflict) = transform_component(&c, d_now, side);
            let (d_out, d_conflict) = transform_component(d_now, &c, side.flip());
            conflicts.extend(conflict);
            their_conflicts.extend(d_conflict);
            next.extend(c_out);
            current = d_out;
        }

        ours = next;
        theirs.extend(current);
    }

    (
        Transformed {
            operation: Operation::from_components(ours),
            conflicts,
        },
        Transformed {
            operation: Operation::from_components(theirs),
            conflicts: their_conflicts,
        },
    )
}

enum Outcome {
    Keep(Component),
    Drop(Option<Conflict>),
}

impl Outcome {
    fn into_parts(self) -> (Option<Component>, Option<Conflict>) {
        match self {
            Outcome::Keep(c) => (Some(c), None),
            Outcome::Drop(conflict) => (None, conflict),
        }
    }
}

/// Rewrite component `c` to apply after component `d`.
fn transform_component(c: &Component, d: &Component, side: Side) -> (Option<Component>, Option<Conflict>) {
    if let Some(outcome) = shift_sequence(c, d, side) {
        return outcome.into_parts();
    }

    let p = c.path();
    let q = d.path();

    let outcome = if p == q {
        same_path(c, d, side)
    } else if q.is_strict_prefix_of(p) {
        match d {
            Component::Delete { .. } | Component::Replace { .. } => {
                Outcome::Drop(Some(conflict(ConflictKind::TargetRemoved, c)))
            }
            Component::Insert { .. } => Outcome::Keep(c.clone()),
        }
    } else if p.is_strict_prefix_of(q) {
        Outcome::Keep(rebase_expected(c, d))
    } else {
        Outcome::Keep(c.clone())
    };

    outcome.into_parts()
}

/// Index adjustment when `d` inserts into or deletes from a sequence that
/// `c` addresses. `None` when `d` does not shift `c`'s path.
fn shift_sequence(c: &Component, d: &Component, side: Side) -> Option<Outcome> {
    let q = d.path();
    let j = match (d, q.last()) {
        (Component::Insert { .. } | Component::Delete { .. }, Some(PathSegment::Index(j))) => *j,
        _ => return None,
    };

    let p = c.path();
    let depth = q.len() - 1;
    if p.len() < q.len() || p.segments()[..depth] != q.segments()[..depth] {
        return None;
    }
    let i = p.segments()[depth].as_index()?;
    let same_level = p.len() == q.len();

    let outcome = match d {
        Component::Insert { .. } => {
            // same-index inserts: the later one moves right
            let stays = same_level && matches!(c, Component::Insert { .. }) && side == Side::Earlier;
            if i > j || (i == j && !stays) {
                Outcome::Keep(c.with_path(p.with_index_at(depth, i + 1)))
            } else {
                Outcome::Keep(c.clone())
            }
        }
        Component::Delete { .. } => {
            if i > j {
                Outcome::Keep(c.with_path(p.with_index_at(depth, i - 1)))
            } else if i < j {
                Outcome::Keep(c.clone())
            } else if same_level {
                match c {
                    Component::Insert { .. } => Outcome::Keep(c.clone()),
                    Component::Delete { .. } => Outcome::Drop(None),
                    Component::Replace { .. } => Outcome::Drop(Some(conflict(ConflictKind::TargetRemoved, c))),
                }
            } else {
                Outcome::Drop(Some(conflict(ConflictKind::TargetRemoved, c)))
            }
        }
        Component::Replace { .. } => return None,
    };
    Some(outcome)
}

fn same_path(c: &Component, d: &Component, side: Side) -> Outcome {
    let path = c.path().clone();
    match (c, d) {
        (Component::Insert { value: ours, .. }, Component::Insert { value: theirs, .. }) => {
            if ours == theirs {
                Outcome::Drop(None)
            } else if side == Side::Later {
                Outcome::Drop(Some(conflict(ConflictKind::DuplicateInsert, c)))
            } else {
                Outcome::Keep(Component::Replace {
                    path,
                    expected: theirs.clone(),
                    value: ours.clone(),
                })
            }
        }
        (Component::Delete { .. }, Component::Delete { .. }) => Outcome::Drop(None),
        (Component::Delete { .. }, Component::Replace { value: theirs, .. }) => Outcome::Keep(Component::Delete {
            path,
            expected: theirs.clone(),
        }),
        (Component::Replace { .. }, Component::Delete { .. }) => {
            Outcome::Drop(Some(conflict(ConflictKind::TargetRemoved, c)))
        }
        (Component::Replace { value: ours, .. }, Component::Replace { value: theirs, .. }) => {
            if ours == theirs {
                Outcome::Drop(None)
            } else if side == Side::Later {
                Outcome::Drop(Some(conflict(ConflictKind::Superseded, c)))
            } else {
                Outcome::Keep(Component::Replace {
                    path,
                    expected: theirs.clone(),
                    value: ours.clone(),
                })
            }
        }
        _ => Outcome::Keep(c.clone()),
    }
}

/// `c` deletes or replaces an ancestor of `d`'s path: fold `d` into the
/// expected value so the expectation still matches after `d`.
fn rebase_expected(c: &Component, d: &Component) -> Component {
    let Some(relative) = d.path().strip_prefix(c.path()) else {
        return c.clone();
    };
    let nested = d.with_path(relative);
    let rebase = |expected: &Value| {
        let mut next = expected.clone();
        match apply_component(&mut next, &nested, InsertPolicy::Strict) {
            Ok(()) => next,
            Err(_) => expected.clone(),
        }
    };

    match c {
        Component::Delete { path, expected } => Component::Delete {
            path: path.clone(),
            expected: rebase(expected),
        },
        Component::Replace {
            path,
            expected,
            value,
        } => Component::Replace {
            path: path.clone(),
            expected: rebase(expected),
            value: value.clone(),
        },
        Component::Insert { .. } => c.clone(),
    }
}

fn conflict(kind: ConflictKind, dropped: &Component) -> Conflict {
    let value = match dropped {
        Component::Insert { value, .. } | Component::Replace { value, .. } => Some(value.clone()),
        Component::Delete { .. } => None,
    };
    Conflict {
        kind,
        path: dropped.path().clone(),
        value,
    }
}
