//! Operation model.
//!
//! An [`Operation`] is an ordered list of [`Component`] edits that is applied
//! exactly at a known base revision. Accepting one operation advances the
//! document by one revision, whatever the number of components.
//!
//! ```text
//!   snapshot@r ──apply(op)──▶ snapshot@r+1
//!        ▲                        │
//!        └──────apply(invert)─────┘
//! ```

use crate::error::OpError;
use crate::transform::Conflict;
use crate::value::{Path, PathSegment, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an insert behaves when its mapping key is already occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertPolicy {
    /// Occupied key is a `ConflictingExpectedValue` failure.
    #[default]
    Strict,
    /// Occupied key is overwritten.
    Overwrite,
}

/// A single edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Component {
    /// Add a value. At a sequence index later elements shift right.
    Insert { path: Path, value: Value },
    /// Remove a value that must currently equal `expected`.
    Delete { path: Path, expected: Value },
    /// Swap `expected` for `value` at the same path.
    Replace {
        path: Path,
        expected: Value,
        value: Value,
    },
}

impl Component {
    pub fn path(&self) -> &Path {
        match self {
            Component::Insert { path, .. }
            | Component::Delete { path, .. }
            | Component::Replace { path, .. } => path,
        }
    }

    pub(crate) fn with_path(&self, path: Path) -> Component {
        match self {
            Component::Insert { value, .. } => Component::Insert {
                path,
                value: value.clone(),
            },
            Component::Delete { expected, .. } => Component::Delete {
                path,
                expected: expected.clone(),
            },
            Component::Replace {
                expected, value, ..
            } => Component::Replace {
                path,
                expected: expected.clone(),
                value: value.clone(),
            },
        }
    }

    pub fn invert(&self) -> Component {
        match self {
            Component::Insert { path, value } => Component::Delete {
                path: path.clone(),
                expected: value.clone(),
            },
            Component::Delete { path, expected } => Component::Insert {
                path: path.clone(),
                value: expected.clone(),
            },
            Component::Replace {
                path,
                expected,
                value,
            } => Component::Replace {
                path: path.clone(),
                expected: value.clone(),
                value: expected.clone(),
            },
        }
    }
}

/// Ordered list of component edits.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Operation {
    pub components: Vec<Component>,
}

/// Result of a best-effort apply (see [`Operation::apply_divisible`]).
#[derive(Debug, Clone)]
pub struct DivisibleApply {
    pub snapshot: Value,
    /// The components that actually applied.
    pub applied: Operation,
    /// The components that were dropped, with the reason.
    pub dropped: Vec<(Component, OpError)>,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn insert(mut self, path: Path, value: impl Into<Value>) -> Self {
        self.components.push(Component::Insert {
            path,
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, path: Path, expected: impl Into<Value>) -> Self {
        self.components.push(Component::Delete {
            path,
            expected: expected.into(),
        });
        self
    }

    pub fn replace(mut self, path: Path, expected: impl Into<Value>, value: impl Into<Value>) -> Self {
        self.components.push(Component::Replace {
            path,
            expected: expected.into(),
            value: value.into(),
        });
        self
    }

    /// Bulk reset / import: replace the whole snapshot.
    pub fn replace_document(current: Value, replacement: Value) -> Self {
        Self::new().replace(Path::root(), current, replacement)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Concatenate `other` after `self`.
    pub fn compose(mut self, other: Operation) -> Operation {
        self.components.extend(other.components);
        self
    }

    /// The operation that undoes `self` when applied right after it.
    pub fn invert(&self) -> Operation {
        Operation {
            components: self.components.iter().rev().map(Component::invert).collect(),
        }
    }

    /// Apply atomically with [`InsertPolicy::Strict`].
    pub fn apply(&self, snapshot: &Value) -> Result<Value, OpError> {
        self.apply_with(snapshot, InsertPolicy::Strict)
    }

    /// Apply atomically: any failing component fails the whole operation
    /// and the input snapshot is untouched.
    pub fn apply_with(&self, snapshot: &Value, policy: InsertPolicy) -> Result<Value, OpError> {
        let mut next = snapshot.clone();
        for component in &self.components {
            apply_component(&mut next, component, policy)?;
        }
        Ok(next)
    }

    /// Apply component by component, dropping the ones that fail.
    pub fn apply_divisible(&self, snapshot: &Value, policy: InsertPolicy) -> DivisibleApply {
        let mut next = snapshot.clone();
        let mut applied = Vec::with_capacity(self.components.len());
        let mut dropped = Vec::new();

        for component in &self.components {
            match apply_component(&mut next, component, policy) {
                Ok(()) => applied.push(component.clone()),
                Err(e) => dropped.push((component.clone(), e)),
            }
        }

        DivisibleApply {
            snapshot: next,
            applied: Operation::from_components(applied),
            dropped,
        }
    }
}

/// Apply a single edit in place. On error `doc` is unchanged.
pub fn apply_component(doc: &mut Value, component: &Component, policy: InsertPolicy) -> Result<(), OpError> {
    let path = component.path();
    let Some(last) = path.last() else {
        return apply_at_root(doc, component, policy);
    };

    let parent_segments = &path.segments()[..path.len() - 1];
    let mut parent = doc;
    for segment in parent_segments {
        parent = parent
            .get_mut(segment)
            .ok_or_else(|| OpError::PathNotFound(path.clone()))?;
    }

    match (last, parent) {
        (PathSegment::Key(key), Value::Map(entries)) => match component {
            Component::Insert { value, .. } => {
                if entries.contains_key(key) && policy == InsertPolicy::Strict {
                    return Err(OpError::ConflictingExpectedValue(path.clone()));
                }
                entries.insert(key.clone(), value.clone());
                Ok(())
            }
            Component::Delete { expected, .. } => {
                let current = entries
                    .get(key)
                    .ok_or_else(|| OpError::PathNotFound(path.clone()))?;
                if current != expected {
                    return Err(OpError::ConflictingExpectedValue(path.clone()));
                }
                entries.remove(key);
                Ok(())
            }
            Component::Replace { expected, value, .. } => {
                let current = entries
                    .get_mut(key)
                    .ok_or_else(|| OpError::PathNotFound(path.clone()))?;
                if current != expected {
                    return Err(OpError::ConflictingExpectedValue(path.clone()));
                }
                *current = value.clone();
                Ok(())
            }
        },
        (PathSegment::Index(index), Value::Seq(items)) => {
            let index = *index;
            match component {
                Component::Insert { value, .. } => {
                    if index > items.len() {
                        return Err(OpError::PathNotFound(path.clone()));
                    }
                    items.insert(index, value.clone());
                    Ok(())
                }
                Component::Delete { expected, .. } => {
                    let current = items
                        .get(index)
                        .ok_or_else(|| OpError::PathNotFound(path.clone()))?;
                    if current != expected {
                        return Err(OpError::ConflictingExpectedValue(path.clone()));
                    }
                    items.remove(index);
                    Ok(())
                }
                Component::Replace { expected, value, .. } => {
                    let current = items
                        .get_mut(index)
                        .ok_or_else(|| OpError::PathNotFound(path.clone()))?;
                    if current != expected {
                        return Err(OpError::ConflictingExpectedValue(path.clone()));
                    }
                    *current = value.clone();
                    Ok(())
                }
            }
        }
        _ => Err(OpError::PathNotFound(path.clone())),
    }
}

fn apply_at_root(doc: &mut Value, component: &Component, policy: InsertPolicy) -> Result<(), OpError> {
    match component {
        Component::Insert { value, .. } => {
            if !doc.is_null() && policy == InsertPolicy::Strict {
                return Err(OpError::ConflictingExpectedValue(Path::root()));
            }
            *doc = value.clone();
        }
        Component::Delete { expected, .. } => {
            if doc != expected {
                return Err(OpError::ConflictingExpectedValue(Path::root()));
            }
            *doc = Value::Null;
        }
        Component::Replace { expected, value, .. } => {
            if doc != expected {
                return Err(OpError::ConflictingExpectedValue(Path::root()));
            }
            *doc = value.clone();
        }
    }
    Ok(())
}

/// An operation as recorded in a document's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOperation {
    /// Revision produced by this operation.
    pub revision: u64,
    pub operation: Operation,
    /// Id assigned by the submitting client; used for duplicate detection.
    pub client_op_id: Uuid,
    /// Identity of the submitter, when known.
    pub author: Option<String>,
    /// Components of the submitted operation that were dropped.
    pub conflicts: Vec<Conflict>,
    /// Some of the dropped components failed at apply time.
    pub partial: bool,
}

impl CommittedOperation {
    pub fn new(revision: u64, operation: Operation, client_op_id: Uuid) -> Self {
        Self {
            revision,
            operation,
            client_op_id,
            author: None,
            conflicts: Vec::new(),
            partial: false,
        }
    }
}
