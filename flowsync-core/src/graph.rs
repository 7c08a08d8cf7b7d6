//! Graph document helpers.
//!
//! The shared document is a flow graph:
//! ```text
//! {
//!   nodes: { <id>: { text: "...", ... } },
//!   edges: [ { source: <id> | null, target: <id> }, ... ]
//! }
//! ```
//! A `null` source marks a root edge. Removing a node does not cascade to
//! its edges. The builders below read the current snapshot to fill in the
//! expected values of deletes and replaces.

use crate::operation::Operation;
use crate::value::{Path, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NODES: &str = "nodes";
pub const EDGES: &str = "edges";

/// Snapshot of a newly created document.
pub fn empty_document() -> Value {
    Value::map().with(NODES, Value::map()).with(EDGES, Value::seq())
}

pub fn node_path(id: &str) -> Path {
    Path::root().key(NODES).key(id)
}

pub fn edge_path(index: usize) -> Path {
    Path::root().key(EDGES).index(index)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub text: String,
    /// Free-form attributes besides `text`.
    pub attributes: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut entries = self.attributes.clone();
        entries.insert("text".into(), Value::String(self.text.clone()));
        Value::Map(entries)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let mut attributes = value.as_map()?.clone();
        let text = match attributes.remove("text") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        Some(Self { text, attributes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// `None` for a root edge.
    pub source: Option<String>,
    pub target: String,
}

impl Edge {
    pub fn to_value(&self) -> Value {
        Value::map()
            .with("source", self.source.clone())
            .with("target", self.target.clone())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let entries = value.as_map()?;
        let target = entries.get("target")?.as_str()?.to_string();
        let source = entries.get("source").and_then(Value::as_str).map(str::to_string);
        Some(Self { source, target })
    }
}

/// All nodes of `doc`, keyed by id.
pub fn nodes(doc: &Value) -> BTreeMap<String, Node> {
    doc.at(&Path::root().key(NODES))
        .and_then(Value::as_map)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(id, v)| Node::from_value(v).map(|n| (id.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

/// All edges of `doc`, in order.
pub fn edges(doc: &Value) -> Vec<Edge> {
    doc.at(&Path::root().key(EDGES))
        .and_then(Value::as_seq)
        .map(|items| items.iter().filter_map(Edge::from_value).collect())
        .unwrap_or_default()
}

pub fn add_node(id: &str, node: &Node) -> Operation {
    Operation::new().insert(node_path(id), node.to_value())
}

/// `None` when the node does not exist.
pub fn remove_node(doc: &Value, id: &str) -> Option<Operation> {
    let current = doc.at(&node_path(id))?;
    Some(Operation::new().delete(node_path(id), current.clone()))
}

/// `None` when the node does not exist.
pub fn set_text(doc: &Value, id: &str, text: &str) -> Option<Operation> {
    doc.at(&node_path(id))?;
    let path = node_path(id).key("text");
    Some(match doc.at(&path) {
        Some(current) => Operation::new().replace(path, current.clone(), text),
        None => Operation::new().insert(path, text),
    })
}

/// Append an edge. `None` when `doc` has no edge sequence.
pub fn connect(doc: &Value, edge: &Edge) -> Option<Operation> {
    let len = doc.at(&Path::root().key(EDGES))?.as_seq()?.len();
    Some(Operation::new().insert(edge_path(len), edge.to_value()))
}

/// `None` when there is no edge at `index`.
pub fn disconnect(doc: &Value, index: usize) -> Option<Operation> {
    let current = doc.at(&edge_path(index))?;
    Some(Operation::new().delete(edge_path(index), current.clone()))
}

/// Replace the whole document, e.g. for an import.
pub fn reset(doc: &Value, replacement: Value) -> Operation {
    Operation::replace_document(doc.clone(), replacement)
}
