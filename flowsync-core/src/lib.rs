//! # flowsync-core
//!
//! Document model and operational-transform engine for collaborative graph
//! editing. No I/O lives here; the network and storage sides are in
//! `flowsync-collab`.
//!
//! ```text
//! value      Value / Path tree model
//! operation  Insert / Delete / Replace components, apply, invert
//! transform  concurrent-operation rewriting with conflict reports
//! replica    client copy: optimistic apply, pending queue, resync
//! graph      nodes / edges document helpers
//! ```

pub mod error;
pub mod graph;
pub mod operation;
pub mod replica;
pub mod transform;
pub mod value;

pub use error::{OpError, ReplicaError};
pub use operation::{apply_component, CommittedOperation, Component, DivisibleApply, InsertPolicy, Operation};
pub use replica::{DocumentReplica, PendingOperation, RemoteApply, ResyncOutcome, Submission};
pub use transform::{transform, transform_pair, Conflict, ConflictKind, Side, Transformed};
pub use value::{Path, PathSegment, Value};
