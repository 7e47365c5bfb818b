//! Domain models for Ratchet.
//!
//! Canonical definitions for the core entities:
//! - `Operation`: immutable request to perform a state-changing action
//! - `Decision`: the constitution's answer for one operation
//! - `Snapshot` / `Patch`: agent content and the diffs between versions

pub mod decision;
pub mod digest;
pub mod error;
pub mod operation;
pub mod snapshot;

pub use decision::{ApprovalMethod, Decision};
pub use error::{RatchetError, Result};
pub use operation::{Actor, ActorOrigin, Operation, OperationBuilder, OperationKind};
pub use snapshot::{FileEdit, Patch, Snapshot};
