//! Data model shared by the pipeline steps

pub mod conflict;
pub mod snapshot;
pub mod sync_operation;
pub mod update_tree;

pub use conflict::{Conflict, ConflictKind, ConflictQueue};
pub use snapshot::{Snapshot, SnapshotItem};
pub use sync_operation::{OpDraft, OpId, SyncOperation, SyncOperationList};
pub use update_tree::{MoveOrigin, Node, NodeIdx, NodeRef, NodeSeed, TreePair, UpdateTree};
