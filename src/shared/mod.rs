//! Shared primitives used across the engine

pub mod error;
pub mod types;
pub mod utils;

pub use error::{ExitCause, ExitCode, SyncError, SyncResult};
pub use types::{
    DbNodeId, Inconsistency, NodeId, NodeKind, NodeStatus, Op, OpSet, ReplicaSide, SyncTime,
};
