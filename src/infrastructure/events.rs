//! Event bus surfacing engine activity to the embedder

use crate::domain::ConflictKind;
use crate::shared::{DbNodeId, ExitCause, ExitCode, NodeId, NodeKind, ReplicaSide};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Direction of a file transfer as seen from the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Up,
    Down,
}

/// What the engine is doing to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInstruction {
    Get,
    Put,
    Update,
    Move,
    Remove,
}

/// Progress of a single file operation.
#[derive(Debug, Clone)]
pub struct ProgressItem {
    pub path: PathBuf,
    pub instruction: FileInstruction,
    pub direction: SyncDirection,
    pub size: i64,
    pub transferred: i64,
}

/// An unrecovered (or intentionally skipped) operation, surfaced to the UI.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub sync_pair_id: Uuid,
    /// Database row of the affected object, when one exists.
    pub db_id: Option<DbNodeId>,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub kind: Option<NodeKind>,
    pub path: PathBuf,
    pub conflict: Option<ConflictKind>,
    pub inconsistency: Option<crate::shared::Inconsistency>,
    /// Why the operation was skipped, for `ExitCause::OperationCanceled`
    /// records.
    pub cancel_reason: Option<String>,
    pub code: ExitCode,
    pub cause: ExitCause,
}

/// The step of a sync pass currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SyncStep {
    Idle,
    ComputeOps,
    UpdateTrees,
    ConsistencyCheck,
    ConflictFinding,
    ConflictResolution,
    OperationGeneration,
    OperationSorting,
    Propagation,
    Done,
}

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Paused,
    Resumed,
    Stopped,
    StepChanged {
        step: SyncStep,
    },
    Progress {
        item: ProgressItem,
    },
    FileCompleted {
        path: PathBuf,
        target_side: ReplicaSide,
        success: bool,
    },
    PassCompleted {
        /// Another pass starts immediately when set.
        restart: bool,
        executed_ops: u64,
    },
    Error(ErrorRecord),
}

/// Broadcast bus carrying [`SyncEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event; nothing happens when no one listens.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
