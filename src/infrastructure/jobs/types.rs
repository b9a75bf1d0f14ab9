//! Core types of the job system

use crate::remote::client::RemoteItem;
use crate::shared::{NodeId, SyncError};

/// Unique identifier of a job within the engine's lifetime.
pub type JobId = u64;

/// What a finished job hands back to the executor.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    /// Metadata of the object created or replaced on the remote replica.
    pub remote_item: Option<RemoteItem>,
    /// Replica id of the object created on the local replica.
    pub local_id: Option<NodeId>,
    /// Creation time of the object written to the local replica.
    pub local_created_at: Option<i64>,
    /// Bytes moved by the job, for progress accounting.
    pub bytes: i64,
}

impl JobOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn remote(item: RemoteItem) -> Self {
        Self {
            bytes: item.size,
            remote_item: Some(item),
            ..Self::default()
        }
    }

    pub fn local(id: NodeId, bytes: i64) -> Self {
        Self {
            local_id: Some(id),
            bytes,
            ..Self::default()
        }
    }

    pub fn created_at(mut self, time: Option<i64>) -> Self {
        self.local_created_at = time;
        self
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone)]
pub enum JobResult {
    Done(JobOutput),
    /// Aborted before or during execution; no state was committed.
    Canceled,
    Failed(SyncError),
}

/// Message sent on the terminated-jobs queue when a job reaches a terminal
/// state.
#[derive(Debug)]
pub struct FinishedJob {
    pub job_id: JobId,
    pub result: JobResult,
}
