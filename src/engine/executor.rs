//! Step 8: execute the sorted operation list
//!
//! Each operation becomes either a synchronous action (directory creates,
//! local filesystem calls, DB-only updates) or an asynchronous job on the
//! bounded job manager (transfers and remote mutations). Completions drain
//! through the terminated-jobs channel; every committed operation updates
//! the database, the cache and the update trees before anything later can
//! read the rows it produced.

use super::reconcile::{corresponding_node, Snapshots};
use crate::config::SyncConfig;
use crate::domain::{NodeIdx, NodeRef, NodeSeed, OpId, SyncOperation, SyncOperationList, TreePair};
use crate::infrastructure::database::{DbCache, DbNode, InsertOutcome, SyncDb};
use crate::infrastructure::events::{
    ErrorRecord, EventBus, FileInstruction, ProgressItem, SyncDirection, SyncEvent,
};
use crate::infrastructure::jobs::{FinishedJob, JobId, JobManager, JobOutput, JobResult};
use crate::local::fs_ops;
use crate::local::snapshot::file_id_at;
use crate::remote::client::{DriveClient, RemoteItem, UploadSessionId};
use crate::shared::utils::conflicted_name;
use crate::shared::{
    ExitCause, ExitCode, NodeId, NodeKind, Op, ReplicaSide, SyncError, SyncResult,
};
use crate::vfs::{PinState, Vfs, VfsMode};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What the propagation step reports back to the pass.
#[derive(Debug, Default)]
pub struct ExecutorOutcome {
    pub executed: u64,
    pub restart: bool,
    pub invalidate_local_snapshot: bool,
    pub errors: Vec<ErrorRecord>,
}

/// Executes one pass's operation list.
pub struct Executor<'a> {
    pub ops: &'a mut SyncOperationList,
    pub trees: &'a mut TreePair,
    pub cache: &'a mut DbCache,
    pub db: &'a SyncDb,
    pub drive: Arc<dyn DriveClient>,
    pub vfs: Arc<dyn Vfs>,
    pub jobs: &'a JobManager,
    pub config: &'a SyncConfig,
    pub events: &'a EventBus,
    pub snapshots: Snapshots<'a>,
    pub tmp_blacklist: &'a mut HashSet<(ReplicaSide, NodeId)>,
    pub whitelist: &'a mut HashSet<(ReplicaSide, NodeId)>,
    pub stop: watch::Receiver<bool>,
}

/// What executing one operation produced.
enum Dispatch {
    /// Committed synchronously (or DB-only).
    Done,
    /// Running on the job manager.
    Queued(JobId),
    /// Intentionally skipped (placeholder rules, blacklisted source).
    Ignored,
}

impl<'a> Executor<'a> {
    pub async fn execute(mut self) -> SyncResult<ExecutorOutcome> {
        let mut outcome = ExecutorOutcome::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<FinishedJob>();
        let mut job_to_op: HashMap<JobId, OpId> = HashMap::new();
        let mut op_to_job: HashMap<OpId, JobId> = HashMap::new();
        let mut in_flight: HashSet<JobId> = HashSet::new();
        let mut pending: VecDeque<OpId> = self.ops.order().to_vec().into();
        let mut pruned: HashSet<OpId> = HashSet::new();

        self.init_progress();

        let result: SyncResult = 'pass: loop {
            // Drain completions first so later ops can read fresh rows.
            while let Ok(finished) = done_rx.try_recv() {
                in_flight.remove(&finished.job_id);
                if let Err(err) = self
                    .handle_finished_job(&finished, &job_to_op, &mut pending, &mut pruned, &mut outcome)
                    .await
                {
                    self.jobs.cancel_all();
                    break 'pass Err(err);
                }
                outcome.executed += 1;
            }

            if *self.stop.borrow() {
                info!("Stop requested, cancelling remaining operations");
                self.jobs.cancel_all();
                break Ok(());
            }

            let Some(&op_id) = pending.front() else {
                if in_flight.is_empty() {
                    break Ok(());
                }
                // All queued; wait for stragglers.
                match done_rx.recv().await {
                    Some(finished) => {
                        in_flight.remove(&finished.job_id);
                        if let Err(err) = self
                            .handle_finished_job(
                                &finished,
                                &job_to_op,
                                &mut pending,
                                &mut pruned,
                                &mut outcome,
                            )
                            .await
                        {
                            self.jobs.cancel_all();
                            break Err(err);
                        }
                        outcome.executed += 1;
                        continue;
                    }
                    None => break Ok(()),
                }
            };

            if pruned.contains(&op_id) {
                pending.pop_front();
                if let Some(op) = self.ops.get(op_id).cloned() {
                    self.record_canceled(&op, "dependent of a failed operation", &mut outcome);
                    self.complete_progress(&op, false);
                }
                continue;
            }

            // Back off while the manager is saturated.
            if self.jobs.saturated() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }

            // A synchronous op whose parent job is still running must wait.
            let parent_job = self
                .ops
                .get(op_id)
                .and_then(|op| op.parent_op)
                .and_then(|parent| op_to_job.get(&parent).copied());
            if let Some(parent_job) = parent_job {
                if in_flight.contains(&parent_job) {
                    match done_rx.recv().await {
                        Some(finished) => {
                            in_flight.remove(&finished.job_id);
                            if let Err(err) = self
                                .handle_finished_job(
                                    &finished,
                                    &job_to_op,
                                    &mut pending,
                                    &mut pruned,
                                    &mut outcome,
                                )
                                .await
                            {
                                self.jobs.cancel_all();
                                break Err(err);
                            }
                            outcome.executed += 1;
                        }
                        None => break Ok(()),
                    }
                    continue;
                }
            }

            pending.pop_front();
            let Some(op) = self.ops.get(op_id).cloned() else {
                continue;
            };

            let dispatched = self.dispatch(&op, parent_job, done_tx.clone()).await;
            match dispatched {
                Ok(Dispatch::Done) => {
                    outcome.executed += 1;
                    self.complete_progress(&op, true);
                }
                Ok(Dispatch::Ignored) => {
                    self.complete_progress(&op, true);
                }
                Ok(Dispatch::Queued(job_id)) => {
                    job_to_op.insert(job_id, op_id);
                    op_to_job.insert(op_id, job_id);
                    in_flight.insert(job_id);
                }
                Err(err) => {
                    match self
                        .handle_operation_error(&op, err, &mut pending, &mut pruned, &mut outcome)
                        .await
                    {
                        Ok(()) => self.complete_progress(&op, false),
                        Err(err) => {
                            self.jobs.cancel_all();
                            break Err(err);
                        }
                    }
                }
            }
        };

        // Drain whatever is still in flight after a cancel or an abort.
        while !in_flight.is_empty() {
            match done_rx.recv().await {
                Some(finished) => {
                    in_flight.remove(&finished.job_id);
                    if result.is_ok() {
                        let _ = self
                            .handle_finished_job(
                                &finished,
                                &job_to_op,
                                &mut pending,
                                &mut pruned,
                                &mut outcome,
                            )
                            .await;
                    }
                }
                None => break,
            }
        }
        self.jobs.clear_statuses();
        let _ = self.vfs.clean_up_statuses().await;

        if outcome.executed > self.config.snapshot_invalidation_threshold {
            info!("Too many executed changes, forcing a local rescan next pass");
            outcome.invalidate_local_snapshot = true;
        }

        result.map(|()| outcome)
    }

    // ---- dispatch -------------------------------------------------------

    async fn dispatch(
        &mut self,
        op: &SyncOperation,
        parent_job: Option<JobId>,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> SyncResult<Dispatch> {
        if op.omit {
            self.propagate(op, None).await?;
            return Ok(Dispatch::Done);
        }
        self.emit_progress(op);

        match (op.op_type, op.target_side) {
            (Op::Create, ReplicaSide::Remote) => self.create_remote(op, parent_job, done).await,
            (Op::Create, ReplicaSide::Local) => self.create_local(op, parent_job, done).await,
            (Op::Edit, ReplicaSide::Remote) => self.edit_remote(op, parent_job, done).await,
            (Op::Edit, ReplicaSide::Local) => self.edit_local(op, parent_job, done),
            (Op::Move, _) => {
                self.do_move(op).await?;
                Ok(Dispatch::Done)
            }
            (Op::Delete, _) => {
                self.do_delete(op).await?;
                Ok(Dispatch::Done)
            }
        }
    }

    async fn create_remote(
        &mut self,
        op: &SyncOperation,
        parent_job: Option<JobId>,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> SyncResult<Dispatch> {
        let node = self.trees.node(op.affected);
        let name = node.name.clone();
        let kind = node.kind;
        let mtime = node.modified_at.unwrap_or(0);
        let relative = self.trees.path_of(op.affected);
        let parent_id = self.remote_parent_id(op.affected)?;

        if kind == NodeKind::Directory {
            // Fast path: later operations need the new directory's id.
            let item = self
                .drive
                .create_dir(&parent_id, &name)
                .await
                .map_err(SyncError::from)?;
            self.propagate(op, Some(JobOutput::remote(item))).await?;
            return Ok(Dispatch::Done);
        }

        if self.vfs.mode() == VfsMode::On {
            let status = self.vfs.status(&relative).await?;
            if status.is_dehydrated_placeholder() {
                // Never upload a file whose bytes are not on disk.
                debug!(path = %relative.display(), "Dehydrated placeholder, upload skipped");
                return Ok(Dispatch::Ignored);
            }
        }

        let absolute = self.config.absolute_local(&relative);
        let job = upload_job(
            self.drive.clone(),
            absolute,
            parent_id,
            name,
            mtime,
            self.config.upload_session_threshold,
            self.config.upload_chunk_size,
            self.config.max_parallel_chunks,
        );
        Ok(Dispatch::Queued(self.jobs.queue(parent_job, job, done)))
    }

    async fn create_local(
        &mut self,
        op: &SyncOperation,
        parent_job: Option<JobId>,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> SyncResult<Dispatch> {
        let node = self.trees.node(op.affected);
        let kind = node.kind;
        let size = node.size;
        let mtime = node.modified_at.unwrap_or(0);
        let remote_id = node.id.clone().ok_or_else(SyncError::data)?;
        let relative = self.local_destination(op)?;
        let absolute = self.config.absolute_local(&relative);

        if kind == NodeKind::Directory {
            fs_ops::create_dir(&absolute).await?;
            if self.vfs.mode() == VfsMode::On {
                self.vfs.convert_to_placeholder(&relative, true).await?;
            }
            let created = fs_ops::created_at_of(&absolute);
            let local_id = file_id_at(&absolute).ok_or_else(SyncError::data)?;
            self.propagate(op, Some(JobOutput::local(local_id, 0).created_at(created)))
                .await?;
            return Ok(Dispatch::Done);
        }

        if self.vfs.mode() == VfsMode::On {
            let pin = self.vfs.pin_state(&relative).await?;
            if pin != PinState::AlwaysLocal {
                // Large files start dehydrated: a placeholder advertises the
                // size without downloading a byte.
                self.vfs.create_placeholder(&relative, size, mtime).await?;
                let created = fs_ops::created_at_of(&absolute);
                let local_id = file_id_at(&absolute)
                    .unwrap_or_else(|| format!("placeholder-{remote_id}"));
                self.propagate(op, Some(JobOutput::local(local_id, 0).created_at(created)))
                    .await?;
                return Ok(Dispatch::Done);
            }
        }

        let drive = self.drive.clone();
        let vfs = self.vfs.clone();
        let job = async move {
            let data = drive.download(&remote_id).await.map_err(SyncError::from)?;
            fs_ops::write_file(&absolute, &data).await?;
            fs_ops::set_mtime(&absolute, mtime).await?;
            if vfs.mode() == VfsMode::On {
                // Pinned always-local: record the hydrated state.
                vfs.force_status(
                    &relative,
                    crate::vfs::VfsStatus {
                        is_placeholder: true,
                        is_hydrated: true,
                        is_syncing: false,
                    },
                )
                .await?;
            }
            let created = fs_ops::created_at_of(&absolute);
            let local_id = file_id_at(&absolute).ok_or_else(SyncError::data)?;
            let bytes = data.len() as i64;
            Ok(JobOutput::local(local_id, bytes).created_at(created))
        };
        Ok(Dispatch::Queued(self.jobs.queue(parent_job, job, done)))
    }

    async fn edit_remote(
        &mut self,
        op: &SyncOperation,
        parent_job: Option<JobId>,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> SyncResult<Dispatch> {
        let relative = self.trees.path_of(op.affected);
        if self.vfs.mode() == VfsMode::On {
            let status = self.vfs.status(&relative).await?;
            if status.is_dehydrated_placeholder() {
                // No bytes to upload; realign the stored modtime so the edit
                // does not fire again next pass.
                let node = self.trees.node(op.affected);
                if let Some(db_id) = super::reconcile::db_id_of(self.trees, self.cache, op.affected)
                {
                    let mtime = node.modified_at;
                    self.cache.apply(db_id, |row| row.last_mod_local = mtime);
                    if let Some(row) = self.cache.node(db_id).cloned() {
                        self.db.update_node(&row).await?;
                    }
                }
                debug!(path = %relative.display(), "Dehydrated placeholder, edit upload skipped");
                return Ok(Dispatch::Ignored);
            }
        }

        let node = self.trees.node(op.affected);
        let name = node.name.clone();
        let mtime = node.modified_at.unwrap_or(0);
        let parent_id = self.remote_parent_id(op.affected)?;
        let absolute = self.config.absolute_local(&relative);
        let job = upload_job(
            self.drive.clone(),
            absolute,
            parent_id,
            name,
            mtime,
            self.config.upload_session_threshold,
            self.config.upload_chunk_size,
            self.config.max_parallel_chunks,
        );
        Ok(Dispatch::Queued(self.jobs.queue(parent_job, job, done)))
    }

    fn edit_local(
        &mut self,
        op: &SyncOperation,
        parent_job: Option<JobId>,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> SyncResult<Dispatch> {
        let corresponding = op.corresponding.ok_or_else(SyncError::data)?;
        let remote_id = self
            .trees
            .node(op.affected)
            .id
            .clone()
            .ok_or_else(SyncError::data)?;
        let relative = self.trees.path_of(corresponding);
        let absolute = self.config.absolute_local(&relative);
        let mtime = self.trees.node(op.affected).modified_at.unwrap_or(0);

        let drive = self.drive.clone();
        let job = async move {
            let data = drive.download(&remote_id).await.map_err(SyncError::from)?;
            fs_ops::write_file(&absolute, &data).await?;
            fs_ops::set_mtime(&absolute, mtime).await?;
            let created = fs_ops::created_at_of(&absolute);
            let local_id = file_id_at(&absolute).ok_or_else(SyncError::data)?;
            let bytes = data.len() as i64;
            Ok(JobOutput::local(local_id, bytes).created_at(created))
        };
        Ok(Dispatch::Queued(self.jobs.queue(parent_job, job, done)))
    }

    async fn do_move(&mut self, op: &SyncOperation) -> SyncResult<()> {
        let corresponding = op.corresponding.ok_or_else(SyncError::data)?;
        let new_name = op
            .new_name
            .clone()
            .unwrap_or_else(|| self.trees.node(op.affected).name.clone());

        match op.target_side {
            ReplicaSide::Local => {
                let origin_relative = self.trees.path_of(corresponding);
                let destination_relative = if op.rescue {
                    self.rescue_destination(&new_name).await?
                } else {
                    self.move_destination(op, &new_name)?
                };
                fs_ops::rename(
                    &self.config.absolute_local(&origin_relative),
                    &self.config.absolute_local(&destination_relative),
                )
                .await?;
            }
            ReplicaSide::Remote => {
                let remote_node = self.trees.node(corresponding);
                let remote_id = remote_node.id.clone().ok_or_else(SyncError::data)?;
                let destination_parent = self.remote_move_parent(op)?;
                let parent_changed = {
                    let tree = self.trees.tree(corresponding.side);
                    let current_parent = tree
                        .node(corresponding.idx)
                        .parent()
                        .and_then(|p| tree.node(p).id.clone());
                    current_parent.as_ref() != Some(&destination_parent)
                };
                if parent_changed {
                    self.drive
                        .move_item(&remote_id, &destination_parent, &new_name)
                        .await
                        .map_err(SyncError::from)?;
                } else {
                    self.drive
                        .rename_item(&remote_id, &new_name)
                        .await
                        .map_err(SyncError::from)?;
                }
            }
        }
        self.propagate(op, None).await
    }

    async fn do_delete(&mut self, op: &SyncOperation) -> SyncResult<()> {
        let corresponding = op.corresponding.ok_or_else(SyncError::data)?;
        match op.target_side {
            ReplicaSide::Local => {
                let relative = self.trees.path_of(corresponding);
                if op.dehydrated_placeholder {
                    // There is no file data on disk to preserve.
                    debug!(path = %relative.display(), "Deleting dehydrated placeholder");
                }
                fs_ops::remove(&self.config.absolute_local(&relative)).await?;
            }
            ReplicaSide::Remote => {
                let remote_id = self
                    .trees
                    .node(corresponding)
                    .id
                    .clone()
                    .ok_or_else(SyncError::data)?;
                self.drive
                    .delete_item(&remote_id)
                    .await
                    .map_err(SyncError::from)?;
            }
        }
        self.propagate(op, None).await
    }

    // ---- path & id resolution ------------------------------------------

    fn remote_parent_id(&self, affected: NodeRef) -> SyncResult<NodeId> {
        let tree = self.trees.tree(affected.side);
        let Some(parent_idx) = tree.node(affected.idx).parent() else {
            return Err(SyncError::data());
        };
        if parent_idx == tree.root() {
            return self
                .cache
                .node(self.cache.root_db_id())
                .and_then(|row| row.remote_id.clone())
                .ok_or_else(SyncError::data);
        }
        let parent_ref = NodeRef {
            side: affected.side,
            idx: parent_idx,
        };
        if affected.side == ReplicaSide::Remote {
            return tree.node(parent_idx).id.clone().ok_or_else(SyncError::data);
        }
        corresponding_node(self.trees, self.cache, parent_ref)
            .and_then(|corresponding| self.trees.node(corresponding).id.clone())
            .ok_or_else(SyncError::data)
    }

    /// Local path where a create lands: the corresponding parent's path
    /// plus the item name.
    fn local_destination(&self, op: &SyncOperation) -> SyncResult<PathBuf> {
        let tree = self.trees.tree(op.affected.side);
        let node = tree.node(op.affected.idx);
        let Some(parent_idx) = node.parent() else {
            return Err(SyncError::data());
        };
        let parent_path = if parent_idx == tree.root() {
            PathBuf::new()
        } else {
            let parent_ref = NodeRef {
                side: op.affected.side,
                idx: parent_idx,
            };
            let corresponding = corresponding_node(self.trees, self.cache, parent_ref)
                .ok_or_else(SyncError::data)?;
            self.trees.path_of(corresponding)
        };
        Ok(crate::shared::utils::join_name(&parent_path, &node.name))
    }

    fn move_destination(&self, op: &SyncOperation, new_name: &str) -> SyncResult<PathBuf> {
        if let Some(destination) = &op.relative_destination_path {
            return Ok(destination.clone());
        }
        let parent_path = match op.new_parent {
            Some(parent) => self.trees.path_of(parent),
            None => {
                let tree = self.trees.tree(op.affected.side);
                let parent_idx = tree
                    .node(op.affected.idx)
                    .parent()
                    .ok_or_else(SyncError::data)?;
                if parent_idx == tree.root() {
                    PathBuf::new()
                } else {
                    let corresponding = corresponding_node(
                        self.trees,
                        self.cache,
                        NodeRef {
                            side: op.affected.side,
                            idx: parent_idx,
                        },
                    )
                    .ok_or_else(SyncError::data)?;
                    self.trees.path_of(corresponding)
                }
            }
        };
        Ok(crate::shared::utils::join_name(&parent_path, new_name))
    }

    fn remote_move_parent(&self, op: &SyncOperation) -> SyncResult<NodeId> {
        if let Some(parent) = op.new_parent {
            if parent.idx == self.trees.tree(parent.side).root() {
                return self
                    .cache
                    .node(self.cache.root_db_id())
                    .and_then(|row| row.id(parent.side).cloned())
                    .ok_or_else(SyncError::data);
            }
            return self
                .trees
                .node(parent)
                .id
                .clone()
                .ok_or_else(SyncError::data);
        }
        self.remote_parent_id(op.affected)
    }

    /// Destination inside the lazily created rescue folder, suffixed when
    /// the name is already taken.
    async fn rescue_destination(&self, name: &str) -> SyncResult<PathBuf> {
        let rescue_root = self.config.rescue_dir();
        fs_ops::create_dir(&rescue_root).await?;
        let relative_root = PathBuf::from(self.config.rescue_dir_name());
        let plain = relative_root.join(name);
        if !tokio::fs::try_exists(self.config.absolute_local(&plain))
            .await
            .map_err(SyncError::from)?
        {
            return Ok(plain);
        }
        let suffixed = relative_root.join(conflicted_name(name, chrono::Utc::now()));
        Ok(suffixed)
    }

    // ---- propagation to DB and trees -----------------------------------

    async fn propagate(&mut self, op: &SyncOperation, output: Option<JobOutput>) -> SyncResult<()> {
        if !self.propagate_conflict(op).await? {
            return Ok(());
        }
        match op.op_type {
            Op::Create => self.propagate_create(op, output).await,
            Op::Edit => self.propagate_edit(op, output).await,
            Op::Move => self.propagate_move(op).await,
            Op::Delete => self.propagate_delete(op).await,
        }
    }

    /// Conflict-resolution operations rewrite the database differently from
    /// plain operations. Returns `false` when normal propagation must be
    /// skipped.
    async fn propagate_conflict(&mut self, op: &SyncOperation) -> SyncResult<bool> {
        use crate::domain::ConflictKind;
        let Some(conflict) = op.conflict else {
            return Ok(true);
        };
        match conflict.kind {
            // Name-clash patterns: the local loser leaves the database so
            // both versions re-enter the sync as new objects next pass.
            ConflictKind::EditEdit
            | ConflictKind::CreateCreate
            | ConflictKind::MoveCreate
            | ConflictKind::MoveMoveDest
            | ConflictKind::MoveMoveSource => {
                if conflict.kind != ConflictKind::MoveMoveSource {
                    if let Some(db_id) =
                        super::reconcile::db_id_of(self.trees, self.cache, conflict.local())
                    {
                        self.db.delete_node(db_id).await?;
                        self.cache.remove_subtree(db_id);
                    }
                }
                let local = conflict.local();
                let remote = conflict.remote();
                self.trees.local.remove_subtree(local.idx);
                self.trees.remote.remove_subtree(remote.idx);
                Ok(false)
            }
            ConflictKind::EditDelete => {
                // Delete operations follow the normal path (drop the row);
                // rescue moves leave the database alone.
                Ok(op.op_type == Op::Delete)
            }
            _ => Ok(true),
        }
    }

    async fn propagate_create(
        &mut self,
        op: &SyncOperation,
        output: Option<JobOutput>,
    ) -> SyncResult<()> {
        let affected = self.trees.node(op.affected).clone();
        let affected_id = affected.id.clone().ok_or_else(SyncError::data)?;

        // Per-side identities and timestamps of the freshly agreed object.
        let (local_id, remote_id, remote_item, local_created_at) =
            match (op.affected.side, output) {
                (ReplicaSide::Local, Some(output)) => {
                    let item = output.remote_item.ok_or_else(SyncError::data)?;
                    (
                        Some(affected_id.clone()),
                        Some(item.id.clone()),
                        Some(item),
                        affected.created_at,
                    )
                }
                (ReplicaSide::Remote, Some(output)) => {
                    let local = output.local_id.clone().ok_or_else(SyncError::data)?;
                    (
                        Some(local),
                        Some(affected_id.clone()),
                        None,
                        output.local_created_at,
                    )
                }
                (side, None) => {
                    // Pseudo conflict: both sides already hold the object.
                    let corresponding = op.corresponding.ok_or_else(SyncError::data)?;
                    let other = self.trees.node(corresponding).clone();
                    let other_id = other.id.clone().ok_or_else(SyncError::data)?;
                    match side {
                        ReplicaSide::Local => (
                            Some(affected_id.clone()),
                            Some(other_id),
                            None,
                            affected.created_at,
                        ),
                        ReplicaSide::Remote => (
                            Some(other_id),
                            Some(affected_id.clone()),
                            None,
                            other.created_at,
                        ),
                    }
                }
            };

        let corresponding_times = op.corresponding.map(|corresponding| {
            let node = self.trees.node(corresponding);
            (node.created_at, node.modified_at)
        });
        let (created_at_remote, last_mod_local, last_mod_remote) = match op.affected.side {
            ReplicaSide::Local => (
                remote_item
                    .as_ref()
                    .map(|item| item.created_at)
                    .or(corresponding_times.and_then(|(created, _)| created)),
                affected.modified_at,
                remote_item
                    .as_ref()
                    .map(|item| item.modified_at)
                    .or(corresponding_times.and_then(|(_, modified)| modified))
                    .or(affected.modified_at),
            ),
            ReplicaSide::Remote => {
                let other_mod = corresponding_times
                    .and_then(|(_, modified)| modified)
                    .or(affected.modified_at);
                (affected.created_at, other_mod, affected.modified_at)
            }
        };

        let parent_db_id = self.parent_db_id(op.affected)?;
        let checksum = affected
            .id
            .as_ref()
            .and_then(|id| self.snapshots.side(op.affected.side).item(id))
            .and_then(|item| item.checksum.clone())
            .or_else(|| {
                remote_item
                    .as_ref()
                    .and_then(|item| item.checksum.clone())
            });
        let row = DbNode {
            db_id: 0,
            parent_db_id: Some(parent_db_id),
            local_id,
            remote_id,
            local_name: affected.name.clone(),
            remote_name: affected.name.clone(),
            kind: affected.kind,
            size: remote_item.as_ref().map(|item| item.size).unwrap_or(affected.size),
            created_at_local: local_created_at,
            created_at_remote,
            last_mod_local,
            last_mod_remote,
            checksum,
            syncing: false,
        };

        let db_id = match self.db.insert_node(&row).await? {
            InsertOutcome::Inserted(db_id) => db_id,
            InsertOutcome::UniqueViolation => {
                // A stale row still holds one of these replica ids: an
                // undetected delete-then-create. Drop it and retry.
                warn!(name = %row.local_name, "Duplicate replica id on insert, dropping stale row");
                self.drop_stale_rows(&row).await?;
                match self.db.insert_node(&row).await? {
                    InsertOutcome::Inserted(db_id) => db_id,
                    InsertOutcome::UniqueViolation => return Err(SyncError::db()),
                }
            }
        };
        self.cache.insert(DbNode { db_id, ..row.clone() });
        self.trees.node_mut(op.affected).db_id = Some(db_id);

        if !op.omit {
            // Mirror the new object into the target tree so child operations
            // of this pass can resolve their parent.
            let target_id = self
                .cache
                .node(db_id)
                .and_then(|r| r.id(op.target_side).cloned())
                .ok_or_else(SyncError::data)?;
            self.insert_target_node(op, db_id, target_id)?;
        } else if let Some(corresponding) = op.corresponding {
            self.trees.node_mut(corresponding).db_id = Some(db_id);
        }
        self.maintain_whitelist(op);
        Ok(())
    }

    async fn drop_stale_rows(&mut self, row: &DbNode) -> SyncResult<()> {
        for (side, id) in [
            (ReplicaSide::Local, row.local_id.clone()),
            (ReplicaSide::Remote, row.remote_id.clone()),
        ] {
            let Some(id) = id else { continue };
            if let Some(stale) = self.cache.db_id(side, &id) {
                self.db.delete_node(stale).await?;
                self.cache.remove_subtree(stale);
            }
        }
        // The filesystem drifted from what the pass believed.
        Ok(())
    }

    fn insert_target_node(
        &mut self,
        op: &SyncOperation,
        db_id: i64,
        target_id: NodeId,
    ) -> SyncResult<()> {
        let affected = self.trees.node(op.affected).clone();
        let parent_idx = self.target_parent_idx(op)?;
        let tree = self.trees.tree_mut(op.target_side);
        let seed = NodeSeed::new(affected.name.clone(), affected.kind)
            .id(target_id)
            .db_id(db_id)
            .size(affected.size);
        tree.insert(seed, parent_idx).ok_or_else(SyncError::data)?;
        Ok(())
    }

    fn target_parent_idx(&self, op: &SyncOperation) -> SyncResult<NodeIdx> {
        let tree = self.trees.tree(op.affected.side);
        let Some(parent_idx) = tree.node(op.affected.idx).parent() else {
            return Err(SyncError::data());
        };
        if parent_idx == tree.root() {
            return Ok(self.trees.tree(op.target_side).root());
        }
        corresponding_node(
            self.trees,
            self.cache,
            NodeRef {
                side: op.affected.side,
                idx: parent_idx,
            },
        )
        .map(|corresponding| corresponding.idx)
        .ok_or_else(SyncError::data)
    }

    async fn propagate_edit(
        &mut self,
        op: &SyncOperation,
        output: Option<JobOutput>,
    ) -> SyncResult<()> {
        let db_id = super::reconcile::db_id_of(self.trees, self.cache, op.affected)
            .ok_or_else(SyncError::data)?;
        let affected = self.trees.node(op.affected).clone();
        let item = affected
            .id
            .as_ref()
            .and_then(|id| self.snapshots.side(op.affected.side).item(id))
            .cloned();
        let remote_item = output.as_ref().and_then(|o| o.remote_item.clone());
        let new_local_id = output.as_ref().and_then(|o| o.local_id.clone());

        let local_created_at = output.as_ref().and_then(|o| o.local_created_at);
        let fresh_checksum = item
            .as_ref()
            .and_then(|item| item.checksum.clone())
            .or_else(|| remote_item.as_ref().and_then(|item| item.checksum.clone()));
        self.cache.apply(db_id, |row| {
            row.size = affected.size;
            row.set_created_at(op.affected.side, affected.created_at);
            if op.omit {
                if fresh_checksum.is_some() {
                    row.checksum = fresh_checksum.clone();
                }
            } else {
                // The content changed: a stale digest must not survive.
                row.checksum = fresh_checksum.clone();
            }
            row.set_last_mod(op.affected.side, affected.modified_at);
            if op.omit {
                return;
            }
            match op.target_side {
                ReplicaSide::Local => {
                    row.last_mod_local = affected.modified_at;
                    if local_created_at.is_some() {
                        row.created_at_local = local_created_at;
                    }
                    if let Some(id) = new_local_id.clone() {
                        row.local_id = Some(id);
                    }
                }
                ReplicaSide::Remote => {
                    row.last_mod_remote = remote_item
                        .as_ref()
                        .map(|i| i.modified_at)
                        .or(affected.modified_at);
                    if let Some(item) = &remote_item {
                        row.created_at_remote = Some(item.created_at);
                        row.remote_id = Some(item.id.clone());
                    }
                }
            }
        });
        let row = self.cache.node(db_id).cloned().ok_or_else(SyncError::data)?;
        self.db.update_node(&row).await?;

        // The replica id may have changed with the new content.
        if !op.omit {
            if let Some(corresponding) = op.corresponding {
                let new_id = match op.target_side {
                    ReplicaSide::Local => new_local_id,
                    ReplicaSide::Remote => remote_item.map(|item| item.id),
                };
                if let Some(new_id) = new_id {
                    let tree = self.trees.tree_mut(op.target_side);
                    if tree.node(corresponding.idx).id.as_ref() != Some(&new_id) {
                        tree.set_node_id(corresponding.idx, new_id);
                    }
                }
            }
        }
        self.maintain_whitelist(op);
        Ok(())
    }

    async fn propagate_move(&mut self, op: &SyncOperation) -> SyncResult<()> {
        if op.rescue {
            // The rescued copy lives outside the synchronized tree now; its
            // row (if any) goes away and the delete propagates next pass.
            if let Some(db_id) = super::reconcile::db_id_of(self.trees, self.cache, op.affected) {
                self.db.delete_node(db_id).await?;
                self.cache.remove_subtree(db_id);
            }
            if let Some(corresponding) = op.corresponding {
                if corresponding != op.affected {
                    self.trees
                        .tree_mut(corresponding.side)
                        .remove_subtree(corresponding.idx);
                }
            }
            self.trees
                .tree_mut(op.affected.side)
                .remove_subtree(op.affected.idx);
            return Ok(());
        }

        let db_id = super::reconcile::db_id_of(self.trees, self.cache, op.affected)
            .ok_or_else(SyncError::data)?;
        let new_name = op
            .new_name
            .clone()
            .unwrap_or_else(|| self.trees.node(op.affected).name.clone());
        let parent_db_id = match op.new_parent {
            Some(parent) => {
                let tree = self.trees.tree(parent.side);
                if parent.idx == tree.root() {
                    self.cache.root_db_id()
                } else {
                    super::reconcile::db_id_of(self.trees, self.cache, parent)
                        .ok_or_else(SyncError::data)?
                }
            }
            None => self.parent_db_id(op.affected)?,
        };

        let affected_name = self.trees.node(op.affected).name.clone();
        self.cache.apply(db_id, |row| {
            row.parent_db_id = Some(parent_db_id);
            row.set_name(op.affected.side, affected_name.clone());
            row.set_name(op.target_side, new_name.clone());
        });
        let row = self.cache.node(db_id).cloned().ok_or_else(SyncError::data)?;
        self.db.update_node(&row).await?;

        // Rewire the target tree to mirror the applied move.
        if let Some(corresponding) = op.corresponding {
            let parent_idx = match op.new_parent {
                Some(parent) if parent.side == op.target_side => parent.idx,
                _ => self.target_parent_idx(op)?,
            };
            let tree = self.trees.tree_mut(op.target_side);
            if !tree.rewire(corresponding.idx, parent_idx, Some(&new_name)) {
                return Err(SyncError::data());
            }
        }
        self.maintain_whitelist(op);
        Ok(())
    }

    async fn propagate_delete(&mut self, op: &SyncOperation) -> SyncResult<()> {
        let db_id = super::reconcile::db_id_of(self.trees, self.cache, op.affected)
            .ok_or_else(SyncError::data)?;
        self.db.delete_node(db_id).await?;
        self.cache.remove_subtree(db_id);

        if let Some(corresponding) = op.corresponding {
            self.trees
                .tree_mut(corresponding.side)
                .remove_subtree(corresponding.idx);
        }
        self.trees
            .tree_mut(op.affected.side)
            .remove_subtree(op.affected.idx);
        self.maintain_whitelist(op);
        Ok(())
    }

    fn parent_db_id(&self, affected: NodeRef) -> SyncResult<i64> {
        let tree = self.trees.tree(affected.side);
        let Some(parent_idx) = tree.node(affected.idx).parent() else {
            return Err(SyncError::data());
        };
        if parent_idx == tree.root() {
            return Ok(self.cache.root_db_id());
        }
        let parent = tree.node(parent_idx);
        parent
            .db_id
            .or_else(|| {
                parent
                    .id
                    .as_ref()
                    .and_then(|id| self.cache.db_id(affected.side, id))
            })
            .ok_or_else(SyncError::data)
    }

    fn maintain_whitelist(&mut self, op: &SyncOperation) {
        if let Some(id) = &self.trees.node(op.affected).id {
            self.whitelist.remove(&(op.affected.side, id.clone()));
        }
    }

    // ---- completions and error recovery --------------------------------

    async fn handle_finished_job(
        &mut self,
        finished: &FinishedJob,
        job_to_op: &HashMap<JobId, OpId>,
        pending: &mut VecDeque<OpId>,
        pruned: &mut HashSet<OpId>,
        outcome: &mut ExecutorOutcome,
    ) -> SyncResult<()> {
        let Some(&op_id) = job_to_op.get(&finished.job_id) else {
            warn!(job_id = finished.job_id, "Terminated job has no operation");
            return Ok(());
        };
        let Some(op) = self.ops.get(op_id).cloned() else {
            return Ok(());
        };

        match &finished.result {
            JobResult::Done(output) => {
                self.propagate(&op, Some(output.clone())).await?;
                self.complete_progress(&op, true);
                Ok(())
            }
            JobResult::Canceled => {
                debug!(op_id, "Job canceled");
                self.record_canceled(&op, "job aborted before completion", outcome);
                self.complete_progress(&op, false);
                Ok(())
            }
            JobResult::Failed(err) => {
                let result = self
                    .handle_operation_error(&op, *err, pending, pruned, outcome)
                    .await;
                self.complete_progress(&op, false);
                result
            }
        }
    }

    /// Recover from a failed operation when possible; `Err` aborts the pass.
    async fn handle_operation_error(
        &mut self,
        op: &SyncOperation,
        err: SyncError,
        pending: &mut VecDeque<OpId>,
        pruned: &mut HashSet<OpId>,
        outcome: &mut ExecutorOutcome,
    ) -> SyncResult<()> {
        warn!(op_id = op.id, %err, "Operation failed");
        match (err.code, err.cause) {
            // The item cannot be synchronized right now: withhold it and
            // carry on without its dependents.
            (ExitCode::BackError, ExitCause::InvalidName)
            | (ExitCode::BackError, ExitCause::ApiError)
            | (ExitCode::BackError, ExitCause::FileTooBig)
            | (ExitCode::BackError, ExitCause::UploadNotTerminated)
            | (ExitCode::SystemError, ExitCause::FileAccessError) => {
                self.blacklist_op_nodes(op);
                self.prune_dependents(op, pending, pruned);
                self.record_error(op, err, outcome);
                outcome.restart = true;
                Ok(())
            }
            // The name is taken on the target: suffix the local copy and let
            // the authoritative version re-download next pass.
            (_, ExitCause::FileAlreadyExist) => {
                self.recover_already_exists(op).await?;
                self.prune_dependents(op, pending, pruned);
                self.record_error(op, err, outcome);
                outcome.restart = true;
                Ok(())
            }
            // The object vanished underneath us: rebuild the snapshots.
            (ExitCode::BackError, ExitCause::NotFound)
            | (ExitCode::SystemError, ExitCause::NotFound) => {
                outcome.invalidate_local_snapshot = true;
                outcome.restart = true;
                self.prune_dependents(op, pending, pruned);
                self.record_error(op, err, outcome);
                Ok(())
            }
            // Quota, disk, network, database: the pass cannot continue.
            _ => {
                self.record_error(op, err, outcome);
                Err(err)
            }
        }
    }

    async fn recover_already_exists(&mut self, op: &SyncOperation) -> SyncResult<()> {
        let relative = self.trees.path_of(op.affected);
        if op.affected.side == ReplicaSide::Local {
            let node_name = self.trees.node(op.affected).name.clone();
            let renamed = conflicted_name(&node_name, chrono::Utc::now());
            let destination = relative
                .parent()
                .map(|parent| parent.join(&renamed))
                .unwrap_or_else(|| renamed.clone().into());
            info!(from = %relative.display(), to = %destination.display(), "Renaming local copy aside");
            fs_ops::rename(
                &self.config.absolute_local(&relative),
                &self.config.absolute_local(&destination),
            )
            .await?;
        }
        if let Some(db_id) = super::reconcile::db_id_of(self.trees, self.cache, op.affected) {
            self.db.delete_node(db_id).await?;
            self.cache.remove_subtree(db_id);
        }
        Ok(())
    }

    fn blacklist_op_nodes(&mut self, op: &SyncOperation) {
        for node_ref in [Some(op.affected), op.corresponding].into_iter().flatten() {
            if let Some(id) = &self.trees.node(node_ref).id {
                self.tmp_blacklist.insert((node_ref.side, id.clone()));
            }
        }
    }

    /// Drop every remaining operation that depends on the failed one, either
    /// through the recorded parent links or by touching the same nodes.
    fn prune_dependents(
        &mut self,
        failed: &SyncOperation,
        pending: &mut VecDeque<OpId>,
        pruned: &mut HashSet<OpId>,
    ) {
        let mut doomed: HashSet<OpId> = HashSet::from([failed.id]);
        let mut doomed_nodes: HashSet<(ReplicaSide, NodeId)> = HashSet::new();
        for node_ref in [Some(failed.affected), failed.corresponding]
            .into_iter()
            .flatten()
        {
            if let Some(id) = &self.trees.node(node_ref).id {
                doomed_nodes.insert((node_ref.side, id.clone()));
            }
        }

        loop {
            let mut grew = false;
            for &op_id in pending.iter() {
                if doomed.contains(&op_id) {
                    continue;
                }
                let Some(op) = self.ops.get(op_id) else { continue };
                let depends = op.parent_op.map(|p| doomed.contains(&p)).unwrap_or(false);
                let touches = [Some(op.affected), op.corresponding]
                    .into_iter()
                    .flatten()
                    .any(|node_ref| {
                        self.trees
                            .node(node_ref)
                            .id
                            .as_ref()
                            .map(|id| doomed_nodes.contains(&(node_ref.side, id.clone())))
                            .unwrap_or(false)
                    });
                if depends || touches {
                    doomed.insert(op_id);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        doomed.remove(&failed.id);
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "Pruning operations dependent on a failed one");
        }
        pruned.extend(doomed);
    }

    fn record_error(&self, op: &SyncOperation, err: SyncError, outcome: &mut ExecutorOutcome) {
        self.record(op, err, None, outcome);
    }

    /// The operation was intentionally skipped (cancellation); surfaced as
    /// a success-with-hint record.
    fn record_canceled(&self, op: &SyncOperation, reason: &str, outcome: &mut ExecutorOutcome) {
        self.record(op, SyncError::canceled(), Some(reason.to_string()), outcome);
    }

    fn record(
        &self,
        op: &SyncOperation,
        err: SyncError,
        cancel_reason: Option<String>,
        outcome: &mut ExecutorOutcome,
    ) {
        let (local_id, remote_id) = match op.target_side {
            ReplicaSide::Local => (
                op.corresponding.and_then(|n| self.trees.node(n).id.clone()),
                self.trees.node(op.affected).id.clone(),
            ),
            ReplicaSide::Remote => (
                self.trees.node(op.affected).id.clone(),
                op.corresponding.and_then(|n| self.trees.node(n).id.clone()),
            ),
        };
        let record = ErrorRecord {
            sync_pair_id: self.config.sync_pair_id,
            db_id: super::reconcile::db_id_of(self.trees, self.cache, op.affected),
            local_id,
            remote_id,
            kind: Some(self.trees.node(op.affected).kind),
            path: self.trees.path_of(op.affected),
            conflict: op.conflict.map(|c| c.kind),
            inconsistency: None,
            cancel_reason,
            code: err.code,
            cause: err.cause,
        };
        self.events.emit(SyncEvent::Error(record.clone()));
        outcome.errors.push(record);
    }

    // ---- progress -------------------------------------------------------

    fn init_progress(&self) {
        for op in self.ops.iter_ordered() {
            if op.omit {
                continue;
            }
            self.emit_progress(op);
        }
    }

    fn emit_progress(&self, op: &SyncOperation) {
        let node = self.trees.node(op.affected);
        let instruction = match (op.op_type, op.target_side) {
            (Op::Create, ReplicaSide::Local) => FileInstruction::Get,
            (Op::Create, ReplicaSide::Remote) => FileInstruction::Put,
            (Op::Edit, _) => FileInstruction::Update,
            (Op::Move, _) => FileInstruction::Move,
            (Op::Delete, _) => FileInstruction::Remove,
        };
        self.events.emit(SyncEvent::Progress {
            item: ProgressItem {
                path: self.trees.path_of(op.affected),
                instruction,
                direction: if op.target_side == ReplicaSide::Local {
                    SyncDirection::Down
                } else {
                    SyncDirection::Up
                },
                size: node.size,
                transferred: 0,
            },
        });
    }

    fn complete_progress(&self, op: &SyncOperation, success: bool) {
        if op.omit {
            return;
        }
        self.events.emit(SyncEvent::FileCompleted {
            path: self.trees.path_of(op.affected),
            target_side: op.target_side,
            success,
        });
    }
}

/// Upload a file, through an upload session above the threshold.
#[allow(clippy::too_many_arguments)]
async fn upload_job(
    drive: Arc<dyn DriveClient>,
    absolute: PathBuf,
    parent_id: NodeId,
    name: String,
    mtime: i64,
    session_threshold: i64,
    chunk_size: i64,
    max_parallel_chunks: usize,
) -> SyncResult<JobOutput> {
    let data = tokio::fs::read(&absolute).await?;
    let item = if (data.len() as i64) <= session_threshold {
        drive
            .upload_small(&parent_id, &name, mtime, data)
            .await
            .map_err(SyncError::from)?
    } else {
        upload_via_session(
            drive,
            data,
            parent_id,
            name,
            mtime,
            chunk_size,
            max_parallel_chunks,
        )
        .await?
    };
    Ok(JobOutput::remote(item))
}

async fn upload_via_session(
    drive: Arc<dyn DriveClient>,
    data: Vec<u8>,
    parent_id: NodeId,
    name: String,
    mtime: i64,
    chunk_size: i64,
    max_parallel_chunks: usize,
) -> SyncResult<RemoteItem> {
    let chunk_size = chunk_size.max(1) as usize;
    let session = drive
        .upload_session_start(&parent_id, &name, data.len() as i64, mtime)
        .await
        .map_err(SyncError::from)?;

    let result =
        stream_chunks(&*drive, &session, &data, chunk_size, max_parallel_chunks.max(1)).await;
    match result {
        Ok(()) => drive
            .upload_session_finish(&session)
            .await
            .map_err(SyncError::from),
        Err(err) => {
            // Leave nothing half-assembled on the server.
            let _ = drive.upload_session_cancel(&session).await;
            Err(err)
        }
    }
}

async fn stream_chunks(
    drive: &dyn DriveClient,
    session: &UploadSessionId,
    data: &[u8],
    chunk_size: usize,
    parallel: usize,
) -> SyncResult<()> {
    let mut uploads = FuturesUnordered::new();
    let mut chunks = data.chunks(chunk_size).enumerate();
    loop {
        while uploads.len() < parallel {
            match chunks.next() {
                Some((index, chunk)) => {
                    uploads.push(drive.upload_chunk(session, index as u64, chunk.to_vec()));
                }
                None => break,
            }
        }
        match uploads.next().await {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(()),
        }
    }
}
