//! The per-pair sync engine: owns the pipeline and runs sync passes

use super::compute_ops::{compute_fs_operations, detect_size_mismatches};
use super::conflict_finder::find_conflicts;
use super::conflict_resolver::{resolve_conflicts, ResolverContext};
use super::consistency::{check_consistency, PlatformRules};
use super::executor::{Executor, ExecutorOutcome};
use super::generator::{generate_operations, GeneratorContext};
use super::reconcile::Snapshots;
use super::sorter::sort_operations;
use super::tree_builder::build_update_tree;
use crate::config::SyncConfig;
use crate::domain::{SyncOperationList, TreePair};
use crate::infrastructure::database::{SyncDb, SyncNodeKind};
use crate::infrastructure::events::{ErrorRecord, EventBus, SyncEvent, SyncStep};
use crate::infrastructure::jobs::JobManager;
use crate::local::fs_ops::free_disk_space;
use crate::local::snapshot::{build_local_snapshot, WalkOptions, LOCAL_ROOT_ID};
use crate::remote::client::DriveClient;
use crate::remote::snapshot::build_remote_snapshot;
use crate::shared::{ExitCause, ExitCode, NodeId, ReplicaSide, SyncResult};
use crate::vfs::Vfs;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const APP_STATE_FULLY_COMPLETED: &str = "sync_has_fully_completed";
const IDLE_POLL: Duration = Duration::from_secs(30);
const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EngineStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Nothing to do: both replicas matched the database.
    pub idle: bool,
    /// Another pass must run immediately.
    pub restart: bool,
    pub executed: u64,
    pub errors: Vec<ErrorRecord>,
}

/// Control handle usable from any task while the engine runs.
#[derive(Clone)]
pub struct EngineHandle {
    stop: Arc<watch::Sender<bool>>,
    pause: Arc<watch::Sender<bool>>,
    status: watch::Receiver<EngineStatus>,
    events: Arc<EventBus>,
}

impl EngineHandle {
    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn unpause(&self) {
        let _ = self.pause.send(false);
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

/// Keeps one local directory and one remote drive folder convergent.
pub struct SyncEngine {
    config: SyncConfig,
    drive: Arc<dyn DriveClient>,
    vfs: Arc<dyn Vfs>,
    db: SyncDb,
    events: Arc<EventBus>,
    jobs: JobManager,
    rules: PlatformRules,

    stop: Arc<watch::Sender<bool>>,
    pause: Arc<watch::Sender<bool>>,
    status: watch::Sender<EngineStatus>,

    tmp_blacklist: HashSet<(ReplicaSide, NodeId)>,
    whitelist: HashSet<(ReplicaSide, NodeId)>,
    sync_fully_completed: bool,
    restart_requested: bool,
    force_full_checksums: bool,
}

impl SyncEngine {
    pub async fn new(
        config: SyncConfig,
        drive: Arc<dyn DriveClient>,
        vfs: Arc<dyn Vfs>,
    ) -> SyncResult<Self> {
        let db = SyncDb::open(&config.db_path()).await?;
        let tmp_blacklist = db.sync_nodes(SyncNodeKind::TmpBlacklist).await?;
        let whitelist = db.sync_nodes(SyncNodeKind::Whitelist).await?;
        let sync_fully_completed = db
            .app_state(APP_STATE_FULLY_COMPLETED)
            .await?
            .map(|value| value == "1")
            .unwrap_or(false);

        let (stop, _) = watch::channel(false);
        let (pause, _) = watch::channel(false);
        let (status, _) = watch::channel(EngineStatus::Idle);
        let jobs = JobManager::new(config.max_jobs);

        info!(
            pair = %config.sync_pair_id,
            local = %config.local_path.display(),
            "Sync engine initialized"
        );
        Ok(Self {
            config,
            drive,
            vfs,
            db,
            events: Arc::new(EventBus::default()),
            jobs,
            rules: PlatformRules::current(),
            stop: Arc::new(stop),
            pause: Arc::new(pause),
            status,
            tmp_blacklist,
            whitelist,
            sync_fully_completed,
            restart_requested: false,
            force_full_checksums: false,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            stop: self.stop.clone(),
            pause: self.pause.clone(),
            status: self.status.subscribe(),
            events: self.events.clone(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Read access to the sync database (state inspection, tests).
    pub fn db(&self) -> &SyncDb {
        &self.db
    }

    /// Run sync passes until stopped. A pass requesting a restart is
    /// followed immediately; an idle pass waits for the poll interval.
    pub async fn run(mut self) -> SyncResult<()> {
        self.events.emit(SyncEvent::Started);
        let _ = self.status.send(EngineStatus::Running);

        loop {
            if *self.stop.borrow() {
                break;
            }
            if self.wait_while_paused().await {
                break;
            }

            match self.run_pass().await {
                Ok(outcome) => {
                    if outcome.restart {
                        continue;
                    }
                    let _ = self.status.send(EngineStatus::Idle);
                    if self.sleep_or_stop(IDLE_POLL).await {
                        break;
                    }
                    let _ = self.status.send(EngineStatus::Running);
                }
                Err(err) if err.is_fatal() => {
                    error!(%err, "Fatal engine error");
                    let _ = self.status.send(EngineStatus::Stopped);
                    self.events.emit(SyncEvent::Stopped);
                    return Err(err);
                }
                Err(err) if err.code == ExitCode::DataError => {
                    // A tree or database invariant broke: snapshots are
                    // rebuilt on the next pass anyway, so go again after a
                    // short breather.
                    warn!(%err, "Pass aborted on inconsistent state, restarting");
                    self.restart_requested = true;
                    if self.sleep_or_stop(Duration::from_secs(2)).await {
                        break;
                    }
                }
                Err(err) => {
                    // Transient (network, disk, quota): pause until the user
                    // or the environment recovers.
                    warn!(%err, "Pass aborted, pausing");
                    let _ = self.pause.send(true);
                    self.events.emit(SyncEvent::Paused);
                }
            }
        }

        let _ = self.status.send(EngineStatus::Stopped);
        self.events.emit(SyncEvent::Stopped);
        Ok(())
    }

    /// One full pass over the pipeline, from snapshot diffing to propagation.
    pub async fn run_pass(&mut self) -> SyncResult<PassOutcome> {
        let restart_was_requested = self.restart_requested;
        self.restart_requested = false;
        let mut outcome = PassOutcome::default();

        // S1: snapshots and FS operations
        self.step(SyncStep::ComputeOps);
        let walk = WalkOptions {
            with_checksums: self.force_full_checksums,
            skip_top_level: vec![self.config.rescue_dir_name()],
        };
        self.force_full_checksums = false;
        let local_snapshot = build_local_snapshot(&self.config.local_path, &walk)?;
        let remote_snapshot =
            build_remote_snapshot(self.drive.as_ref(), &self.config.remote_root_id).await?;
        let mut cache = self
            .db
            .load_cache(&LOCAL_ROOT_ID.to_string(), &self.config.remote_root_id)
            .await?;

        let corrupted = detect_size_mismatches(&local_snapshot, &remote_snapshot, &cache);
        if !corrupted.is_empty() {
            // Drop the rows: both copies re-propagate and reconcile afresh.
            warn!(count = corrupted.len(), "Size mismatch on in-sync files, fixing");
            for db_id in corrupted {
                self.db.delete_node(db_id).await?;
                cache.remove_subtree(db_id);
            }
            self.restart_requested = true;
            outcome.restart = true;
            return Ok(outcome);
        }

        // User-excluded folders are withheld exactly like blacklisted items.
        let mut hidden = self.tmp_blacklist.clone();
        for excluded in self.db.selective_sync_exclusions().await? {
            let path = std::path::Path::new(&excluded);
            if let Some(id) = local_snapshot.id_by_path(path) {
                hidden.insert((ReplicaSide::Local, id));
            }
            if let Some(id) = remote_snapshot.id_by_path(path) {
                hidden.insert((ReplicaSide::Remote, id));
            }
        }

        let local_ops = compute_fs_operations(&local_snapshot, &cache, &hidden);
        let remote_ops = compute_fs_operations(&remote_snapshot, &cache, &hidden);

        if local_ops.is_empty() && remote_ops.is_empty() {
            debug!("No changes detected");
            self.step(SyncStep::Done);
            if !restart_was_requested {
                self.set_fully_completed(true).await?;
            }
            outcome.idle = true;
            self.events.emit(SyncEvent::PassCompleted {
                restart: false,
                executed_ops: 0,
            });
            return Ok(outcome);
        }

        // S2: update trees
        self.step(SyncStep::UpdateTrees);
        let local_tree = build_update_tree(&local_ops, &local_snapshot, &cache)?;
        let remote_tree = build_update_tree(&remote_ops, &remote_snapshot, &cache)?;
        let mut trees = TreePair::new(local_tree, remote_tree);

        // S3: platform consistency
        self.step(SyncStep::ConsistencyCheck);
        let blacklisted = check_consistency(&mut trees, &self.rules);
        if !blacklisted.is_empty() {
            for entry in &blacklisted {
                self.tmp_blacklist.insert((entry.side, entry.node_id.clone()));
                self.events.emit(SyncEvent::Error(ErrorRecord {
                    sync_pair_id: self.config.sync_pair_id,
                    db_id: cache.db_id(entry.side, &entry.node_id),
                    local_id: (entry.side == ReplicaSide::Local)
                        .then(|| entry.node_id.clone()),
                    remote_id: (entry.side == ReplicaSide::Remote)
                        .then(|| entry.node_id.clone()),
                    kind: None,
                    path: entry.path.clone(),
                    conflict: None,
                    inconsistency: Some(entry.inconsistency),
                    cancel_reason: None,
                    code: ExitCode::BackError,
                    cause: ExitCause::InvalidName,
                }));
            }
            self.db
                .set_sync_nodes(SyncNodeKind::TmpBlacklist, &self.tmp_blacklist)
                .await?;
        }

        let snapshots = Snapshots {
            local: &local_snapshot,
            remote: &remote_snapshot,
        };

        // S4: conflicts
        self.step(SyncStep::ConflictFinding);
        let mut conflicts =
            find_conflicts(&mut trees, &cache, snapshots, self.sync_fully_completed);

        let mut ops = SyncOperationList::new();
        if !conflicts.is_empty() {
            // S5: conflicts win the pass; regular generation waits for the
            // restarted pass.
            info!(count = conflicts.len(), "Resolving conflicts");
            self.step(SyncStep::ConflictResolution);
            let ctx = ResolverContext {
                cache: &cache,
                snapshots,
                rules: &self.rules,
                now: chrono::Utc::now(),
            };
            resolve_conflicts(&mut trees, &mut conflicts, &mut ops, self.vfs.as_ref(), &ctx)
                .await?;
            self.restart_requested = true;
        } else {
            // S6: operation generation
            self.step(SyncStep::OperationGeneration);
            let ctx = GeneratorContext {
                cache: &cache,
                snapshots,
                vfs_mode: self.vfs.mode(),
                local_free_bytes: free_disk_space(&self.config.local_path),
                free_space_margin: self.config.free_space_margin,
            };
            let generated = generate_operations(&mut trees, &mut ops, &ctx)?;
            if generated.restart {
                self.restart_requested = true;
            }
        }

        // S7: sorting
        self.step(SyncStep::OperationSorting);
        let sorted = sort_operations(&mut ops, &trees, &cache)?;
        if sorted.restart {
            self.restart_requested = true;
        }

        // S8: propagation
        self.step(SyncStep::Propagation);
        info!(ops = ops.len(), "Executing operations");
        // Re-arm the job manager in case the previous pass was cancelled.
        self.jobs.reset();
        let executor = Executor {
            ops: &mut ops,
            trees: &mut trees,
            cache: &mut cache,
            db: &self.db,
            drive: self.drive.clone(),
            vfs: self.vfs.clone(),
            jobs: &self.jobs,
            config: &self.config,
            events: &self.events,
            snapshots,
            tmp_blacklist: &mut self.tmp_blacklist,
            whitelist: &mut self.whitelist,
            stop: self.stop.subscribe(),
        };
        let executed: ExecutorOutcome = executor.execute().await?;
        if executed.restart {
            self.restart_requested = true;
        }
        if executed.invalidate_local_snapshot {
            // Next pass re-checksums everything instead of trusting mtimes.
            self.force_full_checksums = true;
        }
        self.db
            .set_sync_nodes(SyncNodeKind::TmpBlacklist, &self.tmp_blacklist)
            .await?;
        self.db
            .set_sync_nodes(SyncNodeKind::Whitelist, &self.whitelist)
            .await?;

        self.step(SyncStep::Done);
        outcome.executed = executed.executed;
        outcome.errors = executed.errors;
        outcome.restart = self.restart_requested;
        if outcome.restart {
            self.set_fully_completed(false).await?;
        }
        self.events.emit(SyncEvent::PassCompleted {
            restart: outcome.restart,
            executed_ops: outcome.executed,
        });
        Ok(outcome)
    }

    fn step(&self, step: SyncStep) {
        debug!(%step, "Step");
        self.events.emit(SyncEvent::StepChanged { step });
    }

    async fn set_fully_completed(&mut self, value: bool) -> SyncResult<()> {
        if self.sync_fully_completed != value {
            self.sync_fully_completed = value;
            self.db
                .set_app_state(APP_STATE_FULLY_COMPLETED, if value { "1" } else { "0" })
                .await?;
        }
        Ok(())
    }

    /// Returns `true` when a stop arrived while paused.
    async fn wait_while_paused(&self) -> bool {
        let mut announced = false;
        while *self.pause.borrow() {
            if *self.stop.borrow() {
                return true;
            }
            if !announced {
                let _ = self.status.send(EngineStatus::Paused);
                announced = true;
            }
            tokio::time::sleep(PAUSE_POLL).await;
        }
        if announced {
            let _ = self.status.send(EngineStatus::Running);
            self.events.emit(SyncEvent::Resumed);
        }
        false
    }

    /// Returns `true` when a stop arrived during the sleep.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.stop.borrow(),
            _ = stop.changed() => *self.stop.borrow(),
        }
    }
}
