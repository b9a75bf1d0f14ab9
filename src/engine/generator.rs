//! Step 6: generate sync operations from the surviving change events

use super::reconcile::{corresponding_node, edit_should_propagate, is_pseudo_conflict, Snapshots};
use crate::domain::{NodeRef, OpDraft, SyncOperationList, TreePair};
use crate::infrastructure::database::DbCache;
use crate::shared::{
    ExitCause, NodeKind, NodeStatus, Op, ReplicaSide, SyncError, SyncResult,
};
use crate::vfs::VfsMode;
use std::collections::HashSet;
use tracing::{debug, warn};

/// What the generation step reports back to the pass.
#[derive(Debug, Default)]
pub struct GeneratorOutcome {
    /// Bytes the executor will download to the local replica.
    pub bytes_to_download: i64,
    /// A restart is needed (e.g. both sides deleted: creates at the same
    /// path are only visible next pass).
    pub restart: bool,
}

/// Everything the generator needs from the pass.
pub struct GeneratorContext<'a> {
    pub cache: &'a DbCache,
    pub snapshots: Snapshots<'a>,
    pub vfs_mode: VfsMode,
    /// Free bytes on the local partition, `-1` when unknown.
    pub local_free_bytes: i64,
    pub free_space_margin: i64,
}

/// BFS both trees and emit exactly one operation per surviving change event.
pub fn generate_operations(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &GeneratorContext<'_>,
) -> SyncResult<GeneratorOutcome> {
    trees.mark_all_unprocessed();
    let mut outcome = GeneratorOutcome::default();
    let mut deleted: HashSet<(ReplicaSide, String)> = HashSet::new();

    let mut queue: Vec<NodeRef> = Vec::new();
    for side in [ReplicaSide::Local, ReplicaSide::Remote] {
        for idx in trees.tree(side).bfs() {
            queue.push(NodeRef { side, idx });
        }
    }

    for node_ref in queue {
        if trees.node(node_ref).status == NodeStatus::Processed {
            continue;
        }
        let events = trees.node(node_ref).change_events;
        if events.is_empty() {
            continue;
        }

        let corresponding = corresponding_node(trees, ctx.cache, node_ref);
        if corresponding.is_none()
            && !events.contains(Op::Create)
            && (events.contains(Op::Delete)
                || events.contains(Op::Edit)
                || events.contains(Op::Move))
        {
            warn!(
                path = %trees.path_of(node_ref).display(),
                "No corresponding node for a non-create change"
            );
            return Err(SyncError::data());
        }

        if events.contains(Op::Create) {
            generate_create(trees, ops, ctx, &mut outcome, node_ref, corresponding);
        }
        if events.contains(Op::Delete) {
            generate_delete(trees, ops, &mut outcome, &mut deleted, node_ref, corresponding);
        }
        if events.contains(Op::Edit) {
            generate_edit(trees, ops, ctx, &mut outcome, node_ref, corresponding);
        }
        if events.contains(Op::Move) {
            generate_move(trees, ops, ctx, node_ref, corresponding);
        }
    }

    if outcome.bytes_to_download > 0 && ctx.local_free_bytes >= 0 {
        if ctx.local_free_bytes < outcome.bytes_to_download + ctx.free_space_margin {
            warn!(
                free = ctx.local_free_bytes,
                needed = outcome.bytes_to_download,
                "Disk almost full, synchronization canceled"
            );
            return Err(SyncError::system(ExitCause::NotEnoughDiskSpace));
        }
    }
    Ok(outcome)
}

fn generate_create(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &GeneratorContext<'_>,
    outcome: &mut GeneratorOutcome,
    node_ref: NodeRef,
    corresponding: Option<NodeRef>,
) {
    let mut omit = false;
    if let Some(corresponding) = corresponding {
        if is_pseudo_conflict(trees, ctx.snapshots, node_ref, corresponding) {
            omit = true;
            trees.node_mut(corresponding).status = NodeStatus::Processed;
        }
    }

    let node = trees.node(node_ref);
    let name = node.name.clone();
    let node_id = node.id.clone();
    let target = node_ref.side.other();
    let mut draft = OpDraft::new(Op::Create, node_ref, target)
        .omit(omit)
        .new_name(name);
    if omit {
        if let Some(corresponding) = corresponding {
            draft = draft.corresponding(corresponding);
        }
        debug!(
            path = %trees.path_of(node_ref).display(),
            "Create-Create pseudo conflict, DB-only create"
        );
    } else if ctx.vfs_mode == VfsMode::Off
        && target == ReplicaSide::Local
        && trees.node(node_ref).kind == NodeKind::File
    {
        outcome.bytes_to_download += trees.node(node_ref).size;
    }
    // The parent is resolved at execution time: it may be created by an
    // earlier operation of this very pass.
    trees.node_mut(node_ref).status = NodeStatus::Processed;
    ops.push(draft, node_id.as_ref());
}

fn generate_edit(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &GeneratorContext<'_>,
    outcome: &mut GeneratorOutcome,
    node_ref: NodeRef,
    corresponding: Option<NodeRef>,
) {
    let Some(corresponding) = corresponding else {
        return;
    };
    let mut omit = false;
    if is_pseudo_conflict(trees, ctx.snapshots, node_ref, corresponding) {
        omit = true;
        trees.node_mut(corresponding).status = NodeStatus::Processed;
        debug!(
            path = %trees.path_of(node_ref).display(),
            "Edit-Edit pseudo conflict, DB-only edit"
        );
    }
    if !edit_should_propagate(trees, ctx.snapshots, ctx.cache, node_ref) {
        omit = true;
        debug!(
            path = %trees.path_of(node_ref).display(),
            "Only the creation date changed, DB-only edit"
        );
    }

    let node_id = trees.node(node_ref).id.clone();
    let draft = OpDraft::new(Op::Edit, node_ref, corresponding.side)
        .corresponding(corresponding)
        .omit(omit);

    if !omit
        && ctx.vfs_mode == VfsMode::Off
        && corresponding.side == ReplicaSide::Local
        && trees.node(node_ref).kind == NodeKind::File
    {
        outcome.bytes_to_download += trees.node(node_ref).size - trees.node(corresponding).size;
    }

    let node = trees.node_mut(node_ref);
    node.status = if node.has_event(Op::Move) && node.status == NodeStatus::Unprocessed {
        NodeStatus::PartiallyProcessed
    } else {
        NodeStatus::Processed
    };
    ops.push(draft, node_id.as_ref());
}

fn generate_move(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &GeneratorContext<'_>,
    node_ref: NodeRef,
    corresponding: Option<NodeRef>,
) {
    let Some(corresponding) = corresponding else {
        return;
    };
    let mut omit = false;
    if is_pseudo_conflict(trees, ctx.snapshots, node_ref, corresponding) {
        omit = true;
        trees.node_mut(corresponding).status = NodeStatus::Processed;
        debug!(
            path = %trees.path_of(node_ref).display(),
            "Move-Move pseudo conflict, DB-only move"
        );
    }

    let node_id = trees.node(node_ref).id.clone();
    let name = trees.node(node_ref).name.clone();
    let origin = trees
        .node(corresponding)
        .move_origin
        .as_ref()
        .map(|o| o.path.clone())
        .unwrap_or_else(|| trees.path_of(corresponding));
    let destination = trees.path_of(node_ref);
    let draft = OpDraft::new(Op::Move, node_ref, corresponding.side)
        .corresponding(corresponding)
        .omit(omit)
        .new_name(name)
        .origin_path(origin)
        .destination_path(destination);

    let node = trees.node_mut(node_ref);
    node.status = if node.has_event(Op::Edit) && node.status == NodeStatus::Unprocessed {
        NodeStatus::PartiallyProcessed
    } else {
        NodeStatus::Processed
    };
    ops.push(draft, node_id.as_ref());
}

fn generate_delete(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    outcome: &mut GeneratorOutcome,
    deleted: &mut HashSet<(ReplicaSide, String)>,
    node_ref: NodeRef,
    corresponding: Option<NodeRef>,
) {
    let Some(corresponding) = corresponding else {
        return;
    };
    // The subtree is folded into the ancestor's delete.
    let parent_id = trees
        .node(node_ref)
        .parent()
        .and_then(|p| trees.tree(node_ref.side).node(p).id.clone());
    if let Some(parent_id) = parent_id {
        if deleted.contains(&(node_ref.side, parent_id)) {
            return;
        }
    }

    let omit = trees.node(corresponding).has_event(Op::Delete);
    let node_id = trees.node(node_ref).id.clone();
    let draft = OpDraft::new(Op::Delete, node_ref, corresponding.side)
        .corresponding(corresponding)
        .omit(omit);

    mark_subtree_processed(trees, node_ref);
    mark_subtree_processed(trees, corresponding);

    if omit {
        // Nothing changes on either replica; restart so a re-created item at
        // the same path is picked up.
        debug!(
            path = %trees.path_of(node_ref).display(),
            "Deleted on both sides, DB-only delete"
        );
        outcome.restart = true;
    }
    if let Some(id) = &node_id {
        deleted.insert((node_ref.side, id.clone()));
    }
    ops.push(draft, node_id.as_ref());
}

fn mark_subtree_processed(trees: &mut TreePair, start: NodeRef) {
    let tree = trees.tree_mut(start.side);
    let mut stack = vec![start.idx];
    while let Some(idx) = stack.pop() {
        stack.extend(tree.node(idx).children().iter().copied());
        tree.node_mut(idx).status = NodeStatus::Processed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeSeed, Snapshot, SnapshotItem, SyncOperationList, UpdateTree};
    use crate::infrastructure::database::{DbCache, DbNode};
    use pretty_assertions::assert_eq;

    fn root_row() -> DbNode {
        DbNode {
            db_id: 1,
            parent_db_id: None,
            local_id: Some("local-root".into()),
            remote_id: Some("remote-root".into()),
            local_name: String::new(),
            remote_name: String::new(),
            kind: NodeKind::Directory,
            size: 0,
            created_at_local: None,
            created_at_remote: None,
            last_mod_local: None,
            last_mod_remote: None,
            checksum: None,
            syncing: false,
        }
    }

    fn row(db_id: i64, parent: i64, name: &str, kind: NodeKind) -> DbNode {
        DbNode {
            db_id,
            parent_db_id: Some(parent),
            local_id: Some(format!("l{db_id}")),
            remote_id: Some(format!("r{db_id}")),
            local_name: name.into(),
            remote_name: name.into(),
            kind,
            size: 5,
            created_at_local: Some(10),
            created_at_remote: Some(10),
            last_mod_local: Some(20),
            last_mod_remote: Some(20),
            checksum: None,
            syncing: false,
        }
    }

    fn empty_trees() -> TreePair {
        TreePair::new(
            UpdateTree::new(ReplicaSide::Local, 1, "local-root"),
            UpdateTree::new(ReplicaSide::Remote, 1, "remote-root"),
        )
    }

    fn item(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem {
            id: id.into(),
            parent_id: parent.into(),
            name: name.into(),
            kind: NodeKind::File,
            size: 5,
            created_at: 10,
            modified_at: 20,
            checksum: None,
            is_link: false,
        }
    }

    fn run(
        trees: &mut TreePair,
        cache: &DbCache,
        local_snapshot: &Snapshot,
        remote_snapshot: &Snapshot,
    ) -> (SyncOperationList, GeneratorOutcome) {
        let mut ops = SyncOperationList::new();
        let ctx = GeneratorContext {
            cache,
            snapshots: Snapshots {
                local: local_snapshot,
                remote: remote_snapshot,
            },
            vfs_mode: VfsMode::Off,
            local_free_bytes: -1,
            free_space_margin: 0,
        };
        let outcome = generate_operations(trees, &mut ops, &ctx).unwrap();
        (ops, outcome)
    }

    #[test]
    fn local_create_targets_remote() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut trees = empty_trees();
        let lroot = trees.local.root();
        trees
            .local
            .insert(
                NodeSeed::new("new.txt", NodeKind::File).id("l-new").size(7).event(Op::Create),
                lroot,
            )
            .unwrap();

        let mut lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        lsnap.upsert(item("l-new", "local-root", "new.txt"));
        let rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");

        let (ops, outcome) = run(&mut trees, &cache, &lsnap, &rsnap);
        assert_eq!(ops.len(), 1);
        let op = ops.iter_ordered().next().unwrap();
        assert_eq!(op.op_type, Op::Create);
        assert_eq!(op.target_side, ReplicaSide::Remote);
        assert!(!op.omit);
        // Upload, not download: no local disk cost.
        assert_eq!(outcome.bytes_to_download, 0);
    }

    #[test]
    fn remote_create_counts_download_bytes() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut trees = empty_trees();
        let rroot = trees.remote.root();
        trees
            .remote
            .insert(
                NodeSeed::new("new.txt", NodeKind::File).id("r-new").size(123).event(Op::Create),
                rroot,
            )
            .unwrap();

        let lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let mut ritem = item("r-new", "remote-root", "new.txt");
        ritem.size = 123;
        rsnap.upsert(ritem);

        let (_, outcome) = run(&mut trees, &cache, &lsnap, &rsnap);
        assert_eq!(outcome.bytes_to_download, 123);
    }

    #[test]
    fn disk_guard_aborts_pass() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut trees = empty_trees();
        let rroot = trees.remote.root();
        trees
            .remote
            .insert(
                NodeSeed::new("big.bin", NodeKind::File).id("r-big").size(1000).event(Op::Create),
                rroot,
            )
            .unwrap();

        let lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        let rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let mut ops = SyncOperationList::new();
        let ctx = GeneratorContext {
            cache: &cache,
            snapshots: Snapshots { local: &lsnap, remote: &rsnap },
            vfs_mode: VfsMode::Off,
            local_free_bytes: 500,
            free_space_margin: 100,
        };
        let err = generate_operations(&mut trees, &mut ops, &ctx).unwrap_err();
        assert_eq!(err, SyncError::system(ExitCause::NotEnoughDiskSpace));
    }

    #[test]
    fn double_delete_is_omitted_and_requests_restart() {
        let cache =
            DbCache::from_nodes(vec![root_row(), row(2, 1, "a.txt", NodeKind::File)]).unwrap();
        let mut trees = empty_trees();
        let lroot = trees.local.root();
        let rroot = trees.remote.root();
        trees
            .local
            .insert(
                NodeSeed::new("a.txt", NodeKind::File).id("l2").db_id(2).event(Op::Delete),
                lroot,
            )
            .unwrap();
        trees
            .remote
            .insert(
                NodeSeed::new("a.txt", NodeKind::File).id("r2").db_id(2).event(Op::Delete),
                rroot,
            )
            .unwrap();

        let lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        let rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let (ops, outcome) = run(&mut trees, &cache, &lsnap, &rsnap);

        // One omitted delete; the corresponding node was marked processed so
        // the remote delete did not produce a second operation.
        assert_eq!(ops.len(), 1);
        assert!(ops.iter_ordered().next().unwrap().omit);
        assert!(outcome.restart);
    }

    #[test]
    fn delete_folds_subtree_into_one_op() {
        let cache = DbCache::from_nodes(vec![
            root_row(),
            row(2, 1, "docs", NodeKind::Directory),
            row(3, 2, "a.txt", NodeKind::File),
        ])
        .unwrap();
        let mut trees = empty_trees();
        let lroot = trees.local.root();
        let docs = trees
            .local
            .insert(
                NodeSeed::new("docs", NodeKind::Directory).id("l2").db_id(2).event(Op::Delete),
                lroot,
            )
            .unwrap();
        trees
            .local
            .insert(
                NodeSeed::new("a.txt", NodeKind::File).id("l3").db_id(3).event(Op::Delete),
                docs,
            )
            .unwrap();
        let rroot = trees.remote.root();
        let rdocs = trees
            .remote
            .insert(NodeSeed::new("docs", NodeKind::Directory).id("r2").db_id(2), rroot)
            .unwrap();
        trees
            .remote
            .insert(NodeSeed::new("a.txt", NodeKind::File).id("r3").db_id(3), rdocs)
            .unwrap();

        let lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        let rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let (ops, _) = run(&mut trees, &cache, &lsnap, &rsnap);

        assert_eq!(ops.len(), 1);
        let op = ops.iter_ordered().next().unwrap();
        assert_eq!(op.op_type, Op::Delete);
        assert_eq!(op.target_side, ReplicaSide::Remote);
    }

    #[test]
    fn move_plus_edit_yields_two_ops_with_partial_status() {
        let cache =
            DbCache::from_nodes(vec![root_row(), row(2, 1, "a.txt", NodeKind::File)]).unwrap();
        let mut trees = empty_trees();
        let lroot = trees.local.root();
        trees
            .local
            .insert(
                NodeSeed::new("b.txt", NodeKind::File)
                    .id("l2")
                    .db_id(2)
                    .event(Op::Move)
                    .event(Op::Edit)
                    .move_origin("a.txt", "local-root"),
                lroot,
            )
            .unwrap();
        let rroot = trees.remote.root();
        trees
            .remote
            .insert(NodeSeed::new("a.txt", NodeKind::File).id("r2").db_id(2), rroot)
            .unwrap();

        let mut lsnap = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut moved = item("l2", "local-root", "b.txt");
        moved.modified_at = 99;
        lsnap.upsert(moved);
        let rsnap = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let (ops, _) = run(&mut trees, &cache, &lsnap, &rsnap);

        assert_eq!(ops.len(), 2);
        let kinds: Vec<Op> = ops.iter_ordered().map(|op| op.op_type).collect();
        assert!(kinds.contains(&Op::Edit) && kinds.contains(&Op::Move));
    }
}
