//! Step 5: translate conflicts into resolution operations
//!
//! The resolver consumes the priority queue and emits a small set of
//! operations (local rename, rescue move, undo move, DB-only delete). The
//! pass always restarts after those operations have been executed.

use super::consistency::PlatformRules;
use super::reconcile::{
    corresponding_node, corresponding_node_direct, edit_should_propagate, Snapshots,
};
use crate::domain::{
    Conflict, ConflictKind, ConflictQueue, MoveOrigin, NodeRef, OpDraft, SyncOperationList,
    TreePair,
};
use crate::infrastructure::database::DbCache;
use crate::shared::utils::{conflicted_name, normalized_name};
use crate::shared::{NodeKind, NodeStatus, Op, OpSet, ReplicaSide, SyncError, SyncResult};
use crate::vfs::{Vfs, VfsMode};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Everything the resolver needs from the pass.
pub struct ResolverContext<'a> {
    pub cache: &'a DbCache,
    pub snapshots: Snapshots<'a>,
    pub rules: &'a PlatformRules,
    pub now: DateTime<Utc>,
}

/// Drain the conflict queue into resolution operations.
pub async fn resolve_conflicts(
    trees: &mut TreePair,
    queue: &mut ConflictQueue,
    ops: &mut SyncOperationList,
    vfs: &dyn Vfs,
    ctx: &ResolverContext<'_>,
) -> SyncResult<()> {
    while let Some(conflict) = queue.pop() {
        info!(
            kind = %conflict.kind,
            local = %trees.path_of(conflict.local()).display(),
            "Solving conflict"
        );
        let continue_solving = generate_operations(trees, queue, ops, vfs, ctx, conflict).await?;
        if !continue_solving {
            queue.clear();
            break;
        }
    }
    Ok(())
}

async fn generate_operations(
    trees: &mut TreePair,
    queue: &ConflictQueue,
    ops: &mut SyncOperationList,
    vfs: &dyn Vfs,
    ctx: &ResolverContext<'_>,
    conflict: Conflict,
) -> SyncResult<bool> {
    if handle_dehydrated_placeholder(trees, ops, vfs, conflict).await? {
        return Ok(true);
    }
    if handle_omitted_edit(trees, ops, ctx, conflict) {
        return Ok(true);
    }

    match conflict.kind {
        ConflictKind::MoveCreate => {
            if trees.node(conflict.local()).has_event(Op::Move) {
                undo_move(trees, ops, ctx, conflict, conflict.local())?;
                Ok(false)
            } else {
                generate_local_rename(trees, ops, ctx, conflict);
                Ok(true)
            }
        }
        ConflictKind::CreateCreate | ConflictKind::EditEdit => {
            generate_local_rename(trees, ops, ctx, conflict);
            Ok(true)
        }
        ConflictKind::EditDelete => generate_edit_delete(trees, ops, conflict),
        ConflictKind::MoveDelete => generate_move_delete(trees, ops, ctx, queue, conflict),
        ConflictKind::MoveParentDelete | ConflictKind::CreateParentDelete => {
            generate_parent_delete(trees, ops, ctx, conflict)
        }
        ConflictKind::MoveMoveSource
        | ConflictKind::MoveMoveDest
        | ConflictKind::MoveMoveCycle => {
            undo_move(trees, ops, ctx, conflict, conflict.local())?;
            Ok(false)
        }
    }
}

/// A conflict on a dehydrated placeholder resolves by deleting the local
/// placeholder; the file re-appears as a plain create next pass.
async fn handle_dehydrated_placeholder(
    trees: &TreePair,
    ops: &mut SyncOperationList,
    vfs: &dyn Vfs,
    conflict: Conflict,
) -> SyncResult<bool> {
    if vfs.mode() == VfsMode::Off {
        return Ok(false);
    }
    let local = conflict.local();
    if trees.node(local).kind != NodeKind::File {
        return Ok(false);
    }
    let path = trees.path_of(local);
    let status = vfs.status(&path).await?;
    if !status.is_dehydrated_placeholder() {
        return Ok(false);
    }

    info!(path = %path.display(), "Conflict on dehydrated placeholder, deleting it locally");
    let node_id = trees.node(local).id.clone();
    let draft = OpDraft::new(Op::Delete, conflict.remote(), ReplicaSide::Local)
        .corresponding(local)
        .conflict(conflict)
        .dehydrated_placeholder();
    ops.push(draft, node_id.as_ref());
    Ok(true)
}

/// A local edit that should not propagate (creation-time-only drift)
/// resolves to a DB-only edit.
fn handle_omitted_edit(
    trees: &TreePair,
    ops: &mut SyncOperationList,
    ctx: &ResolverContext<'_>,
    conflict: Conflict,
) -> bool {
    let local = conflict.local();
    if !trees.node(local).has_event(Op::Edit) {
        return false;
    }
    if edit_should_propagate(trees, ctx.snapshots, ctx.cache, local) {
        return false;
    }
    let node_id = trees.node(local).id.clone();
    let draft = OpDraft::new(Op::Edit, local, ReplicaSide::Remote)
        .corresponding(conflict.remote())
        .conflict(conflict)
        .omit(true);
    ops.push(draft, node_id.as_ref());
    true
}

/// Rename the local copy with a conflict suffix and drop its DB row; the
/// remote version re-downloads next pass.
fn generate_local_rename(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &ResolverContext<'_>,
    conflict: Conflict,
) {
    let local = conflict.local();
    let remote = conflict.remote();

    let origin_path = trees.path_of(remote);
    let new_name = conflicted_name(&trees.node(local).name, ctx.now);
    let parent_path_len = ctx
        .snapshots
        .local
        .path_of(trees.node(local).id.as_ref().unwrap_or(&String::new()))
        .map(|p| p.to_string_lossy().chars().count())
        .unwrap_or(0);
    let too_long = parent_path_len + new_name.chars().count() > ctx.rules.max_path_len;

    let mut draft = OpDraft::new(Op::Move, remote, ReplicaSide::Local)
        .corresponding(local)
        .conflict(conflict)
        .new_name(new_name.clone())
        .origin_path(origin_path.clone());
    if too_long {
        // Destination path too long: park the renamed copy at the root.
        let local_root = NodeRef {
            side: ReplicaSide::Local,
            idx: trees.local.root(),
        };
        draft = draft.new_parent(local_root).destination_path(&new_name);
    } else {
        let destination = origin_path
            .parent()
            .map(|parent| parent.join(&new_name))
            .unwrap_or_else(|| new_name.clone().into());
        draft = draft.destination_path(destination);
    }

    // The remote node now stands for a move the next steps must observe.
    let remote_path = trees.path_of(remote);
    let remote_parent_id = trees
        .node(remote)
        .parent()
        .and_then(|p| trees.tree(remote.side).node(p).id.clone())
        .unwrap_or_default();
    let node_id = trees.node(remote).id.clone();
    let remote_node = trees.node_mut(remote);
    remote_node.move_origin = Some(MoveOrigin {
        path: remote_path,
        parent_id: remote_parent_id,
    });
    remote_node.change_events = OpSet::single(Op::Move);

    ops.push(draft, node_id.as_ref());
}

fn generate_edit_delete(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    conflict: Conflict,
) -> SyncResult<bool> {
    let delete_ref = conflict
        .node_with_event(trees, Op::Delete)
        .ok_or_else(SyncError::data)?;
    let edit_ref = conflict
        .node_with_event(trees, Op::Edit)
        .ok_or_else(SyncError::data)?;

    let delete_parent_deleted = trees
        .node(delete_ref)
        .parent()
        .map(|p| trees.tree(delete_ref.side).node(p).has_event(Op::Delete))
        .unwrap_or(false);

    if delete_parent_deleted {
        if edit_ref.side == ReplicaSide::Local {
            // Edited content is rescued; the delete propagates next pass.
            rescue_modified_local_nodes(trees, ops, conflict, edit_ref);
            Ok(true)
        } else {
            // The delete wins over the remote edit.
            let node_id = trees.node(delete_ref).id.clone();
            let draft = OpDraft::new(Op::Delete, delete_ref, ReplicaSide::Remote)
                .corresponding(edit_ref)
                .conflict(conflict);
            ops.push(draft, node_id.as_ref());
            Ok(true)
        }
    } else {
        // Drop the row: next pass sees the edited file as new and restores
        // it with the fresh content.
        let node_id = trees.node(edit_ref).id.clone();
        let draft = OpDraft::new(Op::Delete, edit_ref, delete_ref.side)
            .corresponding(delete_ref)
            .conflict(conflict)
            .omit(true);
        ops.push(draft, node_id.as_ref());
        Ok(false)
    }
}

fn generate_move_delete(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &ResolverContext<'_>,
    queue: &ConflictQueue,
    conflict: Conflict,
) -> SyncResult<bool> {
    let delete_ref = conflict
        .node_with_event(trees, Op::Delete)
        .ok_or_else(SyncError::data)?;
    let move_ref = conflict
        .node_with_event(trees, Op::Move)
        .ok_or_else(SyncError::data)?;

    let move_parent = trees.node(move_ref).parent().map(|idx| NodeRef {
        side: move_ref.side,
        idx,
    });
    if let Some(parent_ref) = move_parent {
        if let Some(corresponding_parent) = corresponding_node_direct(trees, ctx.cache, parent_ref)
        {
            if trees.node(corresponding_parent).has_event(Op::Delete)
                && queue.has_kind(ConflictKind::MoveParentDelete)
            {
                // Solved later as Move-ParentDelete.
                info!("Move-Delete deferred to the Move-ParentDelete resolution");
                return Ok(true);
            }
        }
    }

    rescue_modified_local_nodes(trees, ops, conflict, move_ref);

    let move_node = trees.node(move_ref);
    if move_node.kind == NodeKind::Directory || move_node.status != NodeStatus::ConflictOpGenerated
    {
        let node_id = trees.node(delete_ref).id.clone();
        let draft = OpDraft::new(Op::Delete, delete_ref, move_ref.side)
            .corresponding(move_ref)
            .conflict(conflict);
        ops.push(draft, node_id.as_ref());
    }
    Ok(false)
}

fn generate_parent_delete(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &ResolverContext<'_>,
    conflict: Conflict,
) -> SyncResult<bool> {
    rescue_modified_local_nodes(trees, ops, conflict, conflict.local());

    let delete_ref = conflict
        .node_with_event(trees, Op::Delete)
        .ok_or_else(SyncError::data)?;
    let corresponding =
        corresponding_node(trees, ctx.cache, delete_ref).ok_or_else(SyncError::data)?;
    let node_id = trees.node(delete_ref).id.clone();
    let draft = OpDraft::new(Op::Delete, delete_ref, corresponding.side)
        .corresponding(corresponding)
        .conflict(conflict);
    ops.push(draft, node_id.as_ref());
    Ok(false)
}

/// Undo the losing move: back to its origin when possible, else to the root
/// under a conflict-suffixed name.
fn undo_move(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    ctx: &ResolverContext<'_>,
    conflict: Conflict,
    loser: NodeRef,
) -> SyncResult<()> {
    let (origin_path, origin_parent_id) = {
        let node = trees.node(loser);
        let origin = node.move_origin.as_ref().ok_or_else(SyncError::data)?;
        (origin.path.clone(), origin.parent_id.clone())
    };
    let tree = trees.tree(loser.side);
    let origin_parent_idx = tree.node_by_id(&origin_parent_id).ok_or_else(|| {
        warn!("Origin parent of the losing move is gone from the tree");
        SyncError::data()
    })?;

    let origin_name = origin_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut undo_possible = !tree.is_self_or_below(origin_parent_idx, loser.idx)
        && !tree.node(origin_parent_idx).has_event(Op::Delete);
    if undo_possible {
        if let Some(occupant) =
            tree.child_by_name_except(origin_parent_idx, &normalized_name(&origin_name), Op::Delete)
        {
            let occupant = tree.node(occupant);
            if occupant.has_event(Op::Create) || occupant.has_event(Op::Move) {
                undo_possible = false;
            }
        }
    }

    let (new_parent, new_name, destination) = if undo_possible {
        (
            NodeRef {
                side: loser.side,
                idx: origin_parent_idx,
            },
            origin_name.clone(),
            origin_path
                .parent()
                .map(|parent| parent.join(&origin_name))
                .unwrap_or_else(|| origin_name.clone().into()),
        )
    } else {
        // The move cannot be undone: park the item at the root instead.
        let name = conflicted_name(&trees.node(loser).name, ctx.now);
        (
            NodeRef {
                side: loser.side,
                idx: trees.tree(loser.side).root(),
            },
            name.clone(),
            name.into(),
        )
    };

    let corresponding =
        corresponding_node(trees, ctx.cache, loser).ok_or_else(SyncError::data)?;
    let loser_path = trees.path_of(loser);
    let loser_parent_id = trees
        .node(loser)
        .parent()
        .and_then(|p| trees.tree(loser.side).node(p).id.clone())
        .unwrap_or_default();
    {
        let corresponding_node = trees.node_mut(corresponding);
        corresponding_node.move_origin = Some(MoveOrigin {
            path: loser_path.clone(),
            parent_id: loser_parent_id,
        });
        corresponding_node.change_events.insert(Op::Move);
    }

    let node_id = trees.node(corresponding).id.clone();
    let draft = OpDraft::new(Op::Move, corresponding, loser.side)
        .corresponding(loser)
        .conflict(conflict)
        .new_name(new_name)
        .new_parent(new_parent)
        .origin_path(loser_path)
        .destination_path(destination);
    ops.push(draft, node_id.as_ref());
    Ok(())
}

/// Move every locally created or edited file below `start` into the rescue
/// folder before a delete wipes the subtree.
fn rescue_modified_local_nodes(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    conflict: Conflict,
    start: NodeRef,
) {
    if start.side != ReplicaSide::Local {
        return;
    }
    let mut stack = vec![start.idx];
    while let Some(idx) = stack.pop() {
        stack.extend(trees.local.node(idx).children().iter().copied());
        generate_rescue_operation(
            trees,
            ops,
            conflict,
            NodeRef {
                side: ReplicaSide::Local,
                idx,
            },
        );
    }
}

fn generate_rescue_operation(
    trees: &mut TreePair,
    ops: &mut SyncOperationList,
    conflict: Conflict,
    node_ref: NodeRef,
) {
    {
        let node = trees.node(node_ref);
        if node.status == NodeStatus::ConflictOpGenerated
            || node.kind != NodeKind::File
            || (!node.has_event(Op::Edit)
                && !node.has_event(Op::Create)
                && !node.has_event(Op::Move))
        {
            return;
        }
    }

    let path = trees.path_of(node_ref);
    info!(path = %path.display(), "Rescuing locally modified file");

    let parent_id = trees
        .node(node_ref)
        .parent()
        .and_then(|p| trees.local.node(p).id.clone())
        .unwrap_or_default();
    let node_id = trees.node(node_ref).id.clone();
    {
        let node = trees.node_mut(node_ref);
        node.move_origin = Some(MoveOrigin {
            path: path.clone(),
            parent_id,
        });
        node.change_events = OpSet::single(Op::Move);
        node.status = NodeStatus::ConflictOpGenerated;
    }

    let draft = OpDraft::new(Op::Move, node_ref, ReplicaSide::Local)
        .corresponding(node_ref)
        .conflict(conflict)
        .rescue()
        .origin_path(path);
    ops.push(draft, node_id.as_ref());
}
