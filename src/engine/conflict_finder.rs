//! Step 4: find conflicts between the two update trees

use super::reconcile::{
    corresponding_node, corresponding_node_direct, is_pseudo_conflict, Snapshots,
};
use crate::domain::{Conflict, ConflictKind, ConflictQueue, NodeRef, TreePair};
use crate::infrastructure::database::DbCache;
use crate::shared::utils::is_descendant_or_equal;
use crate::shared::{NodeKind, Op, ReplicaSide};
use tracing::info;

/// Walk both trees breadth-first and queue at most one conflict per node
/// pair, ordered by severity and depth.
pub fn find_conflicts(
    trees: &mut TreePair,
    cache: &DbCache,
    snapshots: Snapshots<'_>,
    sync_fully_completed: bool,
) -> ConflictQueue {
    let mut queue = ConflictQueue::new();
    let mut local_move_dirs: Vec<NodeRef> = Vec::new();
    let mut remote_move_dirs: Vec<NodeRef> = Vec::new();

    let mut visit_order: Vec<NodeRef> = Vec::new();
    for side in [ReplicaSide::Local, ReplicaSide::Remote] {
        for idx in trees.tree(side).bfs() {
            visit_order.push(NodeRef { side, idx });
        }
    }

    for node_ref in visit_order {
        let (kind, events) = {
            let node = trees.node(node_ref);
            (node.kind, node.change_events)
        };
        if kind == NodeKind::Directory && events.contains(Op::Move) {
            match node_ref.side {
                ReplicaSide::Local => local_move_dirs.push(node_ref),
                ReplicaSide::Remote => remote_move_dirs.push(node_ref),
            }
        }

        if events.contains(Op::Create)
            && !trees.node(node_ref).conflict_already_considered(ConflictKind::CreateCreate)
        {
            if let Some(conflict) =
                check_create_create(trees, cache, snapshots, node_ref, sync_fully_completed)
            {
                push(&mut queue, trees, conflict);
            }
        }

        if events.contains(Op::Edit)
            && !trees.node(node_ref).conflict_already_considered(ConflictKind::EditEdit)
        {
            if let Some(conflict) = check_edit_edit(trees, cache, snapshots, node_ref) {
                push(&mut queue, trees, conflict);
            }
        }

        if events.contains(Op::Delete) {
            if kind == NodeKind::Directory {
                for conflict in check_parent_delete(trees, cache, node_ref, Op::Move) {
                    push(&mut queue, trees, conflict);
                }
                for conflict in check_parent_delete(trees, cache, node_ref, Op::Create) {
                    push(&mut queue, trees, conflict);
                }
            }
            if let Some(conflict) = check_move_delete(trees, cache, node_ref) {
                push(&mut queue, trees, conflict);
            }
            if let Some(conflict) = check_edit_delete(trees, cache, node_ref) {
                push(&mut queue, trees, conflict);
            }
        }

        if events.contains(Op::Move) {
            if let Some(conflict) = check_move_create(trees, cache, node_ref) {
                push(&mut queue, trees, conflict);
            }
            if !trees.node(node_ref).conflict_already_considered(ConflictKind::MoveMoveDest) {
                if let Some(conflict) = check_move_move_dest(trees, cache, node_ref) {
                    push(&mut queue, trees, conflict);
                }
            }
            if !trees.node(node_ref).conflict_already_considered(ConflictKind::MoveMoveSource) {
                if let Some(conflict) = check_move_move_source(trees, cache, snapshots, node_ref) {
                    push(&mut queue, trees, conflict);
                }
            }
        }
    }

    for conflict in check_move_move_cycles(trees, cache, &local_move_dirs, &remote_move_dirs) {
        push(&mut queue, trees, conflict);
    }

    queue
}

fn push(queue: &mut ConflictQueue, trees: &TreePair, conflict: Conflict) {
    info!(
        kind = %conflict.kind,
        local = %trees.path_of(conflict.local()).display(),
        remote = %trees.path_of(conflict.remote()).display(),
        "Conflict found"
    );
    queue.push(conflict, trees);
}

fn mark_considered(trees: &mut TreePair, node_ref: NodeRef, kind: ConflictKind) {
    trees.node_mut(node_ref).conflicts_considered.push(kind);
}

fn check_create_create(
    trees: &mut TreePair,
    cache: &DbCache,
    snapshots: Snapshots<'_>,
    create_ref: NodeRef,
    sync_fully_completed: bool,
) -> Option<Conflict> {
    let parent_ref = NodeRef {
        side: create_ref.side,
        idx: trees.node(create_ref).parent()?,
    };
    let corresponding_parent = if sync_fully_completed {
        corresponding_node_direct(trees, cache, parent_ref)?
    } else {
        corresponding_node(trees, cache, parent_ref)?
    };

    let normalized = trees.node(create_ref).normalized.clone();
    let other_tree = trees.tree(corresponding_parent.side);
    let candidate_idx =
        other_tree.child_by_name_except(corresponding_parent.idx, &normalized, Op::Delete)?;
    let candidate = NodeRef {
        side: corresponding_parent.side,
        idx: candidate_idx,
    };
    if !trees.node(candidate).has_event(Op::Create) {
        return None;
    }
    if is_pseudo_conflict(trees, snapshots, create_ref, candidate) {
        return None;
    }
    mark_considered(trees, candidate, ConflictKind::CreateCreate);
    Some(Conflict::new(create_ref, candidate, ConflictKind::CreateCreate))
}

fn check_edit_edit(
    trees: &mut TreePair,
    cache: &DbCache,
    snapshots: Snapshots<'_>,
    edit_ref: NodeRef,
) -> Option<Conflict> {
    let corresponding = corresponding_node_direct(trees, cache, edit_ref)?;
    if !trees.node(corresponding).has_event(Op::Edit) {
        return None;
    }
    if is_pseudo_conflict(trees, snapshots, edit_ref, corresponding) {
        return None;
    }
    mark_considered(trees, corresponding, ConflictKind::EditEdit);
    Some(Conflict::new(edit_ref, corresponding, ConflictKind::EditEdit))
}

/// Moves or creates below a directory deleted on this side.
fn check_parent_delete(
    trees: &TreePair,
    cache: &DbCache,
    delete_ref: NodeRef,
    event: Op,
) -> Vec<Conflict> {
    let kind = match event {
        Op::Move => ConflictKind::MoveParentDelete,
        _ => ConflictKind::CreateParentDelete,
    };
    let Some(corresponding_dir) = corresponding_node_direct(trees, cache, delete_ref) else {
        return Vec::new();
    };
    if trees.node(corresponding_dir).has_event(Op::Delete) {
        return Vec::new();
    }
    let other_tree = trees.tree(corresponding_dir.side);
    other_tree
        .descendants_with_event(corresponding_dir.idx, event)
        .into_iter()
        .map(|idx| {
            Conflict::new(
                delete_ref,
                NodeRef {
                    side: corresponding_dir.side,
                    idx,
                },
                kind,
            )
        })
        .collect()
}

fn check_move_delete(trees: &TreePair, cache: &DbCache, delete_ref: NodeRef) -> Option<Conflict> {
    let corresponding = corresponding_node_direct(trees, cache, delete_ref)?;
    if !trees.node(corresponding).has_event(Op::Move) {
        return None;
    }
    Some(Conflict::new(delete_ref, corresponding, ConflictKind::MoveDelete))
}

fn check_edit_delete(trees: &TreePair, cache: &DbCache, delete_ref: NodeRef) -> Option<Conflict> {
    if trees.node(delete_ref).kind == NodeKind::Directory {
        return None;
    }
    let corresponding = corresponding_node_direct(trees, cache, delete_ref)?;
    if !trees.node(corresponding).has_event(Op::Edit) {
        return None;
    }
    Some(Conflict::new(delete_ref, corresponding, ConflictKind::EditDelete))
}

/// A move whose destination name is taken by a fresh create on the other
/// side.
fn check_move_create(trees: &TreePair, cache: &DbCache, move_ref: NodeRef) -> Option<Conflict> {
    let parent_ref = NodeRef {
        side: move_ref.side,
        idx: trees.node(move_ref).parent()?,
    };
    let corresponding_parent = corresponding_node_direct(trees, cache, parent_ref)?;
    let normalized = &trees.node(move_ref).normalized;
    let other_tree = trees.tree(corresponding_parent.side);
    let candidate_idx =
        other_tree.child_by_name_except(corresponding_parent.idx, normalized, Op::Delete)?;
    let candidate = NodeRef {
        side: corresponding_parent.side,
        idx: candidate_idx,
    };
    if !trees.node(candidate).has_event(Op::Create) {
        return None;
    }
    Some(Conflict::new(move_ref, candidate, ConflictKind::MoveCreate))
}

fn check_move_move_dest(
    trees: &mut TreePair,
    cache: &DbCache,
    move_ref: NodeRef,
) -> Option<Conflict> {
    let parent_ref = NodeRef {
        side: move_ref.side,
        idx: trees.node(move_ref).parent()?,
    };
    let corresponding_parent = corresponding_node_direct(trees, cache, parent_ref)?;
    let normalized = trees.node(move_ref).normalized.clone();
    let other_tree = trees.tree(corresponding_parent.side);
    let candidate_idx =
        other_tree.child_by_name_except(corresponding_parent.idx, &normalized, Op::Delete)?;
    let candidate = NodeRef {
        side: corresponding_parent.side,
        idx: candidate_idx,
    };
    let candidate_node = trees.node(candidate);
    if !candidate_node.has_event(Op::Move) {
        return None;
    }
    // Two different objects landing on one name, not the same object.
    if candidate_node.db_id == trees.node(move_ref).db_id {
        return None;
    }
    mark_considered(trees, candidate, ConflictKind::MoveMoveDest);
    Some(Conflict::new(move_ref, candidate, ConflictKind::MoveMoveDest))
}

fn check_move_move_source(
    trees: &mut TreePair,
    cache: &DbCache,
    snapshots: Snapshots<'_>,
    move_ref: NodeRef,
) -> Option<Conflict> {
    let corresponding = corresponding_node_direct(trees, cache, move_ref)?;
    if !trees.node(corresponding).has_event(Op::Move) {
        return None;
    }
    if is_pseudo_conflict(trees, snapshots, move_ref, corresponding) {
        return None;
    }
    mark_considered(trees, corresponding, ConflictKind::MoveMoveSource);
    Some(Conflict::new(move_ref, corresponding, ConflictKind::MoveMoveSource))
}

/// Directory moves on opposite sides whose combined effect would nest each
/// directory inside the other.
fn check_move_move_cycles(
    trees: &TreePair,
    cache: &DbCache,
    local_move_dirs: &[NodeRef],
    remote_move_dirs: &[NodeRef],
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for &local_ref in local_move_dirs {
        for &remote_ref in remote_move_dirs {
            let local_node = trees.node(local_ref);
            let remote_node = trees.node(remote_ref);
            if local_node.db_id.is_some() && local_node.db_id == remote_node.db_id {
                continue;
            }
            let (Some(local_id), Some(remote_id)) = (&local_node.id, &remote_node.id) else {
                continue;
            };
            let Some(local_db_path) = cache.path_by_node_id(ReplicaSide::Local, local_id) else {
                continue;
            };
            let Some(remote_db_path) = cache.path_by_node_id(ReplicaSide::Remote, remote_id)
            else {
                continue;
            };
            // Nested in the database already: no flip can happen.
            if is_descendant_or_equal(&local_db_path, &remote_db_path)
                || is_descendant_or_equal(&remote_db_path, &local_db_path)
            {
                continue;
            }

            let Some(corresponding_local) = corresponding_node_direct(trees, cache, remote_ref)
            else {
                continue;
            };
            let Some(corresponding_remote) = corresponding_node_direct(trees, cache, local_ref)
            else {
                continue;
            };
            let local_below = trees
                .local
                .is_self_or_below(local_ref.idx, corresponding_local.idx);
            let remote_below = trees
                .remote
                .is_self_or_below(remote_ref.idx, corresponding_remote.idx);
            if local_below && remote_below {
                conflicts.push(Conflict::new(local_ref, remote_ref, ConflictKind::MoveMoveCycle));
            }
        }
    }
    conflicts
}
