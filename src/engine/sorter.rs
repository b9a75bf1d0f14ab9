//! Step 7: order operations into an executable schedule
//!
//! Rewrite rules are iterated to a fixed point so that every prefix of the
//! schedule is admissible on the target filesystem. Reorderings are recorded
//! as dependencies; a dependency cycle is broken by replacing the schedule
//! with a single temporary rename and restarting the pass.

use super::reconcile::corresponding_node;
use crate::domain::{NodeRef, OpDraft, OpId, SyncOperationList, TreePair};
use crate::infrastructure::database::DbCache;
use crate::shared::utils::{is_descendant_or_equal, random_suffix};
use crate::shared::{NodeKind, Op, SyncResult};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What the sorting step reports back to the pass.
#[derive(Debug, Default)]
pub struct SorterOutcome {
    /// The schedule was truncated (cycle break or impossible first move);
    /// another pass must follow.
    pub restart: bool,
}

const MAX_SORT_ROUNDS: usize = 1_000;

pub fn sort_operations(
    ops: &mut SyncOperationList,
    trees: &TreePair,
    cache: &DbCache,
) -> SyncResult<SorterOutcome> {
    let mut sorter = Sorter {
        trees,
        reorderings: Vec::new(),
        changed: false,
    };

    let mut rounds = 0;
    let cycle = loop {
        rounds += 1;
        if rounds > MAX_SORT_ROUNDS {
            warn!("Operation sorting did not converge, proceeding with current order");
            break Vec::new();
        }
        sorter.changed = false;
        sorter.fix_delete_before_move(ops);
        sorter.fix_move_before_create(ops);
        sorter.fix_move_before_delete(ops);
        sorter.fix_create_before_move(ops);
        sorter.fix_delete_before_create(ops);
        sorter.fix_move_before_move_occupied(ops);
        sorter.fix_create_before_create(ops);
        sorter.fix_edit_before_move(ops);
        sorter.fix_move_before_move_hierarchy_flip(ops);
        if !sorter.changed {
            break Vec::new();
        }
        let cycle = find_cycle(&sorter.reorderings);
        if !cycle.is_empty() {
            break cycle;
        }
    };

    if !cycle.is_empty() {
        if break_cycle(ops, trees, cache, &cycle) {
            return Ok(SorterOutcome { restart: true });
        }
    }

    if fix_impossible_first_move(ops, trees, cache) {
        return Ok(SorterOutcome { restart: true });
    }

    Ok(SorterOutcome::default())
}

struct Sorter<'a> {
    trees: &'a TreePair,
    reorderings: Vec<(OpId, OpId)>,
    changed: bool,
}

impl<'a> Sorter<'a> {
    fn node(&self, node_ref: NodeRef) -> &crate::domain::Node {
        self.trees.node(node_ref)
    }

    fn parent_id(&self, node_ref: NodeRef) -> Option<String> {
        let tree = self.trees.tree(node_ref.side);
        tree.node(node_ref.idx)
            .parent()
            .and_then(|p| tree.node(p).id.clone())
    }

    fn move_after(&mut self, ops: &mut SyncOperationList, first: OpId, second: OpId) {
        if ops.move_first_after_second(first, second) {
            debug!(first, second, "Operation reordered");
            let pair = (second, first);
            if !self.reorderings.contains(&pair) {
                self.reorderings.push(pair);
            }
            self.changed = true;
        }
    }

    /// Delete before Move: a move destination reusing a deleted name must
    /// wait for the delete to free it.
    fn fix_delete_before_move(&mut self, ops: &mut SyncOperationList) {
        let deletes = ops.ids_by_type(Op::Delete);
        let moves = ops.ids_by_type(Op::Move);
        for &delete_id in &deletes {
            for &move_id in &moves {
                let (Some(delete_op), Some(move_op)) = (ops.get(delete_id), ops.get(move_id))
                else {
                    continue;
                };
                if delete_op.target_side != move_op.target_side {
                    continue;
                }
                let delete_node = self.node(delete_op.affected);
                let move_node = self.node(move_op.affected);
                let same_parent = match (
                    self.parent_id(delete_op.affected),
                    self.parent_id(move_op.affected),
                ) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                if same_parent && delete_node.normalized == move_node.normalized {
                    self.move_after(ops, move_id, delete_id);
                }
            }
        }
    }

    /// Move before Create: a create reusing the origin name of a move must
    /// wait for the move to vacate it.
    fn fix_move_before_create(&mut self, ops: &mut SyncOperationList) {
        let moves = ops.ids_by_type(Op::Move);
        let creates = ops.ids_by_type(Op::Create);
        for &move_id in &moves {
            for &create_id in &creates {
                let (Some(move_op), Some(create_op)) = (ops.get(move_id), ops.get(create_id))
                else {
                    continue;
                };
                if move_op.target_side != create_op.target_side {
                    continue;
                }
                let move_node = self.node(move_op.affected);
                let create_node = self.node(create_op.affected);
                let Some(origin) = &move_node.move_origin else {
                    continue;
                };
                let origin_name = origin
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let same_parent = self
                    .parent_id(create_op.affected)
                    .map(|p| p == origin.parent_id)
                    .unwrap_or(false);
                if same_parent
                    && crate::shared::utils::normalized_name(&origin_name)
                        == create_node.normalized
                {
                    self.move_after(ops, create_id, move_id);
                }
            }
        }
    }

    /// Move before Delete: moves out of a directory must happen before the
    /// directory is deleted.
    fn fix_move_before_delete(&mut self, ops: &mut SyncOperationList) {
        let deletes = ops.ids_by_type(Op::Delete);
        let moves = ops.ids_by_type(Op::Move);
        for &delete_id in &deletes {
            for &move_id in &moves {
                let (Some(delete_op), Some(move_op)) = (ops.get(delete_id), ops.get(move_id))
                else {
                    continue;
                };
                if delete_op.target_side != move_op.target_side {
                    continue;
                }
                if self.node(delete_op.affected).kind != NodeKind::Directory {
                    continue;
                }
                let delete_path = self.trees.path_of(delete_op.affected);
                let Some(origin) = &self.node(move_op.affected).move_origin else {
                    continue;
                };
                if origin.path != delete_path
                    && is_descendant_or_equal(&origin.path, &delete_path)
                {
                    self.move_after(ops, delete_id, move_id);
                }
            }
        }
    }

    /// Create before Move: moving into a directory created this pass must
    /// wait for the create.
    fn fix_create_before_move(&mut self, ops: &mut SyncOperationList) {
        let creates = ops.ids_by_type(Op::Create);
        let moves = ops.ids_by_type(Op::Move);
        for &create_id in &creates {
            for &move_id in &moves {
                let (Some(create_op), Some(move_op)) = (ops.get(create_id), ops.get(move_id))
                else {
                    continue;
                };
                if create_op.target_side != move_op.target_side {
                    continue;
                }
                if self.node(create_op.affected).kind != NodeKind::Directory {
                    continue;
                }
                let created_id = self.node(create_op.affected).id.clone();
                let move_parent = self.parent_id(move_op.affected);
                if created_id.is_some() && created_id == move_parent {
                    self.move_after(ops, move_id, create_id);
                }
            }
        }
    }

    /// Delete before Create: re-creating a name needs the old entry gone.
    fn fix_delete_before_create(&mut self, ops: &mut SyncOperationList) {
        let deletes = ops.ids_by_type(Op::Delete);
        let creates = ops.ids_by_type(Op::Create);
        for &delete_id in &deletes {
            for &create_id in &creates {
                let (Some(delete_op), Some(create_op)) = (ops.get(delete_id), ops.get(create_id))
                else {
                    continue;
                };
                if delete_op.target_side != create_op.target_side {
                    continue;
                }
                let delete_node = self.node(delete_op.affected);
                let create_node = self.node(create_op.affected);
                let same_parent = match (
                    self.parent_id(delete_op.affected),
                    self.parent_id(create_op.affected),
                ) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                if same_parent && delete_node.normalized == create_node.normalized {
                    self.move_after(ops, create_id, delete_id);
                }
            }
        }
    }

    /// Move before Move (occupation): A→temp before B→A.
    fn fix_move_before_move_occupied(&mut self, ops: &mut SyncOperationList) {
        let moves = ops.ids_by_type(Op::Move);
        for &claiming_id in &moves {
            for &vacating_id in &moves {
                if claiming_id == vacating_id {
                    continue;
                }
                let (Some(claiming), Some(vacating)) =
                    (ops.get(claiming_id), ops.get(vacating_id))
                else {
                    continue;
                };
                if claiming.target_side != vacating.target_side {
                    continue;
                }
                let Some(origin) = &self.node(vacating.affected).move_origin else {
                    continue;
                };
                let origin_name = origin
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let claiming_parent = self.parent_id(claiming.affected);
                let claims_origin = claiming_parent
                    .map(|p| p == origin.parent_id)
                    .unwrap_or(false)
                    && crate::shared::utils::normalized_name(&origin_name)
                        == self.node(claiming.affected).normalized;
                if claims_origin {
                    self.move_after(ops, claiming_id, vacating_id);
                }
            }
        }
    }

    /// Create before Create: a child create comes after its ancestor's.
    fn fix_create_before_create(&mut self, ops: &mut SyncOperationList) {
        loop {
            let mut violation: Option<(OpId, OpId)> = None;
            let creates = ops.ids_by_type(Op::Create);
            let index_of: HashMap<OpId, usize> = ops
                .order()
                .iter()
                .enumerate()
                .map(|(index, id)| (*id, index))
                .collect();

            'scan: for &create_id in &creates {
                let Some(create_op) = ops.get(create_id) else { continue };
                let create_index = index_of[&create_id];
                let tree = self.trees.tree(create_op.affected.side);
                let mut current = tree.node(create_op.affected.idx).parent();
                let mut worst: Option<(OpId, usize)> = None;
                while let Some(parent_idx) = current {
                    let parent = tree.node(parent_idx);
                    if parent.has_event(Op::Create) {
                        if let Some(id) = &parent.id {
                            for &ancestor_op_id in ops.ids_for_node(id) {
                                let Some(ancestor_op) = ops.get(ancestor_op_id) else { continue };
                                if ancestor_op.op_type == Op::Create
                                    && ancestor_op.target_side == create_op.target_side
                                {
                                    let ancestor_index = index_of[&ancestor_op_id];
                                    if ancestor_index > create_index
                                        && worst.map(|(_, i)| ancestor_index > i).unwrap_or(true)
                                    {
                                        worst = Some((ancestor_op_id, ancestor_index));
                                    }
                                }
                            }
                        }
                    }
                    current = parent.parent();
                }
                if let Some((ancestor_op_id, _)) = worst {
                    violation = Some((create_id, ancestor_op_id));
                    break 'scan;
                }
            }

            match violation {
                Some((create_id, ancestor_op_id)) => {
                    self.move_after(ops, create_id, ancestor_op_id);
                }
                None => break,
            }
        }
    }

    /// Edit after Move on the same node: storage addresses the post-move
    /// path.
    fn fix_edit_before_move(&mut self, ops: &mut SyncOperationList) {
        let edits = ops.ids_by_type(Op::Edit);
        let moves = ops.ids_by_type(Op::Move);
        for &edit_id in &edits {
            for &move_id in &moves {
                let (Some(edit_op), Some(move_op)) = (ops.get(edit_id), ops.get(move_id)) else {
                    continue;
                };
                if edit_op.target_side != move_op.target_side {
                    continue;
                }
                if self.node(edit_op.affected).id == self.node(move_op.affected).id {
                    self.move_after(ops, edit_id, move_id);
                }
            }
        }
    }

    /// Move before Move (hierarchy flip): when two directory moves flip a
    /// parent/child relationship, the outer one goes first.
    fn fix_move_before_move_hierarchy_flip(&mut self, ops: &mut SyncOperationList) {
        let moves = ops.ids_by_type(Op::Move);
        for &x_id in &moves {
            for &y_id in &moves {
                if x_id == y_id {
                    continue;
                }
                let (Some(x_op), Some(y_op)) = (ops.get(x_id), ops.get(y_id)) else {
                    continue;
                };
                if x_op.target_side != y_op.target_side {
                    continue;
                }
                let x_node = self.node(x_op.affected);
                let y_node = self.node(y_op.affected);
                if x_node.kind != NodeKind::Directory || y_node.kind != NodeKind::Directory {
                    continue;
                }
                let (Some(x_origin), Some(y_origin)) = (&x_node.move_origin, &y_node.move_origin)
                else {
                    continue;
                };
                let x_dest = self.trees.path_of(x_op.affected);
                let y_dest = self.trees.path_of(y_op.affected);
                let x_below_y = x_dest != y_dest && is_descendant_or_equal(&x_dest, &y_dest);
                if x_below_y {
                    let y_was_below_x = y_origin.path != x_origin.path
                        && is_descendant_or_equal(&y_origin.path, &x_origin.path);
                    if y_was_below_x {
                        self.move_after(ops, x_id, y_id);
                    }
                }
            }
        }
    }
}

/// Find a dependency cycle among the recorded reorderings. Edges read
/// `(earlier, later)`: the second op must run after the first.
fn find_cycle(reorderings: &[(OpId, OpId)]) -> Vec<OpId> {
    let mut adjacency: HashMap<OpId, Vec<OpId>> = HashMap::new();
    for (earlier, later) in reorderings {
        adjacency.entry(*earlier).or_default().push(*later);
    }

    let mut visited: HashSet<OpId> = HashSet::new();
    for &start in adjacency.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        while let Some((node, next_child)) = stack.pop() {
            if next_child == 0 {
                if visited.contains(&node) {
                    continue;
                }
                path.push(node);
                on_path.insert(node);
            }
            let children = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if next_child < children.len() {
                let child = children[next_child];
                stack.push((node, next_child + 1));
                if on_path.contains(&child) {
                    let cycle_start = path.iter().position(|id| *id == child).unwrap_or(0);
                    return path[cycle_start..].to_vec();
                }
                if !visited.contains(&child) {
                    stack.push((child, 0));
                }
            } else {
                visited.insert(node);
                on_path.remove(&node);
                path.pop();
            }
        }
    }
    Vec::new()
}

/// Replace the schedule with one temporary rename of a node in the cycle;
/// the rest of the work is left to the next pass.
fn break_cycle(
    ops: &mut SyncOperationList,
    trees: &TreePair,
    cache: &DbCache,
    cycle: &[OpId],
) -> bool {
    let match_id = cycle
        .iter()
        .find(|id| ops.get(**id).map(|op| op.op_type) == Some(Op::Delete))
        .or_else(|| {
            cycle
                .iter()
                .find(|id| ops.get(**id).map(|op| op.op_type) == Some(Op::Move))
        })
        .copied();
    // A cycle always contains a delete or a move.
    let Some(match_id) = match_id else {
        return false;
    };
    let Some(match_op) = ops.get(match_id) else {
        return false;
    };
    let affected = match_op.affected;
    let omit = match_op.omit;
    let Some(corresponding) = corresponding_node(trees, cache, affected) else {
        warn!("No corresponding node for the cycle-breaking rename");
        return false;
    };

    let corresponding_node_data = trees.node(corresponding);
    let new_name = format!("{}-{}", corresponding_node_data.name, random_suffix());
    info!(
        from = %corresponding_node_data.name,
        to = %new_name,
        "Breaking operation cycle with a temporary rename"
    );
    let parent = trees
        .tree(corresponding.side)
        .node(corresponding.idx)
        .parent()
        .map(|idx| NodeRef {
            side: corresponding.side,
            idx,
        });

    let node_id = corresponding_node_data.id.clone();
    let mut draft = OpDraft::new(Op::Move, affected, corresponding.side)
        .corresponding(corresponding)
        .omit(omit)
        .new_name(new_name)
        .origin_path(trees.path_of(corresponding))
        .breaking_cycle();
    if let Some(parent) = parent {
        // Parent unchanged, but the executor needs it to address the rename.
        draft = draft.new_parent(parent);
    }
    let rename_id = ops.push(draft, node_id.as_ref());
    ops.retain_in_order(&[rename_id]);
    true
}

/// First-scheduled directory move whose destination lies inside its own
/// source cannot run first: keep only the other side's operations up to and
/// including the deepest move-directory between source and destination.
fn fix_impossible_first_move(
    ops: &mut SyncOperationList,
    trees: &TreePair,
    cache: &DbCache,
) -> bool {
    let Some(&first_id) = ops.order().first() else {
        return false;
    };
    let Some(first) = ops.get(first_id) else {
        return false;
    };
    if first.op_type != Op::Move {
        return false;
    }
    let node = trees.node(first.affected);
    if node.kind != NodeKind::Directory {
        return false;
    }
    let Some(origin) = &node.move_origin else {
        return false;
    };
    let destination = trees.path_of(first.affected);
    if destination == origin.path || !is_descendant_or_equal(&destination, &origin.path) {
        return false;
    }

    let parent_ref = match trees.tree(first.affected.side).node(first.affected.idx).parent() {
        Some(idx) => NodeRef {
            side: first.affected.side,
            idx,
        },
        None => return false,
    };
    let Some(corresponding_dest_parent) = corresponding_node(trees, cache, parent_ref) else {
        return false;
    };
    let Some(corresponding_source) = corresponding_node(trees, cache, first.affected) else {
        return false;
    };

    // Move-directories on the path from source up to the destination parent
    // in the other tree.
    let other_tree = trees.tree(corresponding_source.side);
    let mut move_dirs = Vec::new();
    let mut current = other_tree.node(corresponding_source.idx).parent();
    let mut cursor = corresponding_source.idx;
    while let Some(parent_idx) = current {
        if cursor == corresponding_dest_parent.idx {
            break;
        }
        let parent = other_tree.node(parent_idx);
        if parent.kind == NodeKind::Directory && parent.has_event(Op::Move) {
            move_dirs.push(parent_idx);
        }
        cursor = parent_idx;
        current = parent.parent();
    }
    if move_dirs.is_empty() {
        return false;
    }

    // The earliest-scheduled op affecting one of those directories.
    let mut gate: Option<OpId> = None;
    'outer: for &op_id in ops.order() {
        let Some(op) = ops.get(op_id) else { continue };
        for &dir_idx in &move_dirs {
            if op.affected.side == corresponding_source.side && op.affected.idx == dir_idx {
                gate = Some(op_id);
                break 'outer;
            }
        }
    }
    let Some(gate) = gate else {
        return false;
    };

    let target = corresponding_dest_parent.side;
    let mut kept = Vec::new();
    for &op_id in ops.order() {
        let Some(op) = ops.get(op_id) else { continue };
        if op_id == gate {
            kept.push(op_id);
            break;
        }
        if op.target_side == target || op.omit {
            kept.push(op_id);
        }
    }
    info!(
        kept = kept.len(),
        dropped = ops.len() - kept.len(),
        "Impossible first move: truncating schedule"
    );
    ops.retain_in_order(&kept);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeSeed, OpDraft, UpdateTree};
    use crate::infrastructure::database::{DbCache, DbNode};
    use crate::shared::ReplicaSide;
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

    fn trees() -> TreePair {
        TreePair::new(
            UpdateTree::new(ReplicaSide::Local, 1, "local-root"),
            UpdateTree::new(ReplicaSide::Remote, 1, "remote-root"),
        )
    }

    fn local_ref(trees: &TreePair, idx: crate::domain::NodeIdx) -> NodeRef {
        let _ = trees;
        NodeRef {
            side: ReplicaSide::Local,
            idx,
        }
    }

    #[test]
    fn delete_frees_name_before_move_claims_it() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut pair = trees();
        let root = pair.local.root();
        let doomed = pair
            .local
            .insert(
                NodeSeed::new("name.txt", NodeKind::File).id("l-old").event(Op::Delete),
                root,
            )
            .unwrap();
        let mover = pair
            .local
            .insert(
                NodeSeed::new("name.txt", NodeKind::File)
                    .id("l-mov")
                    .event(Op::Move)
                    .move_origin("other.txt", "local-root"),
                root,
            )
            .unwrap();

        let mut ops = SyncOperationList::new();
        let move_id = ops.push(
            OpDraft::new(Op::Move, local_ref(&pair, mover), ReplicaSide::Remote),
            Some(&"l-mov".to_string()),
        );
        let delete_id = ops.push(
            OpDraft::new(Op::Delete, local_ref(&pair, doomed), ReplicaSide::Remote),
            Some(&"l-old".to_string()),
        );

        let outcome = sort_operations(&mut ops, &pair, &cache).unwrap();
        assert!(!outcome.restart);
        assert_eq!(ops.order(), &[delete_id, move_id]);
        assert_eq!(ops.get(move_id).unwrap().parent_op, Some(delete_id));
    }

    #[test]
    fn child_create_runs_after_parent_create() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut pair = trees();
        let root = pair.local.root();
        let parent = pair
            .local
            .insert(
                NodeSeed::new("dir", NodeKind::Directory).id("l-dir").event(Op::Create),
                root,
            )
            .unwrap();
        let child = pair
            .local
            .insert(
                NodeSeed::new("f.txt", NodeKind::File).id("l-f").event(Op::Create),
                parent,
            )
            .unwrap();

        let mut ops = SyncOperationList::new();
        let child_id = ops.push(
            OpDraft::new(Op::Create, local_ref(&pair, child), ReplicaSide::Remote),
            Some(&"l-f".to_string()),
        );
        let parent_id = ops.push(
            OpDraft::new(Op::Create, local_ref(&pair, parent), ReplicaSide::Remote),
            Some(&"l-dir".to_string()),
        );

        sort_operations(&mut ops, &pair, &cache).unwrap();
        assert_eq!(ops.order(), &[parent_id, child_id]);
    }

    #[test]
    fn move_out_runs_before_directory_delete() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut pair = trees();
        let root = pair.local.root();
        let dir = pair
            .local
            .insert(
                NodeSeed::new("dir", NodeKind::Directory).id("l-dir").event(Op::Delete),
                root,
            )
            .unwrap();
        let _ = dir;
        let moved = pair
            .local
            .insert(
                NodeSeed::new("saved.txt", NodeKind::File)
                    .id("l-sav")
                    .event(Op::Move)
                    .move_origin("dir/saved.txt", "l-dir"),
                root,
            )
            .unwrap();

        let mut ops = SyncOperationList::new();
        let delete_id = ops.push(
            OpDraft::new(Op::Delete, local_ref(&pair, dir), ReplicaSide::Remote),
            Some(&"l-dir".to_string()),
        );
        let move_id = ops.push(
            OpDraft::new(Op::Move, local_ref(&pair, moved), ReplicaSide::Remote),
            Some(&"l-sav".to_string()),
        );

        sort_operations(&mut ops, &pair, &cache).unwrap();
        assert_eq!(ops.order(), &[move_id, delete_id]);
    }

    #[test]
    fn edit_runs_after_move_of_same_node() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut pair = trees();
        let root = pair.local.root();
        let node = pair
            .local
            .insert(
                NodeSeed::new("b.txt", NodeKind::File)
                    .id("l2")
                    .event(Op::Move)
                    .event(Op::Edit)
                    .move_origin("a.txt", "local-root"),
                root,
            )
            .unwrap();

        let mut ops = SyncOperationList::new();
        let edit_id = ops.push(
            OpDraft::new(Op::Edit, local_ref(&pair, node), ReplicaSide::Remote),
            Some(&"l2".to_string()),
        );
        let move_id = ops.push(
            OpDraft::new(Op::Move, local_ref(&pair, node), ReplicaSide::Remote),
            Some(&"l2".to_string()),
        );

        sort_operations(&mut ops, &pair, &cache).unwrap();
        assert_eq!(ops.order(), &[move_id, edit_id]);
    }

    #[test]
    fn swap_moves_detect_cycle_and_emit_temp_rename() {
        // a -> b and b -> a on the same side: each claims the other's origin.
        let mut rows = vec![root_row()];
        rows.push(DbNode {
            db_id: 2,
            parent_db_id: Some(1),
            local_id: Some("l-a".into()),
            remote_id: Some("r-a".into()),
            local_name: "a".into(),
            remote_name: "a".into(),
            kind: NodeKind::File,
            size: 1,
            created_at_local: Some(1),
            created_at_remote: Some(1),
            last_mod_local: Some(1),
            last_mod_remote: Some(1),
            checksum: None,
            syncing: false,
        });
        rows.push(DbNode {
            db_id: 3,
            parent_db_id: Some(1),
            local_id: Some("l-b".into()),
            remote_id: Some("r-b".into()),
            local_name: "b".into(),
            remote_name: "b".into(),
            kind: NodeKind::File,
            size: 1,
            created_at_local: Some(1),
            created_at_remote: Some(1),
            last_mod_local: Some(1),
            last_mod_remote: Some(1),
            checksum: None,
            syncing: false,
        });
        let cache = DbCache::from_nodes(rows).unwrap();

        let mut pair = trees();
        let lroot = pair.local.root();
        let a = pair
            .local
            .insert(
                NodeSeed::new("b", NodeKind::File)
                    .id("l-a")
                    .db_id(2)
                    .event(Op::Move)
                    .move_origin("a", "local-root"),
                lroot,
            )
            .unwrap();
        let b = pair
            .local
            .insert(
                NodeSeed::new("a", NodeKind::File)
                    .id("l-b")
                    .db_id(3)
                    .event(Op::Move)
                    .move_origin("b", "local-root"),
                lroot,
            )
            .unwrap();
        let rroot = pair.remote.root();
        pair.remote
            .insert(NodeSeed::new("a", NodeKind::File).id("r-a").db_id(2), rroot)
            .unwrap();
        pair.remote
            .insert(NodeSeed::new("b", NodeKind::File).id("r-b").db_id(3), rroot)
            .unwrap();

        let mut ops = SyncOperationList::new();
        ops.push(
            OpDraft::new(Op::Move, local_ref(&pair, a), ReplicaSide::Remote)
                .new_name("b"),
            Some(&"l-a".to_string()),
        );
        ops.push(
            OpDraft::new(Op::Move, local_ref(&pair, b), ReplicaSide::Remote)
                .new_name("a"),
            Some(&"l-b".to_string()),
        );

        let outcome = sort_operations(&mut ops, &pair, &cache).unwrap();
        assert!(outcome.restart);
        assert_eq!(ops.len(), 1);
        let rename = ops.iter_ordered().next().unwrap();
        assert!(rename.breaking_cycle);
        assert_eq!(rename.op_type, Op::Move);
        let name = rename.new_name.as_deref().unwrap();
        assert!(name.starts_with("a-") || name.starts_with("b-"), "{name}");
    }

    #[test]
    fn clean_schedule_is_untouched() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut pair = trees();
        let root = pair.local.root();
        let a = pair
            .local
            .insert(
                NodeSeed::new("a.txt", NodeKind::File).id("l-a").event(Op::Create),
                root,
            )
            .unwrap();
        let b = pair
            .local
            .insert(
                NodeSeed::new("b.txt", NodeKind::File).id("l-b").event(Op::Create),
                root,
            )
            .unwrap();

        let mut ops = SyncOperationList::new();
        let first = ops.push(
            OpDraft::new(Op::Create, local_ref(&pair, a), ReplicaSide::Remote),
            Some(&"l-a".to_string()),
        );
        let second = ops.push(
            OpDraft::new(Op::Create, local_ref(&pair, b), ReplicaSide::Remote),
            Some(&"l-b".to_string()),
        );

        let outcome = sort_operations(&mut ops, &pair, &cache).unwrap();
        assert!(!outcome.restart);
        assert_eq!(ops.order(), &[first, second]);
    }
}
