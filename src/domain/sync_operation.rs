//! Synchronization operations produced by reconciliation

use super::conflict::Conflict;
use super::update_tree::NodeRef;
use crate::shared::{NodeId, Op, ReplicaSide};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Identifier of a [`SyncOperation`] within its pass.
pub type OpId = u64;

/// One unit of work for the executor.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: OpId,
    pub op_type: Op,
    /// The node on which the original filesystem operation was performed.
    pub affected: NodeRef,
    /// The node on which the operation will be applied; absent for a pure
    /// Create, where the object does not exist on the target replica yet.
    pub corresponding: Option<NodeRef>,
    /// The replica on which the operation will be applied.
    pub target_side: ReplicaSide,
    /// When set, only the database is updated; no filesystem or RPC call.
    pub omit: bool,
    /// New name on the target replica (Create and Move only).
    pub new_name: Option<String>,
    /// New parent on the target replica (Move only).
    pub new_parent: Option<NodeRef>,
    pub conflict: Option<Conflict>,
    pub breaking_cycle: bool,
    pub dehydrated_placeholder: bool,
    pub rescue: bool,
    pub relative_origin_path: Option<PathBuf>,
    pub relative_destination_path: Option<PathBuf>,
    /// Operation that must complete successfully before this one starts.
    pub parent_op: Option<OpId>,
}

/// Builder used by the resolver and the generator to push operations.
#[derive(Debug, Clone)]
pub struct OpDraft {
    pub op_type: Op,
    pub affected: NodeRef,
    pub corresponding: Option<NodeRef>,
    pub target_side: ReplicaSide,
    pub omit: bool,
    pub new_name: Option<String>,
    pub new_parent: Option<NodeRef>,
    pub conflict: Option<Conflict>,
    pub breaking_cycle: bool,
    pub dehydrated_placeholder: bool,
    pub rescue: bool,
    pub relative_origin_path: Option<PathBuf>,
    pub relative_destination_path: Option<PathBuf>,
}

impl OpDraft {
    pub fn new(op_type: Op, affected: NodeRef, target_side: ReplicaSide) -> Self {
        Self {
            op_type,
            affected,
            corresponding: None,
            target_side,
            omit: false,
            new_name: None,
            new_parent: None,
            conflict: None,
            breaking_cycle: false,
            dehydrated_placeholder: false,
            rescue: false,
            relative_origin_path: None,
            relative_destination_path: None,
        }
    }

    pub fn corresponding(mut self, node: NodeRef) -> Self {
        self.corresponding = Some(node);
        self
    }

    pub fn omit(mut self, omit: bool) -> Self {
        self.omit = omit;
        self
    }

    pub fn new_name(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }

    pub fn new_parent(mut self, parent: NodeRef) -> Self {
        self.new_parent = Some(parent);
        self
    }

    pub fn conflict(mut self, conflict: Conflict) -> Self {
        self.conflict = Some(conflict);
        self
    }

    pub fn breaking_cycle(mut self) -> Self {
        self.breaking_cycle = true;
        self
    }

    pub fn dehydrated_placeholder(mut self) -> Self {
        self.dehydrated_placeholder = true;
        self
    }

    pub fn rescue(mut self) -> Self {
        self.rescue = true;
        self
    }

    pub fn origin_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.relative_origin_path = Some(path.into());
        self
    }

    pub fn destination_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.relative_destination_path = Some(path.into());
        self
    }
}

/// Ordered list of the pass's operations, indexed by id, type and node id.
#[derive(Debug, Default)]
pub struct SyncOperationList {
    ops: HashMap<OpId, SyncOperation>,
    order: Vec<OpId>,
    by_type: HashMap<Op, HashSet<OpId>>,
    by_node: HashMap<NodeId, Vec<OpId>>,
    next_id: OpId,
}

impl SyncOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, draft: OpDraft, affected_node_id: Option<&NodeId>) -> OpId {
        self.next_id += 1;
        let id = self.next_id;
        let op = SyncOperation {
            id,
            op_type: draft.op_type,
            affected: draft.affected,
            corresponding: draft.corresponding,
            target_side: draft.target_side,
            omit: draft.omit,
            new_name: draft.new_name,
            new_parent: draft.new_parent,
            conflict: draft.conflict,
            breaking_cycle: draft.breaking_cycle,
            dehydrated_placeholder: draft.dehydrated_placeholder,
            rescue: draft.rescue,
            relative_origin_path: draft.relative_origin_path,
            relative_destination_path: draft.relative_destination_path,
            parent_op: None,
        };
        self.by_type.entry(op.op_type).or_default().insert(id);
        if let Some(node_id) = affected_node_id {
            self.by_node.entry(node_id.clone()).or_default().push(id);
        }
        self.ops.insert(id, op);
        self.order.push(id);
        id
    }

    pub fn get(&self, id: OpId) -> Option<&SyncOperation> {
        self.ops.get(&id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut SyncOperation> {
        self.ops.get_mut(&id)
    }

    pub fn order(&self) -> &[OpId] {
        &self.order
    }

    pub fn ids_by_type(&self, op_type: Op) -> Vec<OpId> {
        let mut ids: Vec<OpId> = self
            .by_type
            .get(&op_type)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn ids_for_node(&self, node_id: &NodeId) -> &[OpId] {
        self.by_node.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.order.clear();
        self.by_type.clear();
        self.by_node.clear();
    }

    /// Position of an operation in the current order.
    pub fn index_of(&self, id: OpId) -> Option<usize> {
        self.order.iter().position(|other| *other == id)
    }

    /// Reorder so that `first` ends up right after `second`, recording the
    /// runtime dependency `first -> second` either way. Returns `true` when
    /// the order actually changed.
    pub fn move_first_after_second(&mut self, first: OpId, second: OpId) -> bool {
        if let Some(op) = self.ops.get_mut(&first) {
            op.parent_op = Some(second);
        }
        let (Some(first_pos), Some(second_pos)) = (self.index_of(first), self.index_of(second))
        else {
            return false;
        };
        if first_pos > second_pos {
            return false;
        }
        self.order.remove(first_pos);
        // `second` shifted left by one after the removal.
        self.order.insert(second_pos, first);
        true
    }

    /// Replace the whole schedule, dropping operations not listed.
    pub fn retain_in_order(&mut self, keep: &[OpId]) {
        let keep_set: HashSet<OpId> = keep.iter().copied().collect();
        self.ops.retain(|id, _| keep_set.contains(id));
        for set in self.by_type.values_mut() {
            set.retain(|id| keep_set.contains(id));
        }
        for ids in self.by_node.values_mut() {
            ids.retain(|id| keep_set.contains(id));
        }
        self.order = keep.to_vec();
    }

    pub fn iter_ordered(&self) -> impl Iterator<Item = &SyncOperation> {
        self.order.iter().filter_map(|id| self.ops.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::update_tree::NodeIdx;
    use pretty_assertions::assert_eq;

    fn node_ref() -> NodeRef {
        NodeRef {
            side: ReplicaSide::Local,
            idx: NodeIdx(0),
        }
    }

    fn push(list: &mut SyncOperationList, op_type: Op) -> OpId {
        list.push(OpDraft::new(op_type, node_ref(), ReplicaSide::Remote), None)
    }

    #[test]
    fn push_assigns_increasing_ids_in_order() {
        let mut list = SyncOperationList::new();
        let a = push(&mut list, Op::Create);
        let b = push(&mut list, Op::Delete);
        assert!(a < b);
        assert_eq!(list.order(), &[a, b]);
        assert_eq!(list.ids_by_type(Op::Create), vec![a]);
    }

    #[test]
    fn move_first_after_second_reorders_and_links() {
        let mut list = SyncOperationList::new();
        let a = push(&mut list, Op::Move);
        let b = push(&mut list, Op::Delete);
        let c = push(&mut list, Op::Create);

        assert!(list.move_first_after_second(a, c));
        assert_eq!(list.order(), &[b, c, a]);
        assert_eq!(list.get(a).unwrap().parent_op, Some(c));

        // Already in the right order: dependency recorded, no reorder.
        assert!(!list.move_first_after_second(a, b));
        assert_eq!(list.get(a).unwrap().parent_op, Some(b));
        assert_eq!(list.order(), &[b, c, a]);
    }

    #[test]
    fn retain_in_order_filters_schedule() {
        let mut list = SyncOperationList::new();
        let a = push(&mut list, Op::Move);
        let b = push(&mut list, Op::Delete);
        let c = push(&mut list, Op::Create);

        list.retain_in_order(&[c, a]);
        assert_eq!(list.order(), &[c, a]);
        assert!(list.get(b).is_none());
        assert_eq!(list.ids_by_type(Op::Delete), Vec::<OpId>::new());
    }

    #[test]
    fn node_index_tracks_ops() {
        let mut list = SyncOperationList::new();
        let node_id: NodeId = "n1".into();
        let a = list.push(
            OpDraft::new(Op::Move, node_ref(), ReplicaSide::Remote),
            Some(&node_id),
        );
        let b = list.push(
            OpDraft::new(Op::Edit, node_ref(), ReplicaSide::Remote),
            Some(&node_id),
        );
        assert_eq!(list.ids_for_node(&node_id), &[a, b]);
    }
}
