//! Typed conflicts and the priority queue feeding the resolver

use super::update_tree::{NodeRef, TreePair};
use crate::shared::{Op, ReplicaSide};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;

/// Recognised conflict shapes, declared in resolution priority order
/// (a smaller discriminant resolves first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum ConflictKind {
    /// An item was moved into a directory deleted on the other replica.
    MoveParentDelete,
    /// The same item was moved on one replica and deleted on the other.
    MoveDelete,
    /// A new item was created inside a directory deleted on the other replica.
    CreateParentDelete,
    /// A file was edited on one replica and deleted on the other.
    EditDelete,
    /// Both replicas moved the same item to different destinations.
    MoveMoveSource,
    /// Two different items were moved to the same destination name.
    MoveMoveDest,
    /// An item was moved onto a name taken by a newly created item.
    MoveCreate,
    /// Two directory moves whose combined effect would form a cycle.
    MoveMoveCycle,
    /// Both replicas created an item with the same name.
    CreateCreate,
    /// Both replicas edited the same file.
    EditEdit,
}

/// A conflict between one node of each tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub node: NodeRef,
    pub other: NodeRef,
    pub kind: ConflictKind,
}

impl Conflict {
    pub fn new(node: NodeRef, other: NodeRef, kind: ConflictKind) -> Self {
        Self { node, other, kind }
    }

    pub fn local(&self) -> NodeRef {
        if self.node.side == ReplicaSide::Local {
            self.node
        } else {
            self.other
        }
    }

    pub fn remote(&self) -> NodeRef {
        if self.node.side == ReplicaSide::Remote {
            self.node
        } else {
            self.other
        }
    }

    /// The conflict node carrying the given change event, if either does.
    pub fn node_with_event(&self, trees: &TreePair, op: Op) -> Option<NodeRef> {
        if trees.node(self.node).has_event(op) {
            Some(self.node)
        } else if trees.node(self.other).has_event(op) {
            Some(self.other)
        } else {
            None
        }
    }

    /// Path used to order two conflicts of the same kind.
    fn sort_path(&self, trees: &TreePair) -> PathBuf {
        match self.kind {
            ConflictKind::MoveParentDelete
            | ConflictKind::CreateParentDelete
            | ConflictKind::MoveDelete
            | ConflictKind::EditDelete => self
                .node_with_event(trees, Op::Delete)
                .map(|n| trees.path_of(n))
                .unwrap_or_default(),
            ConflictKind::MoveCreate => self
                .node_with_event(trees, Op::Create)
                .map(|n| trees.path_of(n))
                .unwrap_or_default(),
            ConflictKind::MoveMoveSource => trees
                .node(self.local())
                .move_origin
                .as_ref()
                .map(|origin| origin.path.clone())
                .unwrap_or_default(),
            ConflictKind::MoveMoveDest
            | ConflictKind::MoveMoveCycle
            | ConflictKind::CreateCreate
            | ConflictKind::EditEdit => trees.path_of(self.local()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedConflict {
    conflict: Conflict,
    depth: usize,
    path: PathBuf,
}

impl Ord for QueuedConflict {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element; reverse so that the highest
        // priority kind, then the shallowest path, then the lexicographically
        // smallest path comes out first.
        other
            .conflict
            .kind
            .cmp(&self.conflict.kind)
            .then_with(|| other.depth.cmp(&self.depth))
            .then_with(|| other.path.cmp(&self.path))
    }
}

impl PartialOrd for QueuedConflict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of conflicts found during a pass.
///
/// Higher-impact and closer-to-root conflicts are popped first. The queue
/// also remembers which kinds it holds, which the resolver consults to defer
/// overlapping resolutions.
#[derive(Debug, Default)]
pub struct ConflictQueue {
    heap: BinaryHeap<QueuedConflict>,
    kinds: HashSet<ConflictKind>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: Conflict, trees: &TreePair) {
        let path = conflict.sort_path(trees);
        self.kinds.insert(conflict.kind);
        self.heap.push(QueuedConflict {
            depth: crate::shared::utils::path_depth(&path),
            path,
            conflict,
        });
    }

    pub fn pop(&mut self) -> Option<Conflict> {
        self.heap.pop().map(|queued| queued.conflict)
    }

    pub fn has_kind(&self, kind: ConflictKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.kinds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::update_tree::{NodeSeed, UpdateTree};
    use crate::shared::NodeKind;
    use pretty_assertions::assert_eq;

    fn pair_with_conflicting_files() -> (TreePair, Vec<NodeRef>) {
        let mut local = UpdateTree::new(ReplicaSide::Local, 1, "lroot");
        let mut remote = UpdateTree::new(ReplicaSide::Remote, 1, "rroot");

        let ldir = local
            .insert(NodeSeed::new("docs", NodeKind::Directory).id("l-docs").db_id(2), local.root())
            .unwrap();
        let deep = local
            .insert(NodeSeed::new("deep.txt", NodeKind::File).id("l-deep").event(Op::Edit), ldir)
            .unwrap();
        let shallow = local
            .insert(
                NodeSeed::new("shallow.txt", NodeKind::File).id("l-shallow").event(Op::Edit),
                local.root(),
            )
            .unwrap();
        let rdeep = remote
            .insert(NodeSeed::new("deep.txt", NodeKind::File).id("r-deep").event(Op::Edit), remote.root())
            .unwrap();
        let rshallow = remote
            .insert(
                NodeSeed::new("shallow.txt", NodeKind::File).id("r-shallow").event(Op::Edit),
                remote.root(),
            )
            .unwrap();

        let refs = vec![
            NodeRef { side: ReplicaSide::Local, idx: deep },
            NodeRef { side: ReplicaSide::Remote, idx: rdeep },
            NodeRef { side: ReplicaSide::Local, idx: shallow },
            NodeRef { side: ReplicaSide::Remote, idx: rshallow },
        ];
        (TreePair::new(local, remote), refs)
    }

    #[test]
    fn kind_priority_beats_depth() {
        let (trees, refs) = pair_with_conflicting_files();
        let mut queue = ConflictQueue::new();

        queue.push(Conflict::new(refs[2], refs[3], ConflictKind::EditEdit), &trees);
        queue.push(Conflict::new(refs[0], refs[1], ConflictKind::EditDelete), &trees);

        assert_eq!(queue.pop().unwrap().kind, ConflictKind::EditDelete);
        assert_eq!(queue.pop().unwrap().kind, ConflictKind::EditEdit);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn shallower_conflict_pops_first_within_kind() {
        let (trees, refs) = pair_with_conflicting_files();
        let mut queue = ConflictQueue::new();

        let deep = Conflict::new(refs[0], refs[1], ConflictKind::EditEdit);
        let shallow = Conflict::new(refs[2], refs[3], ConflictKind::EditEdit);
        queue.push(deep, &trees);
        queue.push(shallow, &trees);

        assert_eq!(queue.pop(), Some(shallow));
        assert_eq!(queue.pop(), Some(deep));
    }

    #[test]
    fn queue_tracks_kinds() {
        let (trees, refs) = pair_with_conflicting_files();
        let mut queue = ConflictQueue::new();
        queue.push(Conflict::new(refs[0], refs[1], ConflictKind::MoveDelete), &trees);

        assert!(queue.has_kind(ConflictKind::MoveDelete));
        assert!(!queue.has_kind(ConflictKind::EditEdit));

        queue.clear();
        assert!(!queue.has_kind(ConflictKind::MoveDelete));
    }
}
