//! Per-pass update trees
//!
//! Each replica gets one `UpdateTree` per pass: a tree of `Node`s carrying
//! the change events computed in step one. The trees are backed by an arena
//! (`Vec<Node>` plus indices) since their lifetime is a single pass and they
//! are never shared across passes.

use crate::shared::utils::normalized_name;
use crate::shared::{DbNodeId, NodeId, NodeKind, NodeStatus, Op, OpSet, ReplicaSide};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::conflict::ConflictKind;

/// Index of a node inside its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdx(pub usize);

/// Reference to a node in either tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub side: ReplicaSide,
    pub idx: NodeIdx,
}

/// Where a moved node came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOrigin {
    /// Path relative to the sync root before the move.
    pub path: PathBuf,
    /// Id of the parent directory before the move.
    pub parent_id: NodeId,
}

/// One object of one replica inside an update tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub side: ReplicaSide,
    pub db_id: Option<DbNodeId>,
    pub id: Option<NodeId>,
    /// Previous id when the object was deleted and re-created at the same
    /// path with a new id within the same pass.
    pub previous_id: Option<NodeId>,
    pub name: String,
    pub normalized: String,
    pub kind: NodeKind,
    pub size: i64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub change_events: OpSet,
    pub status: NodeStatus,
    pub move_origin: Option<MoveOrigin>,
    pub conflicts_considered: Vec<ConflictKind>,
    parent: Option<NodeIdx>,
    children: Vec<NodeIdx>,
    removed: bool,
}

impl Node {
    pub fn parent(&self) -> Option<NodeIdx> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIdx] {
        &self.children
    }

    pub fn has_event(&self, op: Op) -> bool {
        self.change_events.contains(op)
    }

    pub fn has_any_event(&self) -> bool {
        !self.change_events.is_empty()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.normalized = normalized_name(&self.name);
    }

    pub fn conflict_already_considered(&self, kind: ConflictKind) -> bool {
        self.conflicts_considered.contains(&kind)
    }
}

/// Mutable description used when inserting a node.
#[derive(Debug, Clone)]
pub struct NodeSeed {
    pub db_id: Option<DbNodeId>,
    pub id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub size: i64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub change_events: OpSet,
    pub move_origin: Option<MoveOrigin>,
}

impl NodeSeed {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            db_id: None,
            id: None,
            name: name.into(),
            kind,
            size: 0,
            created_at: None,
            modified_at: None,
            change_events: OpSet::empty(),
            move_origin: None,
        }
    }

    pub fn id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn db_id(mut self, db_id: DbNodeId) -> Self {
        self.db_id = Some(db_id);
        self
    }

    pub fn size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn times(mut self, created_at: i64, modified_at: i64) -> Self {
        self.created_at = Some(created_at);
        self.modified_at = Some(modified_at);
        self
    }

    pub fn event(mut self, op: Op) -> Self {
        self.change_events.insert(op);
        self
    }

    pub fn move_origin(mut self, path: impl Into<PathBuf>, parent_id: impl Into<NodeId>) -> Self {
        self.move_origin = Some(MoveOrigin {
            path: path.into(),
            parent_id: parent_id.into(),
        });
        self
    }
}

/// Arena-backed tree of [`Node`]s for one replica.
#[derive(Debug)]
pub struct UpdateTree {
    side: ReplicaSide,
    nodes: Vec<Node>,
    root: NodeIdx,
    by_id: HashMap<NodeId, NodeIdx>,
    /// `previous id -> current id` for objects re-created with a new id.
    previous_ids: HashMap<NodeId, NodeId>,
}

impl UpdateTree {
    pub fn new(side: ReplicaSide, root_db_id: DbNodeId, root_id: impl Into<NodeId>) -> Self {
        let root_id = root_id.into();
        let root = Node {
            side,
            db_id: Some(root_db_id),
            id: Some(root_id.clone()),
            previous_id: None,
            name: String::new(),
            normalized: String::new(),
            kind: NodeKind::Directory,
            size: 0,
            created_at: None,
            modified_at: None,
            change_events: OpSet::empty(),
            status: NodeStatus::Unprocessed,
            move_origin: None,
            conflicts_considered: Vec::new(),
            parent: None,
            children: Vec::new(),
            removed: false,
        };
        let mut by_id = HashMap::new();
        by_id.insert(root_id, NodeIdx(0));
        Self {
            side,
            nodes: vec![root],
            root: NodeIdx(0),
            by_id,
            previous_ids: HashMap::new(),
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx.0]
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[idx.0]
    }

    /// Insert a node under `parent`. The parent must be a live directory of
    /// this tree; `None` is returned otherwise.
    pub fn insert(&mut self, seed: NodeSeed, parent: NodeIdx) -> Option<NodeIdx> {
        {
            let parent_node = self.nodes.get(parent.0)?;
            if parent_node.removed || parent_node.kind != NodeKind::Directory {
                return None;
            }
        }
        let normalized = normalized_name(&seed.name);
        let idx = NodeIdx(self.nodes.len());
        if seed.move_origin.is_some() != seed.change_events.contains(Op::Move) {
            // Move origin goes with the Move event, nothing else.
            return None;
        }
        self.nodes.push(Node {
            side: self.side,
            db_id: seed.db_id,
            id: seed.id.clone(),
            previous_id: None,
            name: seed.name,
            normalized,
            kind: seed.kind,
            size: seed.size,
            created_at: seed.created_at,
            modified_at: seed.modified_at,
            change_events: seed.change_events,
            status: NodeStatus::Unprocessed,
            move_origin: seed.move_origin,
            conflicts_considered: Vec::new(),
            parent: Some(parent),
            children: Vec::new(),
            removed: false,
        });
        self.nodes[parent.0].children.push(idx);
        if let Some(id) = seed.id {
            self.by_id.insert(id, idx);
        }
        Some(idx)
    }

    /// Record that the object now known as `current` previously carried
    /// `previous` (delete-then-recreate with a changed id).
    pub fn record_previous_id(&mut self, idx: NodeIdx, previous: NodeId) {
        if let Some(current) = self.nodes[idx.0].id.clone() {
            self.previous_ids.insert(previous.clone(), current);
        }
        self.nodes[idx.0].previous_id = Some(previous);
    }

    /// Find a live node by its current replica id.
    pub fn node_by_id(&self, id: &NodeId) -> Option<NodeIdx> {
        let idx = self.by_id.get(id)?;
        (!self.nodes[idx.0].removed).then_some(*idx)
    }

    /// Find the node standing for the object known as `id` in the database.
    /// A re-created object shadows the deleted one carrying the old id.
    pub fn node_by_effective_id(&self, id: &NodeId) -> Option<NodeIdx> {
        if let Some(current) = self.previous_ids.get(id) {
            if let Some(idx) = self.node_by_id(current) {
                return Some(idx);
            }
        }
        self.node_by_id(id)
    }

    /// Walk a relative path from the root, matching normalized names.
    pub fn node_by_path(&self, path: &Path) -> Option<NodeIdx> {
        let mut current = self.root;
        for component in path.components() {
            let name = normalized_name(&component.as_os_str().to_string_lossy());
            current = self.child_by_name(current, &name)?;
        }
        Some(current)
    }

    /// Live child of `parent` with the given normalized name.
    pub fn child_by_name(&self, parent: NodeIdx, normalized: &str) -> Option<NodeIdx> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|idx| !self.nodes[idx.0].removed && self.nodes[idx.0].normalized == normalized)
    }

    /// Live child of `parent` with the given normalized name, skipping nodes
    /// that carry the `except` change event.
    pub fn child_by_name_except(
        &self,
        parent: NodeIdx,
        normalized: &str,
        except: Op,
    ) -> Option<NodeIdx> {
        self.nodes[parent.0].children.iter().copied().find(|idx| {
            let node = &self.nodes[idx.0];
            !node.removed && node.normalized == normalized && !node.has_event(except)
        })
    }

    /// Path of a node relative to the sync root, following current parents.
    pub fn path_of(&self, idx: NodeIdx) -> PathBuf {
        let mut names = Vec::new();
        let mut current = idx;
        while let Some(parent) = self.nodes[current.0].parent {
            names.push(self.nodes[current.0].name.clone());
            current = parent;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// True when `node` is `ancestor` or lives below it.
    pub fn is_self_or_below(&self, node: NodeIdx, ancestor: NodeIdx) -> bool {
        let mut current = Some(node);
        while let Some(idx) = current {
            if idx == ancestor {
                return true;
            }
            current = self.nodes[idx.0].parent;
        }
        false
    }

    /// Re-attach `node` under `new_parent`, optionally renaming it.
    /// Fails when the new parent is not a live directory or the move would
    /// create a cycle.
    pub fn rewire(&mut self, node: NodeIdx, new_parent: NodeIdx, new_name: Option<&str>) -> bool {
        let parent_ok = {
            let parent_node = &self.nodes[new_parent.0];
            !parent_node.removed && parent_node.kind == NodeKind::Directory
        };
        if !parent_ok || self.is_self_or_below(new_parent, node) {
            return false;
        }
        if let Some(old_parent) = self.nodes[node.0].parent {
            self.nodes[old_parent.0].children.retain(|c| *c != node);
        }
        self.nodes[node.0].parent = Some(new_parent);
        self.nodes[new_parent.0].children.push(node);
        if let Some(name) = new_name {
            self.nodes[node.0].set_name(name);
        }
        true
    }

    /// Replace the replica id of a node (e.g. after the executor created the
    /// object on this replica and learned its real id).
    pub fn set_node_id(&mut self, idx: NodeIdx, id: NodeId) {
        if let Some(old) = self.nodes[idx.0].id.take() {
            self.by_id.remove(&old);
        }
        self.by_id.insert(id.clone(), idx);
        self.nodes[idx.0].id = Some(id);
    }

    /// Remove a node and all its descendants from the tree.
    pub fn remove_subtree(&mut self, idx: NodeIdx) {
        if idx == self.root {
            return;
        }
        if let Some(parent) = self.nodes[idx.0].parent {
            self.nodes[parent.0].children.retain(|c| *c != idx);
        }
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            stack.extend(self.nodes[current.0].children.iter().copied());
            let node = &mut self.nodes[current.0];
            node.removed = true;
            if let Some(id) = node.id.take() {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn mark_all_unprocessed(&mut self) {
        for node in &mut self.nodes {
            node.status = NodeStatus::Unprocessed;
        }
    }

    /// Breadth-first traversal over live nodes, root included.
    pub fn bfs(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            if self.nodes[idx.0].removed {
                continue;
            }
            order.push(idx);
            queue.extend(self.nodes[idx.0].children.iter().copied());
        }
        order
    }

    /// Live descendants of `start` (excluded) carrying the given event.
    pub fn descendants_with_event(&self, start: NodeIdx, op: Op) -> Vec<NodeIdx> {
        let mut found = Vec::new();
        let mut queue: std::collections::VecDeque<NodeIdx> =
            self.nodes[start.0].children.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            let node = &self.nodes[idx.0];
            if node.removed {
                continue;
            }
            if node.has_event(op) {
                found.push(idx);
            }
            queue.extend(node.children.iter().copied());
        }
        found
    }
}

/// Both update trees of a pass.
#[derive(Debug)]
pub struct TreePair {
    pub local: UpdateTree,
    pub remote: UpdateTree,
}

impl TreePair {
    pub fn new(local: UpdateTree, remote: UpdateTree) -> Self {
        debug_assert_eq!(local.side(), ReplicaSide::Local);
        debug_assert_eq!(remote.side(), ReplicaSide::Remote);
        Self { local, remote }
    }

    pub fn tree(&self, side: ReplicaSide) -> &UpdateTree {
        match side {
            ReplicaSide::Local => &self.local,
            ReplicaSide::Remote => &self.remote,
        }
    }

    pub fn tree_mut(&mut self, side: ReplicaSide) -> &mut UpdateTree {
        match side {
            ReplicaSide::Local => &mut self.local,
            ReplicaSide::Remote => &mut self.remote,
        }
    }

    pub fn node(&self, node_ref: NodeRef) -> &Node {
        self.tree(node_ref.side).node(node_ref.idx)
    }

    pub fn node_mut(&mut self, node_ref: NodeRef) -> &mut Node {
        self.tree_mut(node_ref.side).node_mut(node_ref.idx)
    }

    pub fn path_of(&self, node_ref: NodeRef) -> PathBuf {
        self.tree(node_ref.side).path_of(node_ref.idx)
    }

    pub fn mark_all_unprocessed(&mut self) {
        self.local.mark_all_unprocessed();
        self.remote.mark_all_unprocessed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tree() -> UpdateTree {
        UpdateTree::new(ReplicaSide::Local, 1, "root")
    }

    #[test]
    fn insert_and_lookup_by_path() {
        let mut tree = tree();
        let docs = tree
            .insert(NodeSeed::new("docs", NodeKind::Directory).id("d1"), tree.root())
            .unwrap();
        let file = tree
            .insert(NodeSeed::new("a.txt", NodeKind::File).id("f1"), docs)
            .unwrap();

        assert_eq!(tree.node_by_path(Path::new("docs/a.txt")), Some(file));
        assert_eq!(tree.path_of(file), PathBuf::from("docs/a.txt"));
        assert_eq!(tree.node_by_id(&"f1".to_string()), Some(file));
    }

    #[test]
    fn insert_refuses_file_parent_and_unmatched_move_origin() {
        let mut tree = tree();
        let file = tree
            .insert(NodeSeed::new("a.txt", NodeKind::File).id("f1"), tree.root())
            .unwrap();
        assert!(tree.insert(NodeSeed::new("x", NodeKind::File), file).is_none());

        // A move origin without a Move event violates the node invariant.
        let seed = NodeSeed::new("b.txt", NodeKind::File).move_origin("a.txt", "root");
        assert!(tree.insert(seed, tree.root()).is_none());
    }

    #[test]
    fn rewire_moves_subtree_and_refuses_cycles() {
        let mut tree = tree();
        let a = tree
            .insert(NodeSeed::new("a", NodeKind::Directory).id("a"), tree.root())
            .unwrap();
        let b = tree
            .insert(NodeSeed::new("b", NodeKind::Directory).id("b"), tree.root())
            .unwrap();
        let f = tree.insert(NodeSeed::new("f", NodeKind::File).id("f"), a).unwrap();

        assert!(tree.rewire(a, b, None));
        assert_eq!(tree.path_of(f), PathBuf::from("b/a/f"));

        // b is now below a: re-attaching b under a's child would form a cycle
        assert!(!tree.rewire(b, a, None));
    }

    #[test]
    fn remove_subtree_unregisters_ids() {
        let mut tree = tree();
        let a = tree
            .insert(NodeSeed::new("a", NodeKind::Directory).id("a"), tree.root())
            .unwrap();
        tree.insert(NodeSeed::new("f", NodeKind::File).id("f"), a).unwrap();

        tree.remove_subtree(a);
        assert!(tree.node_by_id(&"a".to_string()).is_none());
        assert!(tree.node_by_id(&"f".to_string()).is_none());
        assert!(tree.node_by_path(Path::new("a")).is_none());
        assert_eq!(tree.bfs().len(), 1);
    }

    #[test]
    fn previous_id_resolves_to_recreated_node() {
        let mut tree = tree();
        let old = tree
            .insert(
                NodeSeed::new("a.txt", NodeKind::File).id("old").event(Op::Delete),
                tree.root(),
            )
            .unwrap();
        let f = tree
            .insert(NodeSeed::new("a.txt", NodeKind::File).id("new"), tree.root())
            .unwrap();
        tree.record_previous_id(f, "old".into());

        // Direct lookup keeps seeing the deleted node; effective lookup
        // resolves to the re-created one.
        assert_eq!(tree.node_by_id(&"old".to_string()), Some(old));
        assert_eq!(tree.node_by_effective_id(&"old".to_string()), Some(f));
        assert_eq!(tree.node_by_effective_id(&"new".to_string()), Some(f));
    }

    #[test]
    fn descendants_with_event_skips_start() {
        let mut tree = tree();
        let a = tree
            .insert(
                NodeSeed::new("a", NodeKind::Directory).id("a").event(Op::Move).move_origin("z", "root"),
                tree.root(),
            )
            .unwrap();
        let b = tree
            .insert(NodeSeed::new("b", NodeKind::Directory).id("b"), a)
            .unwrap();
        tree.insert(NodeSeed::new("f", NodeKind::File).id("f").event(Op::Create), b)
            .unwrap();

        let found = tree.descendants_with_event(tree.root(), Op::Create);
        assert_eq!(found.len(), 1);
        assert_eq!(tree.node(found[0]).name, "f");
    }
}
