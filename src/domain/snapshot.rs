//! Immutable per-replica state captured at the start of a pass

use crate::shared::utils::normalized_name;
use crate::shared::{NodeId, NodeKind, ReplicaSide, SyncTime};
use std::collections::HashMap;
use std::path::PathBuf;

/// Current state of one filesystem object on one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub size: i64,
    pub created_at: SyncTime,
    pub modified_at: SyncTime,
    /// Hex blake3 digest of the file content, when known.
    pub checksum: Option<String>,
    pub is_link: bool,
}

/// Per-replica `{id -> item}` map, frozen for the duration of a pass.
///
/// Invariants: every non-root item's parent is present, and
/// `(parent_id, normalized(name))` is unique among live children.
#[derive(Debug, Clone)]
pub struct Snapshot {
    side: ReplicaSide,
    root_id: NodeId,
    items: HashMap<NodeId, SnapshotItem>,
    /// `parent id -> normalized name -> child id`
    children: HashMap<NodeId, HashMap<String, NodeId>>,
}

impl Snapshot {
    pub fn new(side: ReplicaSide, root_id: impl Into<NodeId>) -> Self {
        Self {
            side,
            root_id: root_id.into(),
            items: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace an item. Returns `false` when the parent is unknown
    /// or the normalized name is already taken by a different sibling.
    pub fn upsert(&mut self, item: SnapshotItem) -> bool {
        if item.id == self.root_id {
            return false;
        }
        if item.parent_id != self.root_id && !self.items.contains_key(&item.parent_id) {
            return false;
        }

        let normalized = normalized_name(&item.name);
        let siblings = self.children.entry(item.parent_id.clone()).or_default();
        if let Some(existing) = siblings.get(&normalized) {
            if *existing != item.id {
                return false;
            }
        }

        if let Some(previous) = self.items.get(&item.id) {
            // Name or parent changed: drop the stale sibling entry.
            let old_normalized = normalized_name(&previous.name);
            if previous.parent_id != item.parent_id || old_normalized != normalized {
                if let Some(old_siblings) = self.children.get_mut(&previous.parent_id) {
                    old_siblings.remove(&old_normalized);
                }
            }
        }

        self.children
            .entry(item.parent_id.clone())
            .or_default()
            .insert(normalized, item.id.clone());
        self.items.insert(item.id.clone(), item);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<SnapshotItem> {
        let item = self.items.remove(id)?;
        if let Some(siblings) = self.children.get_mut(&item.parent_id) {
            siblings.remove(&normalized_name(&item.name));
        }
        self.children.remove(id);
        Some(item)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.items.contains_key(id)
    }

    pub fn item(&self, id: &NodeId) -> Option<&SnapshotItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &SnapshotItem> {
        self.items.values()
    }

    pub fn child_by_name(&self, parent_id: &NodeId, normalized: &str) -> Option<&SnapshotItem> {
        let id = self.children.get(parent_id)?.get(normalized)?;
        self.items.get(id)
    }

    pub fn children_of(&self, parent_id: &NodeId) -> impl Iterator<Item = &SnapshotItem> {
        self.children
            .get(parent_id)
            .into_iter()
            .flat_map(|map| map.values())
            .filter_map(|id| self.items.get(id))
    }

    /// Item at a relative path, matching normalized names from the root.
    pub fn id_by_path(&self, path: &std::path::Path) -> Option<NodeId> {
        let mut current = self.root_id.clone();
        for component in path.components() {
            let name = normalized_name(&component.as_os_str().to_string_lossy());
            current = self.child_by_name(&current, &name)?.id.clone();
        }
        Some(current)
    }

    /// Path of an item relative to the sync root, walking parent links.
    pub fn path_of(&self, id: &NodeId) -> Option<PathBuf> {
        if *id == self.root_id {
            return Some(PathBuf::new());
        }
        let mut names = Vec::new();
        let mut current = self.items.get(id)?;
        loop {
            names.push(current.name.clone());
            if current.parent_id == self.root_id {
                break;
            }
            current = self.items.get(&current.parent_id)?;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// Total number of direct and transitive children of `id`.
    pub fn subtree_len(&self, id: &NodeId) -> usize {
        let mut count = 0;
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            for child in self.children_of(&current) {
                count += 1;
                stack.push(child.id.clone());
            }
        }
        count
    }
}
