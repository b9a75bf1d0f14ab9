//! In-memory mirror of the `node` table
//!
//! The pipeline steps never query sqlite directly: a `DbCache` is loaded at
//! the start of a pass and the executor, the single writer, keeps it in step
//! with every row it commits.

use crate::shared::utils::normalized_name;
use crate::shared::{DbNodeId, NodeId, NodeKind, ReplicaSide, SyncTime};
use std::collections::HashMap;
use std::path::PathBuf;

/// One row of the `node` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbNode {
    pub db_id: DbNodeId,
    pub parent_db_id: Option<DbNodeId>,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub local_name: String,
    pub remote_name: String,
    pub kind: NodeKind,
    pub size: i64,
    pub created_at_local: Option<SyncTime>,
    pub created_at_remote: Option<SyncTime>,
    pub last_mod_local: Option<SyncTime>,
    pub last_mod_remote: Option<SyncTime>,
    pub checksum: Option<String>,
    pub syncing: bool,
}

impl DbNode {
    pub fn id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.local_id.as_ref(),
            ReplicaSide::Remote => self.remote_id.as_ref(),
        }
    }

    pub fn set_id(&mut self, side: ReplicaSide, id: Option<NodeId>) {
        match side {
            ReplicaSide::Local => self.local_id = id,
            ReplicaSide::Remote => self.remote_id = id,
        }
    }

    pub fn name(&self, side: ReplicaSide) -> &str {
        match side {
            ReplicaSide::Local => &self.local_name,
            ReplicaSide::Remote => &self.remote_name,
        }
    }

    pub fn set_name(&mut self, side: ReplicaSide, name: impl Into<String>) {
        match side {
            ReplicaSide::Local => self.local_name = name.into(),
            ReplicaSide::Remote => self.remote_name = name.into(),
        }
    }

    pub fn last_mod(&self, side: ReplicaSide) -> Option<SyncTime> {
        match side {
            ReplicaSide::Local => self.last_mod_local,
            ReplicaSide::Remote => self.last_mod_remote,
        }
    }

    pub fn created_at(&self, side: ReplicaSide) -> Option<SyncTime> {
        match side {
            ReplicaSide::Local => self.created_at_local,
            ReplicaSide::Remote => self.created_at_remote,
        }
    }

    pub fn set_created_at(&mut self, side: ReplicaSide, time: Option<SyncTime>) {
        match side {
            ReplicaSide::Local => self.created_at_local = time,
            ReplicaSide::Remote => self.created_at_remote = time,
        }
    }

    pub fn set_last_mod(&mut self, side: ReplicaSide, time: Option<SyncTime>) {
        match side {
            ReplicaSide::Local => self.last_mod_local = time,
            ReplicaSide::Remote => self.last_mod_remote = time,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_db_id.is_none()
    }
}

/// Indexed view over all [`DbNode`] rows of one sync pair.
#[derive(Debug, Clone, Default)]
pub struct DbCache {
    root_db_id: DbNodeId,
    nodes: HashMap<DbNodeId, DbNode>,
    by_local_id: HashMap<NodeId, DbNodeId>,
    by_remote_id: HashMap<NodeId, DbNodeId>,
    children: HashMap<DbNodeId, Vec<DbNodeId>>,
}

impl DbCache {
    /// Build the cache from all rows of the table. Exactly one row must be
    /// the root (`parent_db_id` NULL).
    pub fn from_nodes(nodes: Vec<DbNode>) -> Option<Self> {
        let mut roots = nodes.iter().filter(|n| n.is_root());
        let root = roots.next()?;
        if roots.next().is_some() {
            return None;
        }
        let mut cache = Self {
            root_db_id: root.db_id,
            ..Self::default()
        };
        for node in nodes {
            cache.insert(node);
        }
        Some(cache)
    }

    pub fn root_db_id(&self) -> DbNodeId {
        self.root_db_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, db_id: DbNodeId) -> Option<&DbNode> {
        self.nodes.get(&db_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DbNode> {
        self.nodes.values()
    }

    pub fn db_id(&self, side: ReplicaSide, id: &NodeId) -> Option<DbNodeId> {
        match side {
            ReplicaSide::Local => self.by_local_id.get(id).copied(),
            ReplicaSide::Remote => self.by_remote_id.get(id).copied(),
        }
    }

    pub fn node_by_id(&self, side: ReplicaSide, id: &NodeId) -> Option<&DbNode> {
        self.nodes.get(&self.db_id(side, id)?)
    }

    pub fn node_id(&self, side: ReplicaSide, db_id: DbNodeId) -> Option<&NodeId> {
        self.nodes.get(&db_id)?.id(side)
    }

    pub fn children_of(&self, db_id: DbNodeId) -> &[DbNodeId] {
        self.children.get(&db_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Child of `parent` whose normalized name on `side` matches.
    pub fn child_by_name(
        &self,
        side: ReplicaSide,
        parent: DbNodeId,
        normalized: &str,
    ) -> Option<&DbNode> {
        self.children_of(parent)
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|node| normalized_name(node.name(side)) == normalized)
    }

    /// Path of a row relative to the sync root, using the names of `side`.
    pub fn path(&self, side: ReplicaSide, db_id: DbNodeId) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.nodes.get(&db_id)?;
        while let Some(parent_id) = current.parent_db_id {
            names.push(current.name(side).to_string());
            current = self.nodes.get(&parent_id)?;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    pub fn path_by_node_id(&self, side: ReplicaSide, id: &NodeId) -> Option<PathBuf> {
        self.path(side, self.db_id(side, id)?)
    }

    /// Row whose normalized path on `side` equals `path`, walking from root.
    pub fn db_id_by_path(&self, side: ReplicaSide, path: &std::path::Path) -> Option<DbNodeId> {
        let mut current = self.root_db_id;
        for component in path.components() {
            let name = normalized_name(&component.as_os_str().to_string_lossy());
            current = self.child_by_name(side, current, &name)?.db_id;
        }
        Some(current)
    }

    pub fn insert(&mut self, node: DbNode) {
        if let Some(parent) = node.parent_db_id {
            self.children.entry(parent).or_default().push(node.db_id);
        } else {
            self.root_db_id = node.db_id;
        }
        if let Some(id) = &node.local_id {
            self.by_local_id.insert(id.clone(), node.db_id);
        }
        if let Some(id) = &node.remote_id {
            self.by_remote_id.insert(id.clone(), node.db_id);
        }
        self.nodes.insert(node.db_id, node);
    }

    /// Mutate a row in place, keeping every index coherent.
    pub fn apply(&mut self, db_id: DbNodeId, f: impl FnOnce(&mut DbNode)) -> bool {
        let Some(mut node) = self.nodes.remove(&db_id) else {
            return false;
        };
        if let Some(id) = &node.local_id {
            self.by_local_id.remove(id);
        }
        if let Some(id) = &node.remote_id {
            self.by_remote_id.remove(id);
        }
        if let Some(parent) = node.parent_db_id {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|id| *id != db_id);
            }
        }
        f(&mut node);
        self.insert(node);
        true
    }

    /// Remove a row and all its descendants; returns the removed ids,
    /// parents before children.
    pub fn remove_subtree(&mut self, db_id: DbNodeId) -> Vec<DbNodeId> {
        let mut removed = Vec::new();
        let mut stack = vec![db_id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            if let Some(parent) = node.parent_db_id {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|id| *id != current);
                }
            }
            if let Some(id) = &node.local_id {
                self.by_local_id.remove(id);
            }
            if let Some(id) = &node.remote_id {
                self.by_remote_id.remove(id);
            }
            removed.push(current);
            stack.extend(self.children.remove(&current).unwrap_or_default());
        }
        removed
    }

}
