//! Helpers shared by the reconciliation steps
//!
//! Corresponding-node resolution ties the two update trees together through
//! the database; the pseudo-conflict test decides when a disagreement
//! between the replicas reduces to a database-only update.

use crate::domain::{NodeRef, Snapshot, TreePair};
use crate::infrastructure::database::DbCache;
use crate::shared::{NodeKind, Op, ReplicaSide};
use std::path::PathBuf;

/// The two immutable snapshots of a pass.
#[derive(Clone, Copy)]
pub struct Snapshots<'a> {
    pub local: &'a Snapshot,
    pub remote: &'a Snapshot,
}

impl<'a> Snapshots<'a> {
    pub fn side(&self, side: ReplicaSide) -> &'a Snapshot {
        match side {
            ReplicaSide::Local => self.local,
            ReplicaSide::Remote => self.remote,
        }
    }
}

/// Database id of a node, falling back to a cache lookup by replica id.
pub fn db_id_of(trees: &TreePair, cache: &DbCache, node_ref: NodeRef) -> Option<i64> {
    let node = trees.node(node_ref);
    if let Some(db_id) = node.db_id {
        return Some(db_id);
    }
    let id = node.id.as_ref()?;
    cache.db_id(node_ref.side, id)
}

/// The node of the other tree standing for the same database object.
pub fn corresponding_node_direct(
    trees: &TreePair,
    cache: &DbCache,
    node_ref: NodeRef,
) -> Option<NodeRef> {
    let db_id = db_id_of(trees, cache, node_ref)?;
    let other_side = node_ref.side.other();
    let other_id = cache.node_id(other_side, db_id)?;
    let other_tree = trees.tree(other_side);
    let idx = other_tree.node_by_effective_id(other_id)?;
    Some(NodeRef {
        side: other_side,
        idx,
    })
}

/// Corresponding node, falling back to a path walk from the nearest
/// database-known ancestor when the node itself has no row yet.
pub fn corresponding_node(trees: &TreePair, cache: &DbCache, node_ref: NodeRef) -> Option<NodeRef> {
    if db_id_of(trees, cache, node_ref).is_some() {
        return corresponding_node_direct(trees, cache, node_ref);
    }

    // Climb until an ancestor with a database row, collecting names.
    let tree = trees.tree(node_ref.side);
    let mut names: Vec<String> = Vec::new();
    let mut current = node_ref.idx;
    let ancestor_db_id = loop {
        let node = tree.node(current);
        if let Some(db_id) = node
            .db_id
            .or_else(|| node.id.as_ref().and_then(|id| cache.db_id(node_ref.side, id)))
        {
            break db_id;
        }
        names.push(node.name.clone());
        current = node.parent()?;
    };

    let other_side = node_ref.side.other();
    let other_tree = trees.tree(other_side);
    let ancestor_id = cache.node_id(other_side, ancestor_db_id)?;
    let ancestor_idx = other_tree.node_by_effective_id(ancestor_id)?;

    let mut path: PathBuf = other_tree.path_of(ancestor_idx);
    for name in names.iter().rev() {
        path.push(name);
    }
    let idx = other_tree.node_by_path(&path)?;
    Some(NodeRef {
        side: other_side,
        idx,
    })
}

/// True when the disagreement between `node` and `corresponding` is only
/// superficial and no replica has to change:
/// both created the same directory, both moved the object to the same
/// destination, or both hold a file with equal content.
pub fn is_pseudo_conflict(
    trees: &TreePair,
    snapshots: Snapshots<'_>,
    node_ref: NodeRef,
    corresponding_ref: NodeRef,
) -> bool {
    let node = trees.node(node_ref);
    let other = trees.node(corresponding_ref);
    if !node.has_any_event() || !other.has_any_event() {
        return false;
    }

    // Create-Create on directories
    if node.has_event(Op::Create)
        && other.has_event(Op::Create)
        && node.kind == NodeKind::Directory
        && other.kind == NodeKind::Directory
    {
        return true;
    }

    let same_name = node.normalized == other.normalized;

    // Move-Move (source) to the same destination
    if node.has_event(Op::Move) && other.has_event(Op::Move) && same_name {
        let parent_db = node
            .parent()
            .map(|p| trees.tree(node_ref.side).node(p).db_id);
        let other_parent_db = other
            .parent()
            .map(|p| trees.tree(corresponding_ref.side).node(p).db_id);
        if let (Some(a), Some(b)) = (parent_db, other_parent_db) {
            if a.is_some() && a == b {
                return true;
            }
        }
    }

    // Create/Edit on both sides with identical file content
    let both_touched = (node.has_event(Op::Create) || node.has_event(Op::Edit))
        && (other.has_event(Op::Create) || other.has_event(Op::Edit));
    if node.kind == NodeKind::File && other.kind == NodeKind::File && both_touched {
        let (Some(id), Some(other_id)) = (&node.id, &other.id) else {
            return false;
        };
        let item = snapshots.side(node_ref.side).item(id);
        let other_item = snapshots.side(corresponding_ref.side).item(other_id);
        if let (Some(item), Some(other_item)) = (item, other_item) {
            let same_content = match (&item.checksum, &other_item.checksum) {
                (Some(a), Some(b)) => a == b,
                _ => item.size == other_item.size && item.modified_at == other_item.modified_at,
            };
            if same_content {
                return true;
            }
        }
    }

    false
}

/// An edit propagates unless, against the database row, only the creation
/// time changed. Modification-time or content drift always propagates.
pub fn edit_should_propagate(
    trees: &TreePair,
    snapshots: Snapshots<'_>,
    cache: &DbCache,
    node_ref: NodeRef,
) -> bool {
    let node = trees.node(node_ref);
    let Some(id) = &node.id else {
        return true;
    };
    let Some(item) = snapshots.side(node_ref.side).item(id) else {
        return true;
    };
    let Some(db_id) = db_id_of(trees, cache, node_ref) else {
        return true;
    };
    let Some(row) = cache.node(db_id) else {
        return true;
    };

    if item.size != row.size {
        return true;
    }
    if Some(item.modified_at) != row.last_mod(node_ref.side) {
        return true;
    }
    if let (Some(have), Some(known)) = (&item.checksum, &row.checksum) {
        if have != known {
            return true;
        }
    }
    // Only the creation time drifted.
    false
}
