//! Step 2: fold an operation set into an update tree
//!
//! The tree first materializes every database row of its side (the known
//! synchronized world), then folds the change events in: deletes are marked
//! at their database location, moves rewire nodes to their snapshot
//! location, creates attach new nodes under their snapshot parent. When a
//! create lands on the path of a delete (delete-then-recreate with a new
//! id), the old id is recorded as the node's previous id so
//! corresponding-node lookups keep working.

use super::compute_ops::FsOpSet;
use crate::domain::{NodeIdx, NodeSeed, Snapshot, UpdateTree};
use crate::infrastructure::database::DbCache;
use crate::shared::utils::normalized_name;
use crate::shared::{NodeId, Op, SyncError, SyncResult};
use std::collections::HashMap;
use tracing::warn;

pub fn build_update_tree(
    ops: &FsOpSet,
    snapshot: &Snapshot,
    cache: &DbCache,
) -> SyncResult<UpdateTree> {
    let side = snapshot.side();
    let mut tree = UpdateTree::new(side, cache.root_db_id(), snapshot.root_id().clone());

    // The known world: all database rows, parents before children. Rows
    // without an id on this side (half-propagated creates) stay out,
    // subtree included.
    let mut stack: Vec<(i64, NodeIdx)> = vec![(cache.root_db_id(), tree.root())];
    while let Some((db_id, parent_idx)) = stack.pop() {
        for &child_db_id in cache.children_of(db_id) {
            let Some(row) = cache.node(child_db_id) else { continue };
            let Some(id) = row.id(side) else { continue };
            let seed = NodeSeed::new(row.name(side), row.kind)
                .id(id.clone())
                .db_id(child_db_id)
                .size(row.size);
            let idx = tree.insert(seed, parent_idx).ok_or_else(SyncError::data)?;
            {
                let node = tree.node_mut(idx);
                node.created_at = row.created_at(side);
                node.modified_at = row.last_mod(side);
            }
            stack.push((child_db_id, idx));
        }
    }

    // Deletes first: anchored at their database location, before creations
    // and moves shuffle paths around.
    let mut deleted_at_path: HashMap<String, NodeId> = HashMap::new();
    for (_, node_id, _, db_path) in &ops.deletes {
        let Some(idx) = tree.node_by_id(node_id) else {
            warn!(%node_id, "Delete for a node missing from the tree");
            return Err(SyncError::data());
        };
        tree.node_mut(idx).change_events.insert(Op::Delete);
        deleted_at_path.insert(
            normalized_name(&db_path.to_string_lossy()),
            node_id.clone(),
        );
    }

    for (item, db_id, origin_path, origin_parent_id) in &ops.moves {
        let idx = tree.node_by_id(&item.id).ok_or_else(SyncError::data)?;
        let parent = ensure_snapshot_chain(&mut tree, snapshot, cache, &item.parent_id)?;
        if !tree.rewire(idx, parent, Some(&item.name)) {
            return Err(SyncError::data());
        }
        let node = tree.node_mut(idx);
        node.db_id = Some(*db_id);
        node.size = item.size;
        node.created_at = Some(item.created_at);
        node.modified_at = Some(item.modified_at);
        node.change_events.insert(Op::Move);
        node.move_origin = Some(crate::domain::MoveOrigin {
            path: origin_path.clone(),
            parent_id: origin_parent_id.clone(),
        });
    }

    for item in &ops.creates {
        let idx = ensure_snapshot_chain(&mut tree, snapshot, cache, &item.id)?;
        tree.node_mut(idx).change_events.insert(Op::Create);

        let path = tree.path_of(idx);
        if let Some(previous) = deleted_at_path.get(&normalized_name(&path.to_string_lossy())) {
            if Some(previous) != tree.node(idx).id.as_ref() {
                tree.record_previous_id(idx, previous.clone());
            }
        }
    }

    for (item, db_id) in &ops.edits {
        let idx = ensure_snapshot_chain(&mut tree, snapshot, cache, &item.id)?;
        let node = tree.node_mut(idx);
        node.db_id = Some(*db_id);
        node.size = item.size;
        node.created_at = Some(item.created_at);
        node.modified_at = Some(item.modified_at);
        node.change_events.insert(Op::Edit);
    }

    Ok(tree)
}

/// Make sure a node exists for the snapshot item `id`, materializing missing
/// ancestors (without change events) from the snapshot on the way down.
fn ensure_snapshot_chain(
    tree: &mut UpdateTree,
    snapshot: &Snapshot,
    cache: &DbCache,
    id: &NodeId,
) -> SyncResult<NodeIdx> {
    if id == snapshot.root_id() {
        return Ok(tree.root());
    }
    if let Some(idx) = tree.node_by_id(id) {
        return Ok(idx);
    }
    let item = snapshot.item(id).ok_or_else(SyncError::data)?;
    let parent = ensure_snapshot_chain(tree, snapshot, cache, &item.parent_id)?;

    let mut seed = NodeSeed::new(item.name.clone(), item.kind)
        .id(item.id.clone())
        .size(item.size)
        .times(item.created_at, item.modified_at);
    if let Some(db_id) = cache.db_id(snapshot.side(), id) {
        seed = seed.db_id(db_id);
    }
    tree.insert(seed, parent).ok_or_else(SyncError::data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SnapshotItem;
    use crate::engine::compute_ops::compute_fs_operations;
    use crate::infrastructure::database::DbNode;
    use crate::shared::{NodeKind, ReplicaSide};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::Path;

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

    fn item(id: &str, parent: &str, name: &str, kind: NodeKind) -> SnapshotItem {
        SnapshotItem {
            id: id.into(),
            parent_id: parent.into(),
            name: name.into(),
            kind,
            size: 5,
            created_at: 10,
            modified_at: 20,
            checksum: None,
            is_link: false,
        }
    }

    fn build(snapshot: &Snapshot, cache: &DbCache) -> UpdateTree {
        let ops = compute_fs_operations(snapshot, cache, &HashSet::new());
        build_update_tree(&ops, snapshot, cache).unwrap()
    }

    #[test]
    fn unchanged_rows_materialize_without_events() {
        let cache = DbCache::from_nodes(vec![
            root_row(),
            row(2, 1, "docs", NodeKind::Directory),
            row(3, 2, "a.txt", NodeKind::File),
        ])
        .unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l2", "local-root", "docs", NodeKind::Directory));
        snapshot.upsert(item("l3", "l2", "a.txt", NodeKind::File));

        let tree = build(&snapshot, &cache);
        let file = tree.node_by_path(Path::new("docs/a.txt")).unwrap();
        assert!(!tree.node(file).has_any_event());
        assert_eq!(tree.node(file).db_id, Some(3));
    }

    #[test]
    fn delete_marks_node_at_db_location() {
        let cache = DbCache::from_nodes(vec![
            root_row(),
            row(2, 1, "docs", NodeKind::Directory),
            row(3, 2, "a.txt", NodeKind::File),
        ])
        .unwrap();
        // Locally only the file is gone.
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l2", "local-root", "docs", NodeKind::Directory));

        let tree = build(&snapshot, &cache);
        let deleted = tree.node_by_path(Path::new("docs/a.txt")).unwrap();
        assert!(tree.node(deleted).has_event(Op::Delete));
        let docs = tree.node_by_path(Path::new("docs")).unwrap();
        assert!(!tree.node(docs).has_any_event());
    }

    #[test]
    fn moved_item_rewires_to_new_location_with_origin() {
        let cache = DbCache::from_nodes(vec![
            root_row(),
            row(2, 1, "docs", NodeKind::Directory),
            row(3, 2, "a.txt", NodeKind::File),
        ])
        .unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l2", "local-root", "docs", NodeKind::Directory));
        snapshot.upsert(item("l3", "local-root", "a.txt", NodeKind::File));

        let tree = build(&snapshot, &cache);
        let moved = tree.node_by_path(Path::new("a.txt")).unwrap();
        let node = tree.node(moved);
        assert!(node.has_event(Op::Move));
        let origin = node.move_origin.as_ref().unwrap();
        assert_eq!(origin.path, Path::new("docs/a.txt"));
        assert_eq!(origin.parent_id, "l2");
        // The old location is vacated.
        assert!(tree.node_by_path(Path::new("docs/a.txt")).is_none());
    }

    #[test]
    fn recreate_records_previous_id() {
        let cache =
            DbCache::from_nodes(vec![root_row(), row(2, 1, "a.txt", NodeKind::File)]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l-new", "local-root", "a.txt", NodeKind::File));

        let tree = build(&snapshot, &cache);
        // The old id effectively resolves to the re-created node.
        let via_old = tree.node_by_effective_id(&"l2".to_string()).unwrap();
        assert_eq!(tree.node(via_old).id.as_deref(), Some("l-new"));
        assert_eq!(tree.node(via_old).previous_id.as_deref(), Some("l2"));
        assert!(tree.node(via_old).has_event(Op::Create));
        // The delete node of the old object is still present directly.
        let delete_node = tree.node_by_id(&"l2".to_string()).unwrap();
        assert!(tree.node(delete_node).has_event(Op::Delete));
    }

    #[test]
    fn move_and_edit_merge_on_one_node() {
        let cache =
            DbCache::from_nodes(vec![root_row(), row(2, 1, "a.txt", NodeKind::File)]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut touched = item("l2", "local-root", "b.txt", NodeKind::File);
        touched.modified_at = 99;
        snapshot.upsert(touched);

        let tree = build(&snapshot, &cache);
        let node = tree.node(tree.node_by_path(Path::new("b.txt")).unwrap());
        assert!(node.has_event(Op::Move));
        assert!(node.has_event(Op::Edit));
        assert_eq!(node.db_id, Some(2));
        assert_eq!(node.modified_at, Some(99));
    }

    #[test]
    fn created_subtree_materializes_parents_with_events() {
        let cache = DbCache::from_nodes(vec![root_row()]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l-d", "local-root", "new-dir", NodeKind::Directory));
        snapshot.upsert(item("l-f", "l-d", "f.txt", NodeKind::File));

        let tree = build(&snapshot, &cache);
        let dir = tree.node_by_path(Path::new("new-dir")).unwrap();
        let file = tree.node_by_path(Path::new("new-dir/f.txt")).unwrap();
        assert!(tree.node(dir).has_event(Op::Create));
        assert!(tree.node(file).has_event(Op::Create));
    }
}
