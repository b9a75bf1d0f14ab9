//! Step 1: diff each snapshot against the sync database

use crate::domain::{Snapshot, SnapshotItem};
use crate::infrastructure::database::DbCache;
use crate::shared::utils::normalized_name;
use crate::shared::{DbNodeId, NodeId, NodeKind, ReplicaSide};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Per-side set of unresolved changes.
///
/// Creates, edits and moves carry the live snapshot item; deletes carry what
/// the database last knew about the object (its row is all that is left).
/// Move entries also record the pre-move path and parent id per the
/// database, delete entries their database path.
#[derive(Debug, Default)]
pub struct FsOpSet {
    pub creates: Vec<SnapshotItem>,
    pub edits: Vec<(SnapshotItem, DbNodeId)>,
    pub moves: Vec<(SnapshotItem, DbNodeId, PathBuf, NodeId)>,
    pub deletes: Vec<(DbNodeId, NodeId, NodeKind, PathBuf)>,
}

impl FsOpSet {
    pub fn len(&self) -> usize {
        self.creates.len() + self.edits.len() + self.moves.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Diff one snapshot against the database rows of its side.
///
/// Items on the tmp-blacklist (or below a blacklisted directory) are invisible
/// to the pass in both directions: their changes are not picked up and their
/// rows are not considered deleted.
pub fn compute_fs_operations(
    snapshot: &Snapshot,
    cache: &DbCache,
    blacklist: &HashSet<(ReplicaSide, NodeId)>,
) -> FsOpSet {
    let side = snapshot.side();
    let mut set = FsOpSet::default();

    let is_blacklisted = |id: &NodeId| blacklist.contains(&(side, id.clone()));
    let item_hidden = |item: &SnapshotItem| {
        // An item is hidden when it or any snapshot ancestor is blacklisted.
        let mut current = Some(item.id.clone());
        while let Some(id) = current {
            if is_blacklisted(&id) {
                return true;
            }
            if id == *snapshot.root_id() {
                break;
            }
            current = snapshot.item(&id).map(|item| item.parent_id.clone());
        }
        false
    };

    for item in snapshot.items() {
        if item_hidden(item) {
            continue;
        }
        match cache.node_by_id(side, &item.id) {
            None => set.creates.push(item.clone()),
            Some(row) => {
                let db_parent_on_side = row
                    .parent_db_id
                    .and_then(|parent| cache.node_id(side, parent));
                let snapshot_parent_matches = match db_parent_on_side {
                    Some(parent_id) => *parent_id == item.parent_id,
                    // Parent row lost its id on this side: treat as moved so
                    // reconciliation re-anchors the object.
                    None => false,
                };
                let name_matches =
                    normalized_name(row.name(side)) == normalized_name(&item.name);
                if !snapshot_parent_matches || !name_matches {
                    let origin_path = cache.path(side, row.db_id).unwrap_or_default();
                    let origin_parent_id = db_parent_on_side.cloned().unwrap_or_default();
                    set.moves
                        .push((item.clone(), row.db_id, origin_path, origin_parent_id));
                }

                if item.kind == NodeKind::File && file_changed(item, row, side) {
                    set.edits.push((item.clone(), row.db_id));
                }
            }
        }
    }

    for row in cache.nodes() {
        if row.is_root() {
            continue;
        }
        let Some(id) = row.id(side) else { continue };
        if snapshot.contains(id) || is_blacklisted(id) {
            continue;
        }
        let db_path = cache.path(side, row.db_id).unwrap_or_default();
        set.deletes.push((row.db_id, id.clone(), row.kind, db_path));
    }

    debug!(
        side = %side,
        creates = set.creates.len(),
        edits = set.edits.len(),
        moves = set.moves.len(),
        deletes = set.deletes.len(),
        "Computed FS operations"
    );
    set
}

/// A file counts as edited when size, modification time or checksum drifted
/// from the database. A creation-time-only drift is also reported; the
/// generator later turns it into a database-only operation.
fn file_changed(
    item: &SnapshotItem,
    row: &crate::infrastructure::database::DbNode,
    side: ReplicaSide,
) -> bool {
    if item.size != row.size {
        return true;
    }
    if Some(item.modified_at) != row.last_mod(side) {
        return true;
    }
    if let (Some(have), Some(known)) = (&item.checksum, &row.checksum) {
        if have != known {
            return true;
        }
    }
    // Creation-time drift only counts when both sides actually report one
    // (not every filesystem does).
    let item_created = (item.created_at != 0).then_some(item.created_at);
    matches!(
        (item_created, row.created_at(side)),
        (Some(have), Some(known)) if have != known
    )
}

/// Files the database considers in sync whose sizes disagree between the two
/// snapshots. These are corrupted transfers; the engine removes their rows
/// and restarts so they propagate again.
pub fn detect_size_mismatches(
    local: &Snapshot,
    remote: &Snapshot,
    cache: &DbCache,
) -> Vec<DbNodeId> {
    let mut corrupted = Vec::new();
    for row in cache.nodes() {
        if row.kind != NodeKind::File {
            continue;
        }
        let (Some(local_id), Some(remote_id)) =
            (row.id(ReplicaSide::Local), row.id(ReplicaSide::Remote))
        else {
            continue;
        };
        let (Some(local_item), Some(remote_item)) = (local.item(local_id), remote.item(remote_id))
        else {
            continue;
        };
        let in_sync = Some(local_item.modified_at) == row.last_mod(ReplicaSide::Local)
            && Some(remote_item.modified_at) == row.last_mod(ReplicaSide::Remote);
        if in_sync && local_item.size != remote_item.size {
            corrupted.push(row.db_id);
        }
    }
    corrupted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::DbNode;
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

    fn file_row(db_id: DbNodeId, parent: DbNodeId, name: &str) -> DbNode {
        DbNode {
            db_id,
            parent_db_id: Some(parent),
            local_id: Some(format!("l{db_id}")),
            remote_id: Some(format!("r{db_id}")),
            local_name: name.into(),
            remote_name: name.into(),
            kind: NodeKind::File,
            size: 5,
            created_at_local: Some(10),
            created_at_remote: Some(10),
            last_mod_local: Some(20),
            last_mod_remote: Some(20),
            checksum: None,
            syncing: false,
        }
    }

    fn item(id: &str, parent: &str, name: &str) -> SnapshotItem {
        SnapshotItem {
            id: id.into(),
            parent_id: parent.into(),
            name: name.into(),
            kind: NodeKind::File,
            size: 5,
            created_at: 10,
            modified_at: 20,
            checksum: None,
            is_link: false,
        }
    }

    #[test]
    fn unchanged_item_produces_nothing() {
        let cache = DbCache::from_nodes(vec![root_row(), file_row(2, 1, "a.txt")]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l2", "local-root", "a.txt"));

        let set = compute_fs_operations(&snapshot, &cache, &HashSet::new());
        assert!(set.is_empty());
    }

    #[test]
    fn rename_becomes_move_with_db_origin() {
        let cache = DbCache::from_nodes(vec![root_row(), file_row(2, 1, "a.txt")]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l2", "local-root", "b.txt"));

        let set = compute_fs_operations(&snapshot, &cache, &HashSet::new());
        assert_eq!(set.moves.len(), 1);
        let (moved, db_id, origin, origin_parent) = &set.moves[0];
        assert_eq!(moved.name, "b.txt");
        assert_eq!(*db_id, 2);
        assert_eq!(origin, &PathBuf::from("a.txt"));
        assert_eq!(origin_parent, "local-root");
        assert!(set.edits.is_empty());
    }

    #[test]
    fn new_and_missing_items_split_into_create_and_delete() {
        let cache = DbCache::from_nodes(vec![root_row(), file_row(2, 1, "a.txt")]).unwrap();
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        snapshot.upsert(item("l-new", "local-root", "fresh.txt"));

        let set = compute_fs_operations(&snapshot, &cache, &HashSet::new());
        assert_eq!(set.creates.len(), 1);
        assert_eq!(set.creates[0].id, "l-new");
        assert_eq!(set.deletes.len(), 1);
        assert_eq!(set.deletes[0].1, "l2");
        assert_eq!(set.deletes[0].3, PathBuf::from("a.txt"));
    }

    #[test]
    fn mtime_change_is_an_edit_and_ctime_only_too() {
        let cache = DbCache::from_nodes(vec![root_row(), file_row(2, 1, "a.txt")]).unwrap();

        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut touched = item("l2", "local-root", "a.txt");
        touched.modified_at = 99;
        snapshot.upsert(touched);
        let set = compute_fs_operations(&snapshot, &cache, &HashSet::new());
        assert_eq!(set.edits.len(), 1);

        let mut snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut ctime_only = item("l2", "local-root", "a.txt");
        ctime_only.created_at = 77;
        snapshot.upsert(ctime_only);
        let set = compute_fs_operations(&snapshot, &cache, &HashSet::new());
        // Encoded as an edit; the generator later downgrades it to DB-only.
        assert_eq!(set.edits.len(), 1);
    }

    #[test]
    fn blacklisted_subtree_is_invisible() {
        let mut dir = file_row(2, 1, "docs");
        dir.kind = NodeKind::Directory;
        let cache = DbCache::from_nodes(vec![root_row(), dir, file_row(3, 2, "a.txt")]).unwrap();

        // Locally everything is gone, but the directory is blacklisted.
        let snapshot = Snapshot::new(ReplicaSide::Local, "local-root");
        let mut blacklist = HashSet::new();
        blacklist.insert((ReplicaSide::Local, "l2".to_string()));
        // The file row is not protected by its parent's blacklist entry when
        // walking DB rows, so blacklist it explicitly, as the checker does.
        blacklist.insert((ReplicaSide::Local, "l3".to_string()));

        let set = compute_fs_operations(&snapshot, &cache, &blacklist);
        assert!(set.is_empty());
    }

    #[test]
    fn size_mismatch_on_in_sync_file_is_reported() {
        let cache = DbCache::from_nodes(vec![root_row(), file_row(2, 1, "a.txt")]).unwrap();
        let mut local = Snapshot::new(ReplicaSide::Local, "local-root");
        local.upsert(item("l2", "local-root", "a.txt"));
        let mut remote = Snapshot::new(ReplicaSide::Remote, "remote-root");
        let mut remote_item = item("r2", "remote-root", "a.txt");
        remote_item.size = 9999;
        remote.upsert(remote_item);

        // Remote size differs but mtimes still match the DB on both sides.
        assert_eq!(detect_size_mismatches(&local, &remote, &cache), vec![2]);
    }
}
