//! Building the remote snapshot from the drive

use super::client::{DriveClient, RemoteItem};
use crate::domain::{Snapshot, SnapshotItem};
use crate::shared::{NodeId, ReplicaSide, SyncResult};
use std::collections::VecDeque;
use tracing::{debug, warn};

const PER_PAGE: u32 = 500;
const MAX_BULK_PAGES: usize = 10_000;

/// Build the remote snapshot below `root_id`.
///
/// The cursor-based bulk listing is tried first (one round-trip per page for
/// the whole tree); when the drive does not support it, fall back to a
/// breadth-first walk over the paged children listing.
pub async fn build_remote_snapshot(
    client: &dyn DriveClient,
    root_id: &NodeId,
) -> SyncResult<Snapshot> {
    match bulk_snapshot(client, root_id).await {
        Ok(snapshot) => Ok(snapshot),
        Err(err) => {
            debug!(%err, "Bulk listing unavailable, walking the tree");
            walk_snapshot(client, root_id).await
        }
    }
}

async fn bulk_snapshot(client: &dyn DriveClient, root_id: &NodeId) -> SyncResult<Snapshot> {
    let mut items: Vec<RemoteItem> = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_BULK_PAGES {
        let page = client
            .bulk_listing(cursor.as_deref())
            .await
            .map_err(crate::shared::SyncError::from)?;
        items.extend(page.items);
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    // The listing carries no ordering guarantee; insert parents first by
    // retrying items whose parent has not landed yet.
    let mut snapshot = Snapshot::new(ReplicaSide::Remote, root_id.clone());
    let mut pending: VecDeque<RemoteItem> = items.into();
    let mut stalled = 0;
    while let Some(item) = pending.pop_front() {
        let parent_known = item.parent_id == *root_id || snapshot.contains(&item.parent_id);
        if parent_known {
            if !snapshot.upsert(to_snapshot_item(item)) {
                debug!("Dropped remote item violating snapshot invariants");
            }
            stalled = 0;
        } else {
            stalled += 1;
            if stalled > pending.len() {
                // Orphans (items outside the synced root, racing deletes).
                warn!(count = stalled, "Remote listing items without a reachable parent dropped");
                break;
            }
            pending.push_back(item);
        }
    }
    Ok(snapshot)
}

async fn walk_snapshot(client: &dyn DriveClient, root_id: &NodeId) -> SyncResult<Snapshot> {
    let mut snapshot = Snapshot::new(ReplicaSide::Remote, root_id.clone());
    let mut queue = VecDeque::from([root_id.clone()]);

    while let Some(dir_id) = queue.pop_front() {
        let mut page = 1;
        loop {
            let items = client
                .list_children(&dir_id, page, PER_PAGE)
                .await
                .map_err(crate::shared::SyncError::from)?;
            let done = (items.len() as u32) < PER_PAGE;
            for item in items {
                if item.kind == crate::shared::NodeKind::Directory {
                    queue.push_back(item.id.clone());
                }
                if !snapshot.upsert(to_snapshot_item(item)) {
                    debug!("Dropped remote item violating snapshot invariants");
                }
            }
            if done {
                break;
            }
            page += 1;
        }
    }
    Ok(snapshot)
}

fn to_snapshot_item(item: RemoteItem) -> SnapshotItem {
    SnapshotItem {
        id: item.id,
        parent_id: item.parent_id,
        name: item.name,
        kind: item.kind,
        size: item.size,
        created_at: item.created_at,
        modified_at: item.modified_at,
        checksum: item.checksum,
        is_link: item.is_link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDrive, REMOTE_ROOT_ID};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn bulk_listing_builds_full_snapshot() {
        let drive = MockDrive::new();
        let dir = drive.seed_dir(REMOTE_ROOT_ID, "docs");
        drive.seed_file(&dir, "a.txt", b"abc", 7);

        let snapshot = build_remote_snapshot(&drive, &REMOTE_ROOT_ID.to_string())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.id_by_path(std::path::Path::new("docs/a.txt")),
            snapshot.items().find(|i| i.name == "a.txt").map(|i| i.id.clone())
        );
        // A single bulk page served the whole tree.
        assert_eq!(drive.count("bulk_listing"), 1);
        assert_eq!(drive.count("list_children"), 0);
    }

    #[tokio::test]
    async fn falls_back_to_walk_when_bulk_fails() {
        let drive = MockDrive::new();
        drive.seed_file(REMOTE_ROOT_ID, "a.txt", b"abc", 7);
        drive.fail_next(
            "bulk_listing",
            crate::remote::client::DriveError {
                status: 501,
                code: "unsupported".into(),
                description: String::new(),
            },
        );

        let snapshot = build_remote_snapshot(&drive, &REMOTE_ROOT_ID.to_string())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(drive.count("list_children") >= 1);
    }
}
