//! Building the local snapshot by walking the sync root

use crate::domain::{Snapshot, SnapshotItem};
use crate::shared::{NodeKind, ReplicaSide, SyncResult, SyncTime};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Identifier of the sync root in the local snapshot.
pub const LOCAL_ROOT_ID: &str = "local-root";

/// Options of the local walker.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Compute blake3 checksums for regular files. Costly; normally only
    /// enabled for targeted verification.
    pub with_checksums: bool,
    /// Directory names skipped at the top level (rescue dir, scratch dirs).
    pub skip_top_level: Vec<String>,
}

/// Walk `root` breadth-first into a snapshot keyed by inode-derived ids.
pub fn build_local_snapshot(root: &Path, options: &WalkOptions) -> SyncResult<Snapshot> {
    let mut snapshot = Snapshot::new(ReplicaSide::Local, LOCAL_ROOT_ID);
    let mut queue: VecDeque<(PathBuf, String)> =
        VecDeque::from([(root.to_path_buf(), LOCAL_ROOT_ID.to_string())]);

    while let Some((dir, dir_id)) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %dir.display(), %err, "Unreadable directory skipped");
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if dir_id == LOCAL_ROOT_ID && options.skip_top_level.contains(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                debug!(path = %path.display(), "Unreadable metadata, item skipped");
                continue;
            };

            let kind = if metadata.file_type().is_symlink() {
                NodeKind::Symlink
            } else if metadata.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            let id = file_id(&metadata, &path);
            let checksum = if options.with_checksums && kind == NodeKind::File {
                checksum_of(&path)
            } else {
                None
            };

            let item = SnapshotItem {
                id: id.clone(),
                parent_id: dir_id.clone(),
                name,
                kind,
                size: if kind == NodeKind::File {
                    metadata.len() as i64
                } else {
                    0
                },
                created_at: system_time_secs(metadata.created().ok()),
                modified_at: system_time_secs(metadata.modified().ok()),
                checksum,
                is_link: kind == NodeKind::Symlink,
            };
            if !snapshot.upsert(item) {
                warn!(path = %path.display(), "Item violating snapshot invariants skipped");
                continue;
            }
            if kind == NodeKind::Directory {
                queue.push_back((path, id));
            }
        }
    }
    Ok(snapshot)
}

/// Stable replica id of an on-disk item, `None` when unreadable.
pub fn file_id_at(path: &Path) -> Option<String> {
    let metadata = std::fs::symlink_metadata(path).ok()?;
    Some(file_id(&metadata, path))
}

/// Hex blake3 digest of a file, `None` when unreadable.
pub fn checksum_of(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    Some(blake3::hash(&data).to_hex().to_string())
}

fn system_time_secs(time: Option<SystemTime>) -> SyncTime {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as SyncTime)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata, _path: &Path) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}-{}", metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata, path: &Path) -> String {
    // Without a stable inode, fall back to the path itself; moves then show
    // up as delete+create, which the pipeline already handles.
    format!("path-{}", path.display())
}
