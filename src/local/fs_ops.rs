//! Filesystem operations performed by the executor on the local replica

use crate::shared::{ExitCause, SyncError, SyncResult};
use std::path::Path;
use tracing::debug;

/// Create a directory, parents included.
pub async fn create_dir(path: &Path) -> SyncResult {
    tokio::fs::create_dir_all(path).await.map_err(SyncError::from)
}

/// Write file content atomically: temp file in the same directory, then
/// rename over the destination.
pub async fn write_file(path: &Path, data: &[u8]) -> SyncResult {
    let parent = path.parent().ok_or_else(SyncError::logic)?;
    tokio::fs::create_dir_all(parent).await.map_err(SyncError::from)?;
    let tmp = parent.join(format!(
        ".{}.hovermount-tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    tokio::fs::write(&tmp, data).await.map_err(SyncError::from)?;
    tokio::fs::rename(&tmp, path).await.map_err(SyncError::from)
}

/// Move or rename; the destination name must be free.
pub async fn rename(from: &Path, to: &Path) -> SyncResult {
    if tokio::fs::try_exists(to).await.map_err(SyncError::from)? {
        return Err(SyncError::system(ExitCause::FileAlreadyExist));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(SyncError::from)?;
    }
    tokio::fs::rename(from, to).await.map_err(SyncError::from)
}

/// Remove a file or a whole directory tree.
pub async fn remove(path: &Path) -> SyncResult {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Delete target already gone");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await.map_err(SyncError::from)
    } else {
        tokio::fs::remove_file(path).await.map_err(SyncError::from)
    }
}

/// Set the modification time of a file.
pub async fn set_mtime(path: &Path, mtime_secs: i64) -> SyncResult {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().append(true).open(&path)?;
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime_secs.max(0) as u64);
        file.set_modified(time)
    })
    .await
    .map_err(|_| SyncError::logic())?
    .map_err(SyncError::from)
}

/// Creation time of an on-disk item in epoch seconds, `None` when the
/// filesystem does not report one.
pub fn created_at_of(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .ok()?
        .created()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

/// Free bytes on the partition holding `path`, `-1` when unknown.
#[cfg(unix)]
pub fn free_disk_space(path: &Path) -> i64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return -1;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return -1;
    }
    (stat.f_bavail as i64).saturating_mul(stat.f_frsize as i64)
}

#[cfg(not(unix))]
pub fn free_disk_space(_path: &Path) -> i64 {
    -1
}
