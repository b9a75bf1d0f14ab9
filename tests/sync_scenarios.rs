//! End-to-end sync scenarios over a mock drive and a tempdir replica

use hv_sync_core::engine::PassOutcome;
use hv_sync_core::local::snapshot::LOCAL_ROOT_ID;
use hv_sync_core::remote::DriveClient;
use hv_sync_core::testing::{MemoryVfs, MockDrive, REMOTE_ROOT_ID};
use hv_sync_core::vfs::{NoopVfs, Vfs};
use hv_sync_core::{SyncConfig, SyncEngine};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    local: TempDir,
    _data: TempDir,
    drive: Arc<MockDrive>,
    engine: SyncEngine,
}

impl Harness {
    async fn new() -> Self {
        Self::build(|_| Arc::new(NoopVfs), |_| {}).await
    }

    async fn with_vfs(vfs_for: impl FnOnce(&Path) -> Arc<dyn Vfs>) -> Self {
        Self::build(vfs_for, |_| {}).await
    }

    async fn build(
        vfs_for: impl FnOnce(&Path) -> Arc<dyn Vfs>,
        tweak: impl FnOnce(&mut SyncConfig),
    ) -> Self {
        let local = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let mut config = SyncConfig::new(
            local.path().to_path_buf(),
            REMOTE_ROOT_ID.to_string(),
            data.path().to_path_buf(),
        );
        tweak(&mut config);
        let vfs = vfs_for(local.path());
        let drive = Arc::new(MockDrive::new());
        let engine = SyncEngine::new(config, drive.clone(), vfs).await.unwrap();
        Self {
            local,
            _data: data,
            drive,
            engine,
        }
    }

    fn local_path(&self, relative: &str) -> std::path::PathBuf {
        self.local.path().join(relative)
    }

    fn write_local(&self, relative: &str, data: &[u8]) {
        let path = self.local_path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    /// Run passes until the engine stops requesting restarts.
    async fn converge(&mut self) -> PassOutcome {
        for _ in 0..8 {
            let outcome = self.engine.run_pass().await.unwrap();
            if !outcome.restart {
                return outcome;
            }
        }
        panic!("engine never converged");
    }

    async fn db_row_names(&self, relative_local: &str) -> Option<(String, String)> {
        let cache = self
            .engine
            .db()
            .load_cache(&LOCAL_ROOT_ID.to_string(), &REMOTE_ROOT_ID.to_string())
            .await
            .unwrap();
        let db_id =
            cache.db_id_by_path(hv_sync_core::shared::ReplicaSide::Local, Path::new(relative_local))?;
        let row = cache.node(db_id)?;
        Some((row.local_name.clone(), row.remote_name.clone()))
    }
}

#[tokio::test]
async fn initial_upload_and_idle_rerun() {
    let mut harness = Harness::new().await;
    harness.write_local("docs/report.txt", b"hello drive");

    let outcome = harness.converge().await;
    assert!(outcome.executed >= 2); // directory + file

    let dir = harness.drive.child_named(REMOTE_ROOT_ID, "docs").unwrap();
    let file = harness.drive.child_named(&dir.id, "report.txt").unwrap();
    assert_eq!(harness.drive.content(&file.id).unwrap(), b"hello drive");

    // Re-run stability: an unchanged replica produces zero operations.
    let second = harness.engine.run_pass().await.unwrap();
    assert!(second.idle);
    assert_eq!(second.executed, 0);
}

#[tokio::test]
async fn remote_changes_download() {
    let mut harness = Harness::new().await;
    let dir = harness.drive.seed_dir(REMOTE_ROOT_ID, "shared");
    harness.drive.seed_file(&dir, "note.md", b"from the drive", 100);

    harness.converge().await;
    assert_eq!(
        std::fs::read(harness.local_path("shared/note.md")).unwrap(),
        b"from the drive"
    );
}

#[tokio::test]
async fn local_rename_propagates_to_remote() {
    let mut harness = Harness::new().await;
    let remote_id = harness
        .drive
        .seed_file(REMOTE_ROOT_ID, "a.txt", b"payload", 100);
    harness.converge().await;
    assert!(harness.local_path("a.txt").exists());

    std::fs::rename(harness.local_path("a.txt"), harness.local_path("b.txt")).unwrap();
    harness.converge().await;

    // Same remote object, new name; DB rows agree on both sides.
    let item = harness.drive.item(&remote_id).unwrap();
    assert_eq!(item.name, "b.txt");
    assert_eq!(
        harness.db_row_names("b.txt").await.unwrap(),
        ("b.txt".to_string(), "b.txt".to_string())
    );
}

#[tokio::test]
async fn rename_back_is_bijective() {
    let mut harness = Harness::new().await;
    harness.drive.seed_file(REMOTE_ROOT_ID, "a.txt", b"payload", 100);
    harness.converge().await;

    std::fs::rename(harness.local_path("a.txt"), harness.local_path("b.txt")).unwrap();
    harness.converge().await;
    std::fs::rename(harness.local_path("b.txt"), harness.local_path("a.txt")).unwrap();
    harness.converge().await;

    let item = harness.drive.child_named(REMOTE_ROOT_ID, "a.txt").unwrap();
    assert_eq!(harness.drive.content(&item.id).unwrap(), b"payload");
    assert!(harness.drive.child_named(REMOTE_ROOT_ID, "b.txt").is_none());
    assert!(harness.local_path("a.txt").exists());
    assert!(!harness.local_path("b.txt").exists());

    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}

#[tokio::test]
async fn simultaneous_edit_keeps_both_versions() {
    let mut harness = Harness::new().await;
    harness.drive.seed_file(REMOTE_ROOT_ID, "doc", b"v0", 100);
    harness.converge().await;

    // Both sides write before the next pass; sizes differ so content
    // comparison cannot call it a pseudo conflict.
    harness.write_local("doc", b"local version");
    let remote_doc = harness.drive.child_named(REMOTE_ROOT_ID, "doc").unwrap();
    harness.drive.update_file(&remote_doc.id, b"remote v9", 200);

    harness.converge().await;

    // The remote version won the original name locally.
    assert_eq!(
        std::fs::read(harness.local_path("doc")).unwrap(),
        b"remote v9"
    );
    // The local version survives under a conflict-marked name.
    let conflicted: Vec<String> = std::fs::read_dir(harness.local.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("conflict"))
        .collect();
    assert_eq!(conflicted.len(), 1, "{conflicted:?}");
    assert_eq!(
        std::fs::read(harness.local_path(&conflicted[0])).unwrap(),
        b"local version"
    );
}

#[tokio::test]
async fn move_into_remotely_deleted_dir_rescues_file() {
    let mut harness = Harness::new().await;
    let src = harness.drive.seed_dir(REMOTE_ROOT_ID, "src");
    harness.drive.seed_file(&src, "f", b"precious", 100);
    let dst = harness.drive.seed_dir(REMOTE_ROOT_ID, "dst");
    harness.converge().await;

    // Local moves f into dst while the remote deletes dst.
    std::fs::rename(harness.local_path("src/f"), harness.local_path("dst/f")).unwrap();
    harness.drive.delete_item(&dst).await.unwrap();

    harness.converge().await;

    // The deletion propagated locally and the moved file was rescued.
    assert!(!harness.local_path("dst").exists());
    let rescue_dirs: Vec<std::path::PathBuf> = std::fs::read_dir(harness.local.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().starts_with(".rescue-"))
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(rescue_dirs.len(), 1);
    assert_eq!(
        std::fs::read(rescue_dirs[0].join("f")).unwrap(),
        b"precious"
    );
}

#[tokio::test]
async fn crossing_directory_moves_converge() {
    let mut harness = Harness::new().await;
    let a = harness.drive.seed_dir(REMOTE_ROOT_ID, "A");
    let b = harness.drive.seed_dir(REMOTE_ROOT_ID, "B");
    harness.converge().await;

    // Local: /A into /B; remote: /B into /A.
    std::fs::rename(harness.local_path("A"), harness.local_path("B/A")).unwrap();
    harness.drive.move_item(&b, &a, "B").await.unwrap();

    harness.converge().await;
    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);

    // The remote move won; the local one was undone.
    assert!(harness.local_path("A/B").is_dir());
    assert!(!harness.local_path("B").exists());
    let remote_a = harness.drive.item(&a).unwrap();
    assert_eq!(remote_a.parent_id, REMOTE_ROOT_ID);
    let remote_b = harness.drive.item(&b).unwrap();
    assert_eq!(remote_b.parent_id, a);
}

#[tokio::test]
async fn placeholder_create_skips_download() {
    let mut vfs_handle = None;
    let mut harness = Harness::with_vfs(|root| {
        let vfs = Arc::new(MemoryVfs::with_root(root));
        vfs_handle = Some(vfs.clone());
        vfs
    })
    .await;
    let vfs = vfs_handle.unwrap();
    let payload = vec![7u8; 50 * 1024];
    harness.drive.seed_file(REMOTE_ROOT_ID, "movie.mkv", &payload, 100);

    harness.converge().await;

    // A dehydrated placeholder appeared and not a byte was downloaded.
    assert_eq!(harness.drive.count("download"), 0);
    let on_disk = std::fs::metadata(harness.local_path("movie.mkv")).unwrap();
    assert_eq!(on_disk.len(), 50 * 1024); // sparse, size only advertised
    let status = vfs.status(Path::new("movie.mkv")).await.unwrap();
    assert!(status.is_placeholder && !status.is_hydrated);

    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
    assert_eq!(harness.drive.count("download"), 0);
}

#[tokio::test]
async fn dehydrated_placeholder_is_never_uploaded() {
    let mut vfs_handle = None;
    let mut harness = Harness::with_vfs(|root| {
        let vfs = Arc::new(MemoryVfs::with_root(root));
        vfs_handle = Some(vfs.clone());
        vfs
    })
    .await;
    let vfs = vfs_handle.unwrap();

    // A local file that the provider reports as a dehydrated placeholder.
    harness.write_local("ghost.bin", b"should not go up");
    vfs.set_status(
        "ghost.bin",
        hv_sync_core::vfs::VfsStatus {
            is_placeholder: true,
            is_hydrated: false,
            is_syncing: false,
        },
    );

    harness.converge().await;
    assert_eq!(harness.drive.count("upload_small"), 0);
    assert_eq!(harness.drive.count("upload_session_start"), 0);
    assert!(harness.drive.child_named(REMOTE_ROOT_ID, "ghost.bin").is_none());
}

#[tokio::test]
async fn large_upload_goes_through_a_session() {
    let mut harness = Harness::build(|_| Arc::new(NoopVfs), |config| {
        config.upload_session_threshold = 16 * 1024;
        config.upload_chunk_size = 8 * 1024;
        config.max_parallel_chunks = 3;
    })
    .await;

    let payload: Vec<u8> = (0..97 * 1024u32).map(|i| (i % 251) as u8).collect();
    harness.write_local("big.bin", &payload);
    harness.converge().await;

    assert_eq!(harness.drive.count("upload_small"), 0);
    assert_eq!(harness.drive.count("upload_session_start"), 1);
    assert!(harness.drive.count("upload_chunk") >= 12);

    let item = harness.drive.child_named(REMOTE_ROOT_ID, "big.bin").unwrap();
    assert_eq!(harness.drive.content(&item.id).unwrap(), payload);

    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}

#[tokio::test]
async fn identical_files_on_both_sides_sync_without_transfers() {
    let mut harness = Harness::new().await;
    harness.write_local("same.txt", b"twins");
    let mtime = std::fs::metadata(harness.local_path("same.txt"))
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    harness
        .drive
        .seed_file(REMOTE_ROOT_ID, "same.txt", b"twins", mtime);

    harness.converge().await;

    // Pseudo-conflict elision: no transfer in either direction.
    assert_eq!(harness.drive.count("download"), 0);
    assert_eq!(harness.drive.count("upload_small"), 0);
    assert!(harness.db_row_names("same.txt").await.is_some());

    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}

#[tokio::test]
async fn local_edit_uploads_new_content() {
    let mut harness = Harness::new().await;
    harness.drive.seed_file(REMOTE_ROOT_ID, "notes.txt", b"v1", 100);
    harness.converge().await;

    harness.write_local("notes.txt", b"v2 with more text");
    harness.converge().await;

    let item = harness.drive.child_named(REMOTE_ROOT_ID, "notes.txt").unwrap();
    assert_eq!(
        harness.drive.content(&item.id).unwrap(),
        b"v2 with more text"
    );
    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}

#[tokio::test]
async fn remote_edit_downloads_new_content() {
    let mut harness = Harness::new().await;
    let id = harness.drive.seed_file(REMOTE_ROOT_ID, "notes.txt", b"v1", 100);
    harness.converge().await;

    harness.drive.update_file(&id, b"fresh remote bytes", 300);
    harness.converge().await;

    assert_eq!(
        std::fs::read(harness.local_path("notes.txt")).unwrap(),
        b"fresh remote bytes"
    );
    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}

#[tokio::test]
async fn run_loop_syncs_and_stops_on_handle() {
    hv_sync_core::init_logging();
    let harness = Harness::new().await;
    harness.write_local("hello.txt", b"hi");
    let Harness {
        local,
        _data,
        drive,
        engine,
    } = harness;

    let handle = engine.handle();
    let mut events = handle.subscribe();
    let running = tokio::spawn(engine.run());

    // Wait until the first pass finished, then ask for a stop.
    loop {
        match events.recv().await.unwrap() {
            hv_sync_core::SyncEvent::PassCompleted { .. } => break,
            _ => continue,
        }
    }
    handle.stop();
    running.await.unwrap().unwrap();

    assert!(drive.child_named(REMOTE_ROOT_ID, "hello.txt").is_some());
    drop(local);
}

#[tokio::test]
async fn remote_delete_propagates_locally() {
    let mut harness = Harness::new().await;
    let dir = harness.drive.seed_dir(REMOTE_ROOT_ID, "old");
    harness.drive.seed_file(&dir, "junk.txt", b"x", 100);
    harness.converge().await;
    assert!(harness.local_path("old/junk.txt").exists());

    harness.drive.delete_item(&dir).await.unwrap();
    harness.converge().await;
    assert!(!harness.local_path("old").exists());

    let idle = harness.engine.run_pass().await.unwrap();
    assert!(idle.idle);
}
