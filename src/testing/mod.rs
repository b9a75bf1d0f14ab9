//! In-memory doubles used by the test suites
//!
//! `MockDrive` implements the whole [`DriveClient`] surface over a hash map
//! so pipeline and executor behavior can be exercised without a server;
//! `MemoryVfs` plays the platform cloud-files provider.

use crate::remote::client::{
    BulkPage, DriveClient, DriveError, DriveResult, RemoteItem, UploadSessionId,
};
use crate::shared::{NodeId, NodeKind, SyncResult, SyncTime};
use crate::vfs::{PinState, Vfs, VfsMode, VfsStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identifier of the remote root used by the mock drive.
pub const REMOTE_ROOT_ID: &str = "remote-root";

#[derive(Debug, Clone)]
struct MockEntry {
    meta: RemoteItem,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct SessionState {
    parent_id: NodeId,
    name: String,
    size: i64,
    mtime: SyncTime,
    chunks: BTreeMap<u64, Vec<u8>>,
}

#[derive(Debug, Default)]
struct DriveState {
    entries: HashMap<NodeId, MockEntry>,
    sessions: HashMap<String, SessionState>,
    /// Errors returned by the next matching calls, keyed by method name.
    failures: HashMap<&'static str, DriveError>,
}

/// In-memory drive with failure injection.
#[derive(Default)]
pub struct MockDrive {
    state: Mutex<DriveState>,
    next_id: AtomicU64,
    pub calls: AtomicU64,
    per_method: Mutex<HashMap<&'static str, u64>>,
}

impl MockDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> NodeId {
        format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Arrange for the next call of `method` to fail.
    pub fn fail_next(&self, method: &'static str, error: DriveError) {
        self.state.lock().unwrap().failures.insert(method, error);
    }

    fn take_failure(&self, method: &'static str) -> Option<DriveError> {
        self.state.lock().unwrap().failures.remove(method)
    }

    /// Seed a directory; returns its id.
    pub fn seed_dir(&self, parent_id: &str, name: &str) -> NodeId {
        let id = self.alloc_id();
        let meta = RemoteItem {
            id: id.clone(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind: NodeKind::Directory,
            size: 0,
            created_at: 1,
            modified_at: 1,
            checksum: None,
            is_link: false,
        };
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(id.clone(), MockEntry { meta, data: Vec::new() });
        id
    }

    /// Seed a file with content; returns its id.
    pub fn seed_file(&self, parent_id: &str, name: &str, data: &[u8], mtime: SyncTime) -> NodeId {
        let id = self.alloc_id();
        let meta = RemoteItem {
            id: id.clone(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind: NodeKind::File,
            size: data.len() as i64,
            created_at: mtime,
            modified_at: mtime,
            checksum: Some(blake3::hash(data).to_hex().to_string()),
            is_link: false,
        };
        self.state.lock().unwrap().entries.insert(
            id.clone(),
            MockEntry {
                meta,
                data: data.to_vec(),
            },
        );
        id
    }

    pub fn item(&self, id: &str) -> Option<RemoteItem> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .map(|entry| entry.meta.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .map(|entry| entry.data.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a file's content in place, keeping its id.
    pub fn update_file(&self, id: &str, data: &[u8], mtime: SyncTime) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.meta.size = data.len() as i64;
            entry.meta.modified_at = mtime;
            entry.meta.checksum = Some(blake3::hash(data).to_hex().to_string());
            entry.data = data.to_vec();
        }
    }

    /// Child of a directory by exact name.
    pub fn child_named(&self, parent_id: &str, name: &str) -> Option<RemoteItem> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .find(|entry| entry.meta.parent_id == parent_id && entry.meta.name == name)
            .map(|entry| entry.meta.clone())
    }

    fn check(&self, method: &'static str) -> DriveResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_method.lock().unwrap().entry(method).or_insert(0) += 1;
        match self.take_failure(method) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// How many times one RPC was invoked.
    pub fn count(&self, method: &'static str) -> u64 {
        self.per_method
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    fn not_found() -> DriveError {
        DriveError {
            status: 404,
            code: "not_found".into(),
            description: "no such item".into(),
        }
    }
}

#[async_trait]
impl DriveClient for MockDrive {
    async fn get_item(&self, id: &NodeId) -> DriveResult<RemoteItem> {
        self.check("get_item")?;
        self.item(id).ok_or_else(Self::not_found)
    }

    async fn list_children(
        &self,
        dir_id: &NodeId,
        page: u32,
        per_page: u32,
    ) -> DriveResult<Vec<RemoteItem>> {
        self.check("list_children")?;
        let state = self.state.lock().unwrap();
        let mut children: Vec<RemoteItem> = state
            .entries
            .values()
            .filter(|entry| entry.meta.parent_id == *dir_id)
            .map(|entry| entry.meta.clone())
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        let start = ((page.max(1) - 1) * per_page) as usize;
        Ok(children
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect())
    }

    async fn create_dir(&self, parent_id: &NodeId, name: &str) -> DriveResult<RemoteItem> {
        self.check("create_dir")?;
        if self.child_named(parent_id, name).is_some() {
            return Err(DriveError {
                status: 409,
                code: "file_already_exists".into(),
                description: name.to_string(),
            });
        }
        let id = self.seed_dir(parent_id, name);
        Ok(self.item(&id).unwrap())
    }

    async fn copy_to_dir(
        &self,
        id: &NodeId,
        destination_id: &NodeId,
        name: &str,
    ) -> DriveResult<RemoteItem> {
        self.check("copy_to_dir")?;
        let source = self
            .state
            .lock()
            .unwrap()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(Self::not_found)?;
        let new_id = self.seed_file(destination_id, name, &source.data, source.meta.modified_at);
        Ok(self.item(&new_id).unwrap())
    }

    async fn move_item(&self, id: &NodeId, destination_id: &NodeId, name: &str) -> DriveResult<()> {
        self.check("move_item")?;
        let mut state = self.state.lock().unwrap();
        if !state.entries.contains_key(destination_id) && destination_id != REMOTE_ROOT_ID {
            return Err(Self::not_found());
        }
        let entry = state.entries.get_mut(id).ok_or_else(Self::not_found)?;
        entry.meta.parent_id = destination_id.clone();
        entry.meta.name = name.to_string();
        Ok(())
    }

    async fn rename_item(&self, id: &NodeId, name: &str) -> DriveResult<()> {
        self.check("rename_item")?;
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.get_mut(id).ok_or_else(Self::not_found)?;
        entry.meta.name = name.to_string();
        Ok(())
    }

    async fn delete_item(&self, id: &NodeId) -> DriveResult<()> {
        self.check("delete_item")?;
        let mut state = self.state.lock().unwrap();
        if state.entries.remove(id).is_none() {
            return Err(Self::not_found());
        }
        // Drop the whole subtree like the drive does
        let mut doomed: Vec<NodeId> = vec![id.clone()];
        while let Some(parent) = doomed.pop() {
            let children: Vec<NodeId> = state
                .entries
                .values()
                .filter(|entry| entry.meta.parent_id == parent)
                .map(|entry| entry.meta.id.clone())
                .collect();
            for child in children {
                state.entries.remove(&child);
                doomed.push(child);
            }
        }
        Ok(())
    }

    async fn upload_small(
        &self,
        parent_id: &NodeId,
        name: &str,
        mtime: SyncTime,
        data: Vec<u8>,
    ) -> DriveResult<RemoteItem> {
        self.check("upload_small")?;
        if let Some(existing) = self.child_named(parent_id, name) {
            // Overwrite in place, keeping the id
            let mut state = self.state.lock().unwrap();
            let entry = state.entries.get_mut(&existing.id).unwrap();
            entry.meta.size = data.len() as i64;
            entry.meta.modified_at = mtime;
            entry.meta.checksum = Some(blake3::hash(&data).to_hex().to_string());
            entry.data = data;
            return Ok(entry.meta.clone());
        }
        let id = self.seed_file(parent_id, name, &data, mtime);
        Ok(self.item(&id).unwrap())
    }

    async fn upload_session_start(
        &self,
        parent_id: &NodeId,
        name: &str,
        size: i64,
        mtime: SyncTime,
    ) -> DriveResult<UploadSessionId> {
        self.check("upload_session_start")?;
        let session_id = format!("session-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.state.lock().unwrap().sessions.insert(
            session_id.clone(),
            SessionState {
                parent_id: parent_id.clone(),
                name: name.to_string(),
                size,
                mtime,
                chunks: BTreeMap::new(),
            },
        );
        Ok(UploadSessionId(session_id))
    }

    async fn upload_chunk(
        &self,
        session: &UploadSessionId,
        index: u64,
        data: Vec<u8>,
    ) -> DriveResult<()> {
        self.check("upload_chunk")?;
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&session.0)
            .ok_or_else(Self::not_found)?;
        session.chunks.insert(index, data);
        Ok(())
    }

    async fn upload_session_finish(&self, session: &UploadSessionId) -> DriveResult<RemoteItem> {
        self.check("upload_session_finish")?;
        let finished = {
            let mut state = self.state.lock().unwrap();
            state
                .sessions
                .remove(&session.0)
                .ok_or_else(Self::not_found)?
        };
        let mut data = Vec::with_capacity(finished.size.max(0) as usize);
        for chunk in finished.chunks.values() {
            data.extend_from_slice(chunk);
        }
        if data.len() as i64 != finished.size {
            return Err(DriveError {
                status: 422,
                code: "upload_not_terminated".into(),
                description: format!("expected {} bytes, got {}", finished.size, data.len()),
            });
        }
        let id = self.seed_file(&finished.parent_id, &finished.name, &data, finished.mtime);
        Ok(self.item(&id).unwrap())
    }

    async fn upload_session_cancel(&self, session: &UploadSessionId) -> DriveResult<()> {
        self.check("upload_session_cancel")?;
        self.state.lock().unwrap().sessions.remove(&session.0);
        Ok(())
    }

    async fn download(&self, id: &NodeId) -> DriveResult<Vec<u8>> {
        self.check("download")?;
        self.content(id).ok_or_else(Self::not_found)
    }

    async fn bulk_listing(&self, _cursor: Option<&str>) -> DriveResult<BulkPage> {
        self.check("bulk_listing")?;
        let state = self.state.lock().unwrap();
        let mut items: Vec<RemoteItem> =
            state.entries.values().map(|entry| entry.meta.clone()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(BulkPage {
            items,
            cursor: None,
        })
    }
}

#[derive(Debug, Default)]
struct VfsState {
    statuses: HashMap<PathBuf, VfsStatus>,
    pins: HashMap<PathBuf, PinState>,
    default_pin: PinState,
    forced: Vec<(PathBuf, VfsStatus)>,
}

/// In-memory cloud-files provider double.
///
/// When given the sync root, placeholders materialize as sparse files of the
/// advertised size, like the real provider's on-disk entries.
#[derive(Debug, Default)]
pub struct MemoryVfs {
    state: Mutex<VfsState>,
    root: Option<PathBuf>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_default_pin(pin: PinState) -> Self {
        let vfs = Self::new();
        vfs.state.lock().unwrap().default_pin = pin;
        vfs
    }

    pub fn set_status(&self, relative: impl Into<PathBuf>, status: VfsStatus) {
        self.state.lock().unwrap().statuses.insert(relative.into(), status);
    }

    pub fn set_pin(&self, relative: impl Into<PathBuf>, pin: PinState) {
        self.state.lock().unwrap().pins.insert(relative.into(), pin);
    }

    /// Paths whose status was forced by the engine, in call order.
    pub fn forced_statuses(&self) -> Vec<(PathBuf, VfsStatus)> {
        self.state.lock().unwrap().forced.clone()
    }
}

#[async_trait]
impl Vfs for MemoryVfs {
    fn mode(&self) -> VfsMode {
        VfsMode::On
    }

    async fn status(&self, relative: &Path) -> SyncResult<VfsStatus> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(relative)
            .copied()
            .unwrap_or_default())
    }

    async fn pin_state(&self, relative: &Path) -> SyncResult<PinState> {
        let state = self.state.lock().unwrap();
        Ok(state.pins.get(relative).copied().unwrap_or(state.default_pin))
    }

    async fn create_placeholder(&self, relative: &Path, size: i64, mtime: i64) -> SyncResult {
        if let Some(root) = &self.root {
            let absolute = root.join(relative);
            if let Some(parent) = absolute.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&absolute)?;
            file.set_len(size.max(0) as u64)?;
            let time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime.max(0) as u64);
            file.set_modified(time)?;
        }
        self.state.lock().unwrap().statuses.insert(
            relative.to_path_buf(),
            VfsStatus {
                is_placeholder: true,
                is_hydrated: false,
                is_syncing: false,
            },
        );
        Ok(())
    }

    async fn convert_to_placeholder(&self, relative: &Path, hydrated: bool) -> SyncResult {
        self.state.lock().unwrap().statuses.insert(
            relative.to_path_buf(),
            VfsStatus {
                is_placeholder: true,
                is_hydrated: hydrated,
                is_syncing: false,
            },
        );
        Ok(())
    }

    async fn force_status(&self, relative: &Path, status: VfsStatus) -> SyncResult {
        let mut state = self.state.lock().unwrap();
        state.statuses.insert(relative.to_path_buf(), status);
        state.forced.push((relative.to_path_buf(), status));
        Ok(())
    }

    async fn clean_up_statuses(&self) -> SyncResult {
        self.state.lock().unwrap().forced.clear();
        Ok(())
    }
}
