//! Abstract drive RPC surface

use crate::shared::{ExitCause, ExitCode, NodeId, NodeKind, SyncError, SyncTime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type DriveResult<T> = Result<T, DriveError>;

/// Metadata of one remote object, as returned by the drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub size: i64,
    pub created_at: SyncTime,
    pub modified_at: SyncTime,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub is_link: bool,
}

/// One page of the cursor-based bulk listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkPage {
    pub items: Vec<RemoteItem>,
    pub cursor: Option<String>,
}

/// Identifier of an in-flight upload session. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionId(pub String);

/// Failure reported by the drive or the transport.
#[derive(Debug, Clone, thiserror::Error)]
#[error("drive error {status}: {code} ({description})")]
pub struct DriveError {
    /// HTTP status, 0 when the request never reached the server.
    pub status: u16,
    pub code: String,
    pub description: String,
}

impl DriveError {
    pub fn network(description: impl Into<String>) -> Self {
        Self {
            status: 0,
            code: "network".into(),
            description: description.into(),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == 403 || self.status == 409
    }
}

impl From<DriveError> for SyncError {
    fn from(err: DriveError) -> Self {
        match (err.status, err.code.as_str()) {
            (0, _) | (502..=504, _) => SyncError::network(),
            (_, "invalid_name") => SyncError::back(ExitCause::InvalidName),
            (_, "quota_exceeded") | (507, _) => SyncError::back(ExitCause::QuotaExceeded),
            (_, "upload_not_terminated") => SyncError::back(ExitCause::UploadNotTerminated),
            (_, "file_already_exists") => SyncError::back(ExitCause::FileAlreadyExist),
            (_, "file_too_big") => SyncError::back(ExitCause::FileTooBig),
            (404, _) | (_, "not_found") => SyncError::back(ExitCause::NotFound),
            (426, _) => SyncError::new(ExitCode::UpdateRequired, ExitCause::Unknown),
            _ => SyncError::back(ExitCause::ApiError),
        }
    }
}

/// Operations of the remote drive consumed by the engine.
///
/// Every call maps to one verb+target-id request returning a JSON envelope
/// `{ "data": ... }` or `{ "error": { code, description } }`.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn get_item(&self, id: &NodeId) -> DriveResult<RemoteItem>;

    async fn list_children(
        &self,
        dir_id: &NodeId,
        page: u32,
        per_page: u32,
    ) -> DriveResult<Vec<RemoteItem>>;

    async fn create_dir(&self, parent_id: &NodeId, name: &str) -> DriveResult<RemoteItem>;

    /// Copy an item into a directory, used to duplicate before destructive
    /// recoveries.
    async fn copy_to_dir(
        &self,
        id: &NodeId,
        destination_id: &NodeId,
        name: &str,
    ) -> DriveResult<RemoteItem>;

    async fn move_item(&self, id: &NodeId, destination_id: &NodeId, name: &str) -> DriveResult<()>;

    async fn rename_item(&self, id: &NodeId, name: &str) -> DriveResult<()>;

    async fn delete_item(&self, id: &NodeId) -> DriveResult<()>;

    /// Single-request upload for files below the session threshold.
    async fn upload_small(
        &self,
        parent_id: &NodeId,
        name: &str,
        mtime: SyncTime,
        data: Vec<u8>,
    ) -> DriveResult<RemoteItem>;

    async fn upload_session_start(
        &self,
        parent_id: &NodeId,
        name: &str,
        size: i64,
        mtime: SyncTime,
    ) -> DriveResult<UploadSessionId>;

    async fn upload_chunk(
        &self,
        session: &UploadSessionId,
        index: u64,
        data: Vec<u8>,
    ) -> DriveResult<()>;

    async fn upload_session_finish(&self, session: &UploadSessionId) -> DriveResult<RemoteItem>;

    async fn upload_session_cancel(&self, session: &UploadSessionId) -> DriveResult<()>;

    async fn download(&self, id: &NodeId) -> DriveResult<Vec<u8>>;

    /// Paginated bulk listing of the whole tree below the root.
    async fn bulk_listing(&self, cursor: Option<&str>) -> DriveResult<BulkPage>;
}
