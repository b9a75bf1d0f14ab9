//! Placeholder / virtual-file capability
//!
//! On platforms with a cloud-files provider, local files may be placeholders
//! whose data is not on disk. The engine only talks to the provider through
//! this trait: dehydrated placeholders are never uploaded and are valid
//! delete targets.

use crate::shared::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Whether virtual files are in use for a sync pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsMode {
    #[default]
    Off,
    On,
}

/// Placeholder state of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfsStatus {
    pub is_placeholder: bool,
    pub is_hydrated: bool,
    pub is_syncing: bool,
}

impl VfsStatus {
    pub fn is_dehydrated_placeholder(&self) -> bool {
        self.is_placeholder && !self.is_hydrated && !self.is_syncing
    }
}

/// User intent about keeping a file's data on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PinState {
    #[default]
    Unspecified,
    /// Keep the data on disk; downloads hydrate immediately.
    AlwaysLocal,
    /// Data stays in the cloud until the user opens the file.
    OnlineOnly,
}

/// Capability interface over the platform's cloud-files provider.
///
/// All paths are relative to the sync root. The engine performs at most one
/// status call per path per operation.
#[async_trait]
pub trait Vfs: Send + Sync {
    fn mode(&self) -> VfsMode;

    async fn status(&self, relative: &Path) -> SyncResult<VfsStatus>;

    async fn pin_state(&self, relative: &Path) -> SyncResult<PinState>;

    /// Create a dehydrated placeholder advertising the given size and mtime.
    async fn create_placeholder(&self, relative: &Path, size: i64, mtime: i64) -> SyncResult;

    /// Turn an existing on-disk item into a placeholder.
    async fn convert_to_placeholder(&self, relative: &Path, hydrated: bool) -> SyncResult;

    /// Force the provider's recorded state, e.g. back to dehydrated after an
    /// aborted hydration.
    async fn force_status(&self, relative: &Path, status: VfsStatus) -> SyncResult;

    /// Drop per-pass provider state at the end of a pass.
    async fn clean_up_statuses(&self) -> SyncResult;
}

/// `VfsMode::Off` implementation: nothing is ever a placeholder.
#[derive(Debug, Default)]
pub struct NoopVfs;

#[async_trait]
impl Vfs for NoopVfs {
    fn mode(&self) -> VfsMode {
        VfsMode::Off
    }

    async fn status(&self, _relative: &Path) -> SyncResult<VfsStatus> {
        Ok(VfsStatus::default())
    }

    async fn pin_state(&self, _relative: &Path) -> SyncResult<PinState> {
        Ok(PinState::Unspecified)
    }

    async fn create_placeholder(&self, _relative: &Path, _size: i64, _mtime: i64) -> SyncResult {
        Ok(())
    }

    async fn convert_to_placeholder(&self, _relative: &Path, _hydrated: bool) -> SyncResult {
        Ok(())
    }

    async fn force_status(&self, _relative: &Path, _status: VfsStatus) -> SyncResult {
        Ok(())
    }

    async fn clean_up_statuses(&self) -> SyncResult {
        Ok(())
    }
}
