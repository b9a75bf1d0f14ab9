//! Per-sync-pair configuration

use crate::vfs::VfsMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

const CONFIG_FILE: &str = "sync-pair.json";
const CONFIG_VERSION: u32 = 1;

/// Configuration of one synchronized pair (local directory, remote folder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Config schema version
    pub version: u32,

    /// Stable identifier of this sync pair
    pub sync_pair_id: Uuid,

    /// Root of the local replica
    pub local_path: PathBuf,

    /// Drive id of the remote root folder
    pub remote_root_id: String,

    /// Directory holding the sync database and scratch files
    pub data_dir: PathBuf,

    /// Virtual-file support of the platform
    pub vfs_mode: VfsMode,

    /// Bytes kept free on the local partition beyond pending downloads
    pub free_space_margin: i64,

    /// Uploads above this size go through an upload session
    pub upload_session_threshold: i64,

    /// Chunk size inside an upload session
    pub upload_chunk_size: i64,

    /// Parallel chunk uploads per session
    pub max_parallel_chunks: usize,

    /// Worker threads of the job manager
    pub max_jobs: usize,

    /// Executed changes above this count force a local rescan next pass
    pub snapshot_invalidation_threshold: u64,

    /// Seconds between progress pushes
    pub send_progress_secs: u64,
}

impl SyncConfig {
    pub fn new(local_path: PathBuf, remote_root_id: String, data_dir: PathBuf) -> Self {
        Self {
            version: CONFIG_VERSION,
            sync_pair_id: Uuid::new_v4(),
            local_path,
            remote_root_id,
            data_dir,
            vfs_mode: VfsMode::Off,
            free_space_margin: 500 * 1024 * 1024,
            upload_session_threshold: 16 * 1024 * 1024,
            upload_chunk_size: 8 * 1024 * 1024,
            max_parallel_chunks: 4,
            max_jobs: default_max_jobs(),
            snapshot_invalidation_threshold: 5_000,
            send_progress_secs: 1,
        }
    }

    /// Load the config stored in `data_dir`, creating a default one when
    /// missing or unreadable.
    pub fn load_or_create(
        local_path: PathBuf,
        remote_root_id: String,
        data_dir: PathBuf,
    ) -> io::Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let json = fs::read_to_string(&config_path)?;
            match serde_json::from_str::<Self>(&json) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded sync-pair config");
                    return Ok(config);
                }
                Err(err) => {
                    warn!(path = %config_path.display(), %err, "Unreadable config, recreating");
                }
            }
        }
        let config = Self::new(local_path, remote_root_id, data_dir);
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(self.data_dir.join(CONFIG_FILE), json)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }

    /// Rescue directory of this pair, relative to the sync root.
    pub fn rescue_dir_name(&self) -> String {
        let short = &self.sync_pair_id.simple().to_string()[..8];
        format!(".rescue-{short}")
    }

    pub fn rescue_dir(&self) -> PathBuf {
        self.local_path.join(self.rescue_dir_name())
    }

    pub fn absolute_local(&self, relative: &Path) -> PathBuf {
        self.local_path.join(relative)
    }
}

fn default_max_jobs() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}
