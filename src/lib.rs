//! Hovermount sync core
//!
//! Bidirectional synchronization engine keeping a local directory and a
//! remote drive folder convergent. The engine runs sync passes: snapshot
//! diffing, update-tree reconciliation, conflict resolution, operation
//! sorting and bounded-parallel propagation, all backed by a per-pair
//! sqlite database recording the last agreed state.

pub mod config;
pub mod domain;
pub mod engine;
pub mod infrastructure;
pub mod local;
pub mod remote;
pub mod shared;
pub mod testing;
pub mod vfs;

pub use config::SyncConfig;
pub use engine::{EngineHandle, EngineStatus, PassOutcome, SyncEngine};
pub use infrastructure::events::{SyncEvent, SyncStep};
pub use shared::{ExitCause, ExitCode, SyncError, SyncResult};

/// Install a global tracing subscriber honoring `RUST_LOG`, for embedders
/// without their own logging setup. Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
