//! Local replica access: snapshot building and filesystem operations

pub mod fs_ops;
pub mod snapshot;

pub use fs_ops::free_disk_space;
pub use snapshot::build_local_snapshot;
