//! SeaORM entities of the sync database

pub mod app_state;
pub mod node;
pub mod selective_sync;
pub mod sync_node;
