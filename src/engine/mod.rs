//! The sync pipeline
//!
//! A sync pass runs the numbered steps in order, each step a worker over
//! the shared pass state: compute FS operations, build update trees, check
//! platform consistency, find and resolve conflicts, generate and sort the
//! operation list, then execute it.

pub mod compute_ops;
pub mod consistency;
pub mod conflict_finder;
pub mod conflict_resolver;
pub mod executor;
pub mod generator;
pub mod reconcile;
pub mod sorter;
pub mod sync_engine;
pub mod tree_builder;

pub use sync_engine::{EngineHandle, EngineStatus, PassOutcome, SyncEngine};
