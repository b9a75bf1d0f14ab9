//! Remote drive access
//!
//! The engine targets an abstract drive RPC; `DriveClient` is the whole
//! surface it consumes. `HttpDriveClient` implements it over JSON/HTTPS.

pub mod client;
pub mod http;
pub mod snapshot;

pub use client::{BulkPage, DriveClient, DriveError, DriveResult, RemoteItem, UploadSessionId};
pub use http::HttpDriveClient;
pub use snapshot::build_remote_snapshot;
