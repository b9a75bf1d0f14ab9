//! Engine-wide error taxonomy
//!
//! Every fallible engine operation surfaces a `SyncError` carrying an
//! `ExitCode` (the broad class, which decides how the pass reacts) and an
//! `ExitCause` (the precise reason, which decides recovery).

use thiserror::Error;

/// Result type used throughout the engine.
pub type SyncResult<T = ()> = Result<T, SyncError>;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ExitCode {
    /// Success with a hint: the operation was intentionally skipped
    /// (`ExitCause::OperationCanceled`) and the pass carries on. Only ever
    /// seen in surfaced records, never propagated as a failure.
    Ok,
    /// Local system failure (disk, permissions, paths).
    SystemError,
    /// The remote drive rejected the request.
    BackError,
    /// The network is unavailable or the request timed out.
    NetworkError,
    /// A tree or database invariant was violated; snapshots must be rebuilt.
    DataError,
    /// The sync database itself failed.
    DbError,
    /// The server requires a newer client.
    UpdateRequired,
    /// Programmer error.
    LogicError,
}

/// Precise reason of a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
pub enum ExitCause {
    #[default]
    Unknown,
    /// The operation was intentionally skipped after local recovery; the
    /// pass continues.
    OperationCanceled,
    NotEnoughDiskSpace,
    FileAccessError,
    SyncDirAccessError,
    NotFound,
    FileAlreadyExist,
    InvalidName,
    FileTooBig,
    QuotaExceeded,
    UploadNotTerminated,
    ApiError,
    DbAccessError,
    WorkerExited,
}

/// A classified engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} ({cause})")]
pub struct SyncError {
    pub code: ExitCode,
    pub cause: ExitCause,
}

impl SyncError {
    pub fn new(code: ExitCode, cause: ExitCause) -> Self {
        Self { code, cause }
    }

    pub fn system(cause: ExitCause) -> Self {
        Self::new(ExitCode::SystemError, cause)
    }

    pub fn back(cause: ExitCause) -> Self {
        Self::new(ExitCode::BackError, cause)
    }

    pub fn network() -> Self {
        Self::new(ExitCode::NetworkError, ExitCause::Unknown)
    }

    pub fn data() -> Self {
        Self::new(ExitCode::DataError, ExitCause::Unknown)
    }

    pub fn db() -> Self {
        Self::new(ExitCode::DbError, ExitCause::DbAccessError)
    }

    pub fn logic() -> Self {
        Self::new(ExitCode::LogicError, ExitCause::Unknown)
    }

    /// Classification of an operation that was intentionally skipped
    /// (cancellation, or recovery that pruned it).
    pub fn canceled() -> Self {
        Self::new(ExitCode::Ok, ExitCause::OperationCanceled)
    }

    /// Errors that stop the whole engine rather than the current pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            ExitCode::DbError | ExitCode::UpdateRequired | ExitCode::LogicError
        )
    }
}

impl From<sea_orm::DbErr> for SyncError {
    fn from(_: sea_orm::DbErr) -> Self {
        Self::db()
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        let cause = match err.kind() {
            std::io::ErrorKind::NotFound => ExitCause::NotFound,
            std::io::ErrorKind::PermissionDenied => ExitCause::FileAccessError,
            std::io::ErrorKind::AlreadyExists => ExitCause::FileAlreadyExist,
            std::io::ErrorKind::StorageFull => ExitCause::NotEnoughDiskSpace,
            _ => ExitCause::Unknown,
        };
        Self::system(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_maps_to_system_cause() {
        let err: SyncError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err, SyncError::system(ExitCause::NotFound));

        let err: SyncError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.cause, ExitCause::FileAccessError);
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::db().is_fatal());
        assert!(SyncError::logic().is_fatal());
        assert!(!SyncError::network().is_fatal());
        assert!(!SyncError::system(ExitCause::NotEnoughDiskSpace).is_fatal());
    }

    #[test]
    fn canceled_is_a_benign_hint() {
        let canceled = SyncError::canceled();
        assert_eq!(canceled.code, ExitCode::Ok);
        assert_eq!(canceled.cause, ExitCause::OperationCanceled);
        assert!(!canceled.is_fatal());
    }
}
