//! Error taxonomy for metadata-store mutations.
//!
//! Backend failures are a separate taxonomy (`storage::BackendError`) that
//! travels through the upload stream instead of these synchronous results.

use thiserror::Error;

/// Closed error set raised synchronously by metadata mutations. There is no
/// local recovery; the caller decides whether to retry with a new name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriveError {
    #[error("FILE_NOT_FOUND")]
    FileNotFound,
    #[error("FOLDER_NOT_FOUND")]
    FolderNotFound,
    /// Empty name, or a name containing a path separator.
    #[error("INVALID_NAME")]
    InvalidName,
    /// Target path already occupied by a live record.
    #[error("NAME_CONFLICT")]
    NameConflict,
}
