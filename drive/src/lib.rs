//! Client-resident virtual drive engine.
//!
//! Presents a hierarchical, versioned filesystem over flat object storage.
//! The metadata layer (`db`) keeps four mutually-consistent hashtables and
//! never hard-deletes anything; the storage layer (`storage`) abstracts the
//! byte backends behind one streaming trait; `upload` drains staged
//! sources through a backend with bounded concurrency and folds finished
//! uploads back into the metadata store.

pub mod config;
pub mod db;
pub mod error;
pub mod path;
pub mod search;
pub mod storage;
pub mod types;
pub mod upload;

pub use config::Config;
pub use db::{DriveDb, FilePatch, FolderListing, FolderPatch, SearchResults, Snapshot, TableSet};
pub use error::DriveError;
pub use storage::{BackendError, CancelFlag, ChunkStore, StorageBackend};
pub use types::{
    FileFragment, FileId, FileRecord, FolderId, FolderRecord, FullPath, StorageLocation,
    UploadSource,
};
pub use upload::{BatchProgress, UploadItem, UploadRun, UploadStatus, Uploader};
