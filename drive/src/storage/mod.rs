//! Backend adapter contract.
//!
//! One implementation exists per storage location. The engine only ever
//! talks to a backend through this trait: uploads are tick streams ending
//! in a terminal `percent == 100` event, bytes come back as streams or
//! whole blobs, and the four metadata hashtables are persisted as opaque
//! JSON documents under a fixed set of table names.

pub mod chunked;

use crate::types::{FileFragment, FileId, UploadSource};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::Stream;

pub use chunked::ChunkStore;

/// Backend-specific failures. These surface through the upload stream's
/// error channel and mark the affected item `Failed`; they never abort the
/// rest of a batch. Retry policy, where any exists, lives in the adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage backend is not initialized")]
    NotInitialized,
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The closed set of persisted hashtables. Table names keep the original
/// on-disk identifiers so existing stores load unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    FolderPathToId,
    FilePathToId,
    FolderRecords,
    FileRecords,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::FolderPathToId,
        TableKind::FilePathToId,
        TableKind::FolderRecords,
        TableKind::FileRecords,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::FolderPathToId => "fullFolderPathToUUID",
            TableKind::FilePathToId => "fullFilePathToUUID",
            TableKind::FolderRecords => "folderUUIDToMetadata",
            TableKind::FileRecords => "fileUUIDToMetadata",
        }
    }
}

/// Cooperative cancellation signal. Adapters must poll this between chunk
/// transfers and end the stream early (without a terminal 100% tick) once
/// it is set. Checking more often is allowed, interrupting mid-chunk is
/// not required.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One progress event from an in-flight upload. The fragment carries the
/// backend-assigned id, final size and raw location; it is authoritative
/// once `percent` reaches 100.
#[derive(Debug, Clone)]
pub struct UploadTick {
    pub percent: u8,
    pub fragment: FileFragment,
}

pub type UploadStream = Pin<Box<dyn Stream<Item = Result<UploadTick, BackendError>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BackendError>> + Send>>;

/// Byte-storage collaborator behind every storage location.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stream an upload. Must emit at least one tick at `percent == 100` as
    /// the terminal success event, then complete. `preset_id` lets the
    /// caller pin the file id instead of having the backend allocate one.
    fn upload(
        &self,
        source: UploadSource,
        preset_id: Option<FileId>,
        cancel: CancelFlag,
    ) -> UploadStream;

    /// Stream the bytes stored at a raw location.
    fn fetch(&self, raw_location: &str) -> ByteStream;

    /// Fetch an entire object into memory.
    async fn fetch_whole(&self, raw_location: &str) -> Result<Vec<u8>, BackendError>;

    /// Remove an object. Returns whether anything existed.
    async fn remove(&self, raw_location: &str) -> Result<bool, BackendError>;

    /// Durably store one of the four metadata hashtables.
    async fn persist_table(
        &self,
        kind: TableKind,
        data: serde_json::Value,
    ) -> Result<(), BackendError>;

    /// Load a previously persisted hashtable, or `None` if absent.
    async fn load_table(&self, kind: TableKind) -> Result<Option<serde_json::Value>, BackendError>;
}
