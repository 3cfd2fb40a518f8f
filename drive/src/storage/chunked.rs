//! Chunked filesystem backend.
//!
//! Objects are split into fixed-size chunks written atomically (temp file
//! plus rename) under a two-character shard directory, and the metadata
//! hashtables persist as JSON documents next to them. This is the local
//! storage location and the reference implementation of the adapter
//! contract, including cancellation polling between chunk writes.

use super::{
    BackendError, ByteStream, CancelFlag, StorageBackend, TableKind, UploadStream, UploadTick,
};
use crate::types::{FileFragment, FileId, UploadSource};
use async_stream::stream;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Fixed chunk size for local transfers.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Chunked object store rooted at a base directory.
pub struct ChunkStore {
    base: PathBuf,
}

impl ChunkStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, BackendError> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(base.join("files"))?;
        std::fs::create_dir_all(base.join("tables"))?;
        Ok(ChunkStore { base })
    }

    /// Store rooted at the configured data path.
    pub fn from_config(config: &crate::config::Config) -> Result<Self, BackendError> {
        ChunkStore::new(&config.data_path)
    }

    /// Object directory for a raw location, sharded by its first 2 chars.
    fn object_dir(&self, raw_location: &str) -> Result<PathBuf, BackendError> {
        if raw_location.len() < 2 || raw_location.contains('/') || raw_location.contains("..") {
            return Err(BackendError::ObjectNotFound(raw_location.to_string()));
        }
        let shard = &raw_location[..2];
        Ok(self.base.join("files").join(shard).join(raw_location))
    }

    fn table_path(&self, kind: TableKind) -> PathBuf {
        self.base.join("tables").join(format!("{}.json", kind.as_str()))
    }

    /// Sorted chunk file paths for an object, in transfer order.
    async fn chunk_paths(&self, raw_location: &str) -> Result<Vec<PathBuf>, BackendError> {
        let dir = self.object_dir(raw_location)?;
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::ObjectNotFound(raw_location.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }
}

/// Write atomically: temp file in the same directory, then rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), BackendError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StorageBackend for ChunkStore {
    fn upload(
        &self,
        source: UploadSource,
        preset_id: Option<FileId>,
        cancel: CancelFlag,
    ) -> UploadStream {
        let base = self.base.clone();
        Box::pin(stream! {
            let id = preset_id.unwrap_or_else(FileId::generate);
            let ext = crate::path::extension(&source.name).to_string();
            let raw_location = if ext.is_empty() {
                id.to_string()
            } else {
                format!("{id}.{ext}")
            };
            let shard = &raw_location[..2.min(raw_location.len())];
            let dir = base.join("files").join(shard).join(&raw_location);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                yield Err(BackendError::Io(e));
                return;
            }

            let mime = source.mime();
            let total = source.bytes.len();
            let fragment = |size: u64| FileFragment {
                id: id.clone(),
                name: source.name.clone(),
                mime_type: mime.clone(),
                size,
                raw_location: raw_location.clone(),
            };

            if total == 0 {
                // Zero-byte object: one empty chunk so fetch still resolves.
                if let Err(e) = write_atomic(&dir.join("000000"), &[]).await {
                    yield Err(e);
                    return;
                }
                yield Ok(UploadTick { percent: 100, fragment: fragment(0) });
                return;
            }

            let mut written = 0usize;
            for (idx, chunk) in source.bytes.chunks(CHUNK_SIZE).enumerate() {
                if cancel.is_cancelled() {
                    tracing::debug!(%id, "upload cancelled between chunks");
                    return;
                }
                if let Err(e) = write_atomic(&dir.join(format!("{idx:06}")), chunk).await {
                    yield Err(e);
                    return;
                }
                written += chunk.len();
                let percent = (written * 100 / total) as u8;
                yield Ok(UploadTick { percent, fragment: fragment(written as u64) });
            }
            tracing::debug!(%id, bytes = total, "stored chunked object");
        })
    }

    fn fetch(&self, raw_location: &str) -> ByteStream {
        let store_base = self.base.clone();
        let raw = raw_location.to_string();
        Box::pin(stream! {
            let store = ChunkStore { base: store_base };
            let paths = match store.chunk_paths(&raw).await {
                Ok(p) => p,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for path in paths {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => yield Ok(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        yield Err(BackendError::ChunkNotFound(path.display().to_string()));
                        return;
                    }
                    Err(e) => {
                        yield Err(BackendError::Io(e));
                        return;
                    }
                }
            }
        })
    }

    async fn fetch_whole(&self, raw_location: &str) -> Result<Vec<u8>, BackendError> {
        let mut out = Vec::new();
        for path in self.chunk_paths(raw_location).await? {
            out.extend(tokio::fs::read(&path).await?);
        }
        Ok(out)
    }

    async fn remove(&self, raw_location: &str) -> Result<bool, BackendError> {
        let dir = self.object_dir(raw_location)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(raw_location, "removed chunked object");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_table(
        &self,
        kind: TableKind,
        data: serde_json::Value,
    ) -> Result<(), BackendError> {
        let payload = serde_json::to_vec(&data)?;
        write_atomic(&self.table_path(kind), &payload).await
    }

    async fn load_table(&self, kind: TableKind) -> Result<Option<serde_json::Value>, BackendError> {
        match tokio::fs::read(self.table_path(kind)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
