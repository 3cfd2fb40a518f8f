//! Batch upload orchestration.
//!
//! Sources are staged in a queue, then a run drains every `Queued` entry
//! through the backend with bounded concurrency. Each worker relays the
//! backend's tick stream into queue state and batch-progress snapshots;
//! the terminal tick's fragment is handed to the metadata store so the
//! record lands under the same id the upload was pinned to. One failed or
//! cancelled item never stops the rest of the batch.

use crate::config::Config;
use crate::db::DriveDb;
use crate::storage::{CancelFlag, StorageBackend};
use crate::types::{FileId, FullPath, UploadSource};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

/// Queue-visible state of one staged upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub id: FileId,
    pub name: String,
    pub path: FullPath,
    pub progress: u8,
    pub status: UploadStatus,
}

struct QueueItem {
    item: UploadItem,
    /// Taken by the worker when the upload starts.
    source: Option<UploadSource>,
    cancel: CancelFlag,
}

/// Aggregate view of the whole queue, emitted on every state change.
/// `percentage` is the floor of the mean per-item progress.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub in_progress: Vec<UploadItem>,
    pub percentage: u8,
}

/// The two output streams of a batch run. Both end when the run is over.
pub struct UploadRun {
    pub progress: UnboundedReceiverStream<BatchProgress>,
    pub completions: UnboundedReceiverStream<FileId>,
}

type ProgressSlot = Arc<Mutex<Option<mpsc::UnboundedSender<BatchProgress>>>>;

pub struct Uploader {
    db: Arc<tokio::sync::Mutex<DriveDb>>,
    backend: Arc<dyn StorageBackend>,
    queue: Arc<Mutex<Vec<QueueItem>>>,
    /// Sender of the active run, so cancel and clear can emit snapshots.
    /// Cleared by the run's supervisor so the progress stream can end.
    progress_tx: ProgressSlot,
    /// Pool size used when `run` is asked for a concurrency of 0.
    default_concurrency: usize,
}

// A poisoned queue lock still holds consistent data; keep going with it.
fn lock(queue: &Mutex<Vec<QueueItem>>) -> MutexGuard<'_, Vec<QueueItem>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn snapshot(queue: &Mutex<Vec<QueueItem>>) -> BatchProgress {
    let q = lock(queue);
    let total_files = q.len();
    let completed_files = q
        .iter()
        .filter(|e| e.item.status == UploadStatus::Completed)
        .count();
    let in_progress: Vec<UploadItem> = q
        .iter()
        .filter(|e| e.item.status == UploadStatus::Uploading)
        .map(|e| e.item.clone())
        .collect();
    let percentage = if total_files == 0 {
        0
    } else {
        (q.iter().map(|e| e.item.progress as usize).sum::<usize>() / total_files) as u8
    };
    BatchProgress {
        total_files,
        completed_files,
        in_progress,
        percentage,
    }
}

fn emit(queue: &Mutex<Vec<QueueItem>>, tx: &mpsc::UnboundedSender<BatchProgress>) {
    let _ = tx.send(snapshot(queue));
}

impl Uploader {
    pub fn new(db: Arc<tokio::sync::Mutex<DriveDb>>, backend: Arc<dyn StorageBackend>) -> Self {
        Uploader::with_config(db, backend, &Config::default())
    }

    pub fn with_config(
        db: Arc<tokio::sync::Mutex<DriveDb>>,
        backend: Arc<dyn StorageBackend>,
        config: &Config,
    ) -> Self {
        Uploader {
            db,
            backend,
            queue: Arc::new(Mutex::new(Vec::new())),
            progress_tx: Arc::new(Mutex::new(None)),
            default_concurrency: config.upload_concurrency,
        }
    }

    /// Stage sources for upload under a destination folder. A source's
    /// `relative_path` hint (directory uploads) wins over its bare name
    /// when the target path is computed. Returns the provisional file ids,
    /// which the finished records will carry.
    pub fn enqueue(&self, sources: Vec<UploadSource>, dest: &FullPath) -> Vec<FileId> {
        let mut ids = Vec::with_capacity(sources.len());
        let mut queue = lock(&self.queue);
        for source in sources {
            let leaf = source
                .relative_path
                .clone()
                .unwrap_or_else(|| source.name.clone());
            let path = crate::path::sanitize(&format!("{}/{}", dest.path, leaf));
            let id = FileId::generate();
            ids.push(id.clone());
            queue.push(QueueItem {
                item: UploadItem {
                    id,
                    name: source.name.clone(),
                    path: FullPath::new(dest.location.clone(), path),
                    progress: 0,
                    status: UploadStatus::Queued,
                },
                source: Some(source),
                cancel: CancelFlag::new(),
            });
        }
        ids
    }

    /// Drain every `Queued` entry with at most `concurrency` uploads in
    /// flight (0 selects the configured default). Returns immediately; the
    /// run proceeds in the background and reports through the returned
    /// streams.
    pub fn run(&self, owner: &str, concurrency: usize) -> UploadRun {
        let concurrency = if concurrency == 0 {
            self.default_concurrency
        } else {
            concurrency
        };
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let slot = self.progress_tx.clone();
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(progress_tx.clone());

        let queue = self.queue.clone();
        let db = self.db.clone();
        let backend = self.backend.clone();
        let owner = owner.to_string();

        tokio::spawn(async move {
            let pending: Vec<FileId> = lock(&queue)
                .iter()
                .filter(|e| e.item.status == UploadStatus::Queued)
                .map(|e| e.item.id.clone())
                .collect();
            tracing::info!(files = pending.len(), concurrency, "starting upload batch");
            emit(&queue, &progress_tx);

            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            let mut workers = JoinSet::new();
            for id in pending {
                let semaphore = semaphore.clone();
                let queue = queue.clone();
                let db = db.clone();
                let backend = backend.clone();
                let progress_tx = progress_tx.clone();
                let done_tx = done_tx.clone();
                let owner = owner.clone();
                workers.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    run_one(&queue, db, backend, &owner, id, &progress_tx, &done_tx).await;
                });
            }
            while workers.join_next().await.is_some() {}
            tracing::info!("upload batch finished");
            // Release the stored sender unless a newer run replaced it,
            // otherwise the progress stream could never end.
            let mut stored = slot.lock().unwrap_or_else(|e| e.into_inner());
            if stored
                .as_ref()
                .is_some_and(|tx| tx.same_channel(&progress_tx))
            {
                *stored = None;
            }
        });

        UploadRun {
            progress: UnboundedReceiverStream::new(progress_rx),
            completions: UnboundedReceiverStream::new(done_rx),
        }
    }

    /// Cancel one staged or in-flight upload. Terminal items are left
    /// alone. Emits a fresh batch snapshot when a run is active.
    pub fn cancel(&self, id: &FileId) {
        {
            let mut queue = lock(&self.queue);
            if let Some(entry) = queue.iter_mut().find(|e| &e.item.id == id) {
                if !entry.item.status.is_terminal() {
                    entry.cancel.cancel();
                    entry.item.status = UploadStatus::Cancelled;
                }
            }
        }
        self.emit_current();
    }

    /// Cancel everything that has not already finished.
    pub fn cancel_all(&self) {
        {
            let mut queue = lock(&self.queue);
            for entry in queue.iter_mut() {
                if !entry.item.status.is_terminal() {
                    entry.cancel.cancel();
                    entry.item.status = UploadStatus::Cancelled;
                }
            }
        }
        self.emit_current();
    }

    /// Drop finished, failed and cancelled entries from the queue.
    pub fn clear_queue(&self) {
        lock(&self.queue).retain(|e| !e.item.status.is_terminal());
        self.emit_current();
    }

    /// Current queue contents, for display.
    pub fn upload_queue(&self) -> Vec<UploadItem> {
        lock(&self.queue).iter().map(|e| e.item.clone()).collect()
    }

    fn emit_current(&self) {
        let tx = self
            .progress_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(tx) = tx {
            emit(&self.queue, &tx);
        }
    }
}

async fn run_one(
    queue: &Mutex<Vec<QueueItem>>,
    db: Arc<tokio::sync::Mutex<DriveDb>>,
    backend: Arc<dyn StorageBackend>,
    owner: &str,
    id: FileId,
    progress_tx: &mpsc::UnboundedSender<BatchProgress>,
    done_tx: &mpsc::UnboundedSender<FileId>,
) {
    let Some((source, cancel, path)) = ({
        let mut q = lock(queue);
        q.iter_mut().find(|e| e.item.id == id).and_then(|entry| {
            // Cancelled while waiting for a permit
            if entry.item.status != UploadStatus::Queued {
                return None;
            }
            entry.item.status = UploadStatus::Uploading;
            entry
                .source
                .take()
                .map(|s| (s, entry.cancel.clone(), entry.item.path.clone()))
        })
    }) else {
        return;
    };
    emit(queue, progress_tx);

    let mut stream = backend.upload(source, Some(id.clone()), cancel);
    let mut final_fragment = None;
    let mut failed = false;
    while let Some(tick) = stream.next().await {
        match tick {
            Ok(tick) => {
                {
                    let mut q = lock(queue);
                    if let Some(entry) = q.iter_mut().find(|e| e.item.id == id) {
                        entry.item.progress = tick.percent;
                    }
                }
                if tick.percent >= 100 {
                    final_fragment = Some(tick.fragment);
                }
                emit(queue, progress_tx);
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "upload failed");
                failed = true;
                break;
            }
        }
    }

    // Terminal transitions are only valid from `Uploading`: a cancel may
    // already have committed the item to `Cancelled` even if the backend
    // still ran its stream to the terminal tick.
    if let Some(fragment) = final_fragment {
        let still_uploading = {
            let mut q = lock(queue);
            match q.iter_mut().find(|e| e.item.id == id) {
                Some(entry) if entry.item.status == UploadStatus::Uploading => {
                    entry.item.status = UploadStatus::Completed;
                    entry.item.progress = 100;
                    true
                }
                _ => false,
            }
        };
        if still_uploading {
            let mut db = db.lock().await;
            db.upsert_file(&path.path, path.location.clone(), owner, Some(&fragment));
            drop(db);
            let _ = done_tx.send(id.clone());
        }
    } else {
        let mut q = lock(queue);
        if let Some(entry) = q.iter_mut().find(|e| e.item.id == id) {
            if entry.item.status == UploadStatus::Uploading {
                entry.item.status = if failed {
                    UploadStatus::Failed
                } else {
                    // Stream ended without a terminal tick: cancelled
                    UploadStatus::Cancelled
                };
            }
        }
    }
    emit(queue, progress_tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        BackendError, ByteStream, CancelFlag, ChunkStore, TableKind, UploadStream, UploadTick,
    };
    use crate::types::{FileFragment, StorageLocation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn loc() -> StorageLocation {
        StorageLocation::BrowserCache
    }

    fn new_uploader_with(backend: Arc<dyn StorageBackend>) -> Uploader {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let db = Arc::new(tokio::sync::Mutex::new(DriveDb::new()));
        Uploader::new(db, backend)
    }

    /// Test double: succeeds in one tick after a short pause, fails for
    /// sources whose name starts with "bad", and tracks peak concurrency.
    /// Deliberately ignores the cancel flag, like an adapter with no
    /// checkpoint inside a sub-chunk transfer.
    struct StubBackend {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl StubBackend {
        fn new() -> Arc<Self> {
            Arc::new(StubBackend {
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StorageBackend for StubBackend {
        fn upload(
            &self,
            source: UploadSource,
            preset_id: Option<FileId>,
            _cancel: CancelFlag,
        ) -> UploadStream {
            let active = self.active.clone();
            let peak = self.peak.clone();
            let id = preset_id.unwrap_or_else(FileId::generate);
            let fail = source.name.starts_with("bad");
            let size = source.bytes.len() as u64;
            let name = source.name.clone();
            Box::pin(async_stream::stream! {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _guard = ActiveGuard(active);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if fail {
                    yield Err(BackendError::QuotaExceeded);
                    return;
                }
                yield Ok(UploadTick {
                    percent: 100,
                    fragment: FileFragment {
                        id: id.clone(),
                        name,
                        mime_type: "application/octet-stream".into(),
                        size,
                        raw_location: id.to_string(),
                    },
                });
            })
        }

        fn fetch(&self, _raw_location: &str) -> ByteStream {
            Box::pin(tokio_stream::empty())
        }

        async fn fetch_whole(&self, _raw_location: &str) -> Result<Vec<u8>, BackendError> {
            Ok(Vec::new())
        }

        async fn remove(&self, _raw_location: &str) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn persist_table(
            &self,
            _kind: TableKind,
            _data: serde_json::Value,
        ) -> Result<(), BackendError> {
            Ok(())
        }

        async fn load_table(
            &self,
            _kind: TableKind,
        ) -> Result<Option<serde_json::Value>, BackendError> {
            Ok(None)
        }
    }

    fn sources(names: &[&str]) -> Vec<UploadSource> {
        names
            .iter()
            .map(|n| UploadSource::new(*n, vec![1u8, 2, 3]))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_uploads_land_in_metadata_store() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        let dest = FullPath::new(loc(), "uploads/");
        let ids = uploader.enqueue(sources(&["a.txt", "b.txt", "c.txt"]), &dest);
        let mut run = uploader.run("u1", 2);

        let mut completed = Vec::new();
        while let Some(id) = run.completions.next().await {
            completed.push(id);
        }
        assert_eq!(completed.len(), 3);
        for id in &ids {
            assert!(completed.contains(id));
        }

        let db = uploader.db.lock().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            let rec = db
                .get_file_by_path(&FullPath::new(loc(), format!("uploads/{name}")))
                .expect("uploaded file recorded");
            assert_eq!(rec.size, 3);
            assert!(!rec.raw_location.is_empty());
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        uploader.enqueue(sources(&["x.bin", "y.bin"]), &FullPath::new(loc(), "d/"));
        let mut run = uploader.run("u1", 5);

        let mut last_completed = 0;
        let mut snapshots = Vec::new();
        while let Some(p) = run.progress.next().await {
            assert!(p.completed_files >= last_completed, "completed count regressed");
            last_completed = p.completed_files;
            snapshots.push(p);
        }
        let last = snapshots.last().unwrap();
        assert_eq!(last.completed_files, 2);
        assert_eq!(last.percentage, 100);
        assert!(last.in_progress.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_item() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        let dest = FullPath::new(loc(), "d/");
        let ids = uploader.enqueue(sources(&["keep.txt", "drop.txt"]), &dest);
        uploader.cancel(&ids[1]);

        let mut run = uploader.run("u1", 2);
        let mut completed = Vec::new();
        while let Some(id) = run.completions.next().await {
            completed.push(id);
        }
        assert_eq!(completed, vec![ids[0].clone()]);

        let statuses: Vec<UploadStatus> = uploader
            .upload_queue()
            .iter()
            .map(|i| i.status)
            .collect();
        assert!(statuses.contains(&UploadStatus::Completed));
        assert!(statuses.contains(&UploadStatus::Cancelled));

        let db = uploader.db.lock().await;
        assert!(db.get_file_by_path(&FullPath::new(loc(), "d/drop.txt")).is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_flight_sticks_even_if_backend_finishes() {
        let uploader = new_uploader_with(StubBackend::new());
        let dest = FullPath::new(loc(), "d/");
        let ids = uploader.enqueue(sources(&["slow.txt"]), &dest);
        let mut run = uploader.run("u1", 1);

        // Wait for the worker to pick the item up, then cancel while the
        // backend (which never polls the flag) is still transferring.
        for _ in 0..100 {
            if uploader.upload_queue()[0].status == UploadStatus::Uploading {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        uploader.cancel(&ids[0]);

        assert!(run.completions.next().await.is_none());
        assert_eq!(uploader.upload_queue()[0].status, UploadStatus::Cancelled);
        let db = uploader.db.lock().await;
        assert!(db.get_file_by_path(&FullPath::new(loc(), "d/slow.txt")).is_none());
    }

    #[tokio::test]
    async fn test_relative_path_hint_wins_over_name() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        let mut source = UploadSource::new("photo.jpg", vec![9u8; 8]);
        source.relative_path = Some("album/photo.jpg".into());
        uploader.enqueue(vec![source], &FullPath::new(loc(), "media/"));

        let mut run = uploader.run("u1", 1);
        while run.completions.next().await.is_some() {}

        let db = uploader.db.lock().await;
        assert!(db
            .get_file_by_path(&FullPath::new(loc(), "media/album/photo.jpg"))
            .is_some());
    }

    #[tokio::test]
    async fn test_clear_queue_drops_terminal_entries() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        uploader.enqueue(sources(&["a.txt"]), &FullPath::new(loc(), "d/"));
        let mut run = uploader.run("u1", 1);
        while run.completions.next().await.is_some() {}

        assert_eq!(uploader.upload_queue().len(), 1);
        uploader.clear_queue();
        assert!(uploader.upload_queue().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = StubBackend::new();
        let peak = backend.peak.clone();
        let uploader = new_uploader_with(backend);

        uploader.enqueue(
            sources(&["1", "2", "3", "4", "5", "6"]),
            &FullPath::new(loc(), "d/"),
        );
        let mut run = uploader.run("u1", 2);
        while run.completions.next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_batch() {
        let uploader = new_uploader_with(StubBackend::new());

        let dest = FullPath::new(loc(), "d/");
        let ids = uploader.enqueue(sources(&["bad.txt", "good.txt"]), &dest);
        let mut run = uploader.run("u1", 1);

        let mut completed = Vec::new();
        while let Some(id) = run.completions.next().await {
            completed.push(id);
        }
        assert_eq!(completed, vec![ids[1].clone()]);

        let queue = uploader.upload_queue();
        let by_id = |id: &FileId| queue.iter().find(|i| &i.id == id).unwrap().status;
        assert_eq!(by_id(&ids[0]), UploadStatus::Failed);
        assert_eq!(by_id(&ids[1]), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_zero_concurrency_selects_configured_default() {
        let backend = StubBackend::new();
        let peak = backend.peak.clone();
        let config = Config {
            data_path: "./unused".into(),
            upload_concurrency: 3,
        };
        let db = Arc::new(tokio::sync::Mutex::new(DriveDb::new()));
        let uploader = Uploader::with_config(db, backend, &config);

        uploader.enqueue(sources(&["a", "b", "c", "d"]), &FullPath::new(loc(), "d/"));
        let mut run = uploader.run("u1", 0);

        let mut completed = 0;
        while run.completions.next().await.is_some() {
            completed += 1;
        }
        assert_eq!(completed, 4);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_queue_run_ends_immediately() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn StorageBackend> = Arc::new(ChunkStore::new(temp.path()).unwrap());
        let uploader = new_uploader_with(store);

        let mut run = uploader.run("u1", 3);
        assert!(run.completions.next().await.is_none());
    }
}
