//! The drive metadata store.
//!
//! Four mutually-consistent hashtables own the hierarchy: folder-path→id,
//! file-path→id, and the two id→record maps. All mutation goes through
//! `DriveDb` methods (single-writer discipline; wrap in a mutex or confine
//! to one task for shared use), and every mutating operation queues a
//! fire-and-forget persistence flush through the attached backend.

mod delete;
mod files;
mod folders;
mod rename;
mod sync;

pub use sync::{FilePatch, FolderPatch, Snapshot};

use crate::search::{RecordKind, SearchIndex};
use crate::storage::{StorageBackend, TableKind};
use crate::types::{FileId, FileRecord, FolderId, FolderRecord, FullPath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A point-in-time clone of the four hashtables, the unit of persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSet {
    pub folder_path_to_id: HashMap<FullPath, FolderId>,
    pub file_path_to_id: HashMap<FullPath, FileId>,
    pub folders: HashMap<FolderId, FolderRecord>,
    pub files: HashMap<FileId, FileRecord>,
}

/// Counts reported by a full search reindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexCounts {
    pub files: usize,
    pub folders: usize,
}

/// One page of a folder listing. Folders always precede files within the
/// requested window; `total` is the size of this window.
#[derive(Debug, Clone, Default)]
pub struct FolderListing {
    pub folders: Vec<FolderRecord>,
    pub files: Vec<FileRecord>,
    pub total: usize,
    pub has_more: bool,
}

/// One page of fuzzy-search results, tombstones already filtered out.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub folders: Vec<FolderRecord>,
    pub files: Vec<FileRecord>,
    pub total: usize,
    pub has_more: bool,
}

pub struct DriveDb {
    pub(crate) folder_path_to_id: HashMap<FullPath, FolderId>,
    pub(crate) file_path_to_id: HashMap<FullPath, FileId>,
    pub(crate) folders: HashMap<FolderId, FolderRecord>,
    pub(crate) files: HashMap<FileId, FileRecord>,
    pub(crate) search: SearchIndex,
    flush_tx: Option<mpsc::UnboundedSender<TableSet>>,
}

impl Default for DriveDb {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveDb {
    pub fn new() -> Self {
        DriveDb {
            folder_path_to_id: HashMap::new(),
            file_path_to_id: HashMap::new(),
            folders: HashMap::new(),
            files: HashMap::new(),
            search: SearchIndex::new(),
            flush_tx: None,
        }
    }

    /// Restore the four hashtables from the backend and rebuild the search
    /// index. Missing tables start empty.
    pub async fn load(backend: &dyn StorageBackend) -> anyhow::Result<Self> {
        let mut db = DriveDb::new();
        if let Some(v) = backend.load_table(TableKind::FolderPathToId).await? {
            db.folder_path_to_id = serde_json::from_value(v)?;
        }
        if let Some(v) = backend.load_table(TableKind::FilePathToId).await? {
            db.file_path_to_id = serde_json::from_value(v)?;
        }
        if let Some(v) = backend.load_table(TableKind::FolderRecords).await? {
            db.folders = serde_json::from_value(v)?;
        }
        if let Some(v) = backend.load_table(TableKind::FileRecords).await? {
            db.files = serde_json::from_value(v)?;
        }
        let counts = db.reindex_fuzzy_search();
        tracing::info!(
            files = counts.files,
            folders = counts.folders,
            "restored drive tables"
        );
        Ok(db)
    }

    /// Spawn the persistence flusher and route future mutations through it.
    /// Flushes are fire-and-forget: failures are logged, never surfaced to
    /// the mutating caller. Consecutive pending snapshots coalesce to the
    /// newest one.
    pub fn attach_flusher(&mut self, backend: Arc<dyn StorageBackend>) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TableSet>();
        self.flush_tx = Some(tx);
        tokio::spawn(async move {
            while let Some(mut set) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    set = newer;
                }
                if let Err(e) = persist_tables(backend.as_ref(), &set).await {
                    tracing::error!(error = %e, "drive table flush failed");
                }
            }
        })
    }

    /// Clone the four hashtables for persistence or export.
    pub fn table_set(&self) -> TableSet {
        TableSet {
            folder_path_to_id: self.folder_path_to_id.clone(),
            file_path_to_id: self.file_path_to_id.clone(),
            folders: self.folders.clone(),
            files: self.files.clone(),
        }
    }

    pub(crate) fn queue_flush(&self) {
        if let Some(tx) = &self.flush_tx {
            let _ = tx.send(self.table_set());
        }
    }

    /// Rebuild the fuzzy index from the live contents of the path maps.
    pub fn reindex_fuzzy_search(&mut self) -> ReindexCounts {
        self.search.clear();
        let mut counts = ReindexCounts { files: 0, folders: 0 };
        for id in self.folder_path_to_id.values() {
            if let Some(folder) = self.folders.get(id) {
                // Location roots have the empty name and are never indexed
                // by the incremental path either.
                if folder.name.is_empty() {
                    continue;
                }
                self.search.add(RecordKind::Folder, id.as_str(), &folder.name);
                counts.folders += 1;
            }
        }
        for id in self.file_path_to_id.values() {
            if let Some(file) = self.files.get(id) {
                self.search.add(RecordKind::File, id.as_str(), &file.name);
                counts.files += 1;
            }
        }
        counts
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_folder_by_id(&self, id: &FolderId) -> Option<&FolderRecord> {
        self.folders.get(id)
    }

    pub fn get_file_by_id(&self, id: &FileId) -> Option<&FileRecord> {
        self.files.get(id)
    }

    /// Folder lookup by full path. Accepts the path with or without its
    /// trailing segment slash.
    pub fn get_folder_by_path(&self, path: &FullPath) -> Option<&FolderRecord> {
        self.resolve_folder_path(path)
            .and_then(|id| self.folders.get(&id))
    }

    pub fn get_file_by_path(&self, path: &FullPath) -> Option<&FileRecord> {
        self.file_path_to_id
            .get(path)
            .and_then(|id| self.files.get(id))
    }

    pub(crate) fn resolve_folder_path(&self, path: &FullPath) -> Option<FolderId> {
        if let Some(id) = self.folder_path_to_id.get(path) {
            return Some(id.clone());
        }
        if !path.is_root() && !path.path.ends_with('/') {
            let slashed = FullPath::new(path.location.clone(), format!("{}/", path.path));
            return self.folder_path_to_id.get(&slashed).cloned();
        }
        None
    }

    /// List one window of a folder's contents: subfolders first, then live
    /// file heads, with offset pagination over the combined sequence.
    pub fn fetch_files_at_folder_path(
        &self,
        path: &FullPath,
        limit: usize,
        after: usize,
    ) -> FolderListing {
        let Some(folder_id) = self.resolve_folder_path(path) else {
            return FolderListing::default();
        };
        let Some(folder) = self.folders.get(&folder_id) else {
            return FolderListing::default();
        };

        let subfolders: Vec<&FolderRecord> = folder
            .subfolders
            .iter()
            .filter_map(|id| self.folders.get(id))
            .filter(|f| !f.deleted)
            .collect();
        let files: Vec<&FileRecord> = folder
            .file_ids
            .iter()
            .filter_map(|id| self.files.get(id))
            .filter(|f| !f.deleted)
            .collect();

        let total_items = subfolders.len() + files.len();
        let mut start = after;
        let mut end = (start + limit).min(total_items);

        let mut matched_folders: Vec<FolderRecord> = Vec::new();
        if start < subfolders.len() {
            let folders_end = end.min(subfolders.len());
            matched_folders = subfolders[start..folders_end]
                .iter()
                .map(|f| (*f).clone())
                .collect();
            start = folders_end;
            end = (start + (limit - matched_folders.len())).min(total_items);
        }

        let mut matched_files: Vec<FileRecord> = Vec::new();
        if start >= subfolders.len() && matched_folders.len() < limit {
            let files_start = start.saturating_sub(subfolders.len());
            let files_end = files
                .len()
                .min(files_start + (limit - matched_folders.len()));
            if files_start < files_end {
                matched_files = files[files_start..files_end]
                    .iter()
                    .map(|f| (*f).clone())
                    .collect();
            }
        }

        FolderListing {
            total: matched_folders.len() + matched_files.len(),
            has_more: end < total_items,
            folders: matched_folders,
            files: matched_files,
        }
    }

    /// Fuzzy search over display names with offset pagination. Overfetches
    /// `limit + after + 1` ranked candidates so `has_more` can be reported
    /// without ranking the whole corpus, then drops tombstoned hits.
    pub fn search_files_query(&self, query: &str, limit: usize, after: usize) -> SearchResults {
        let ranked = self.search.search(query, limit + after + 1);
        let page_end = (after + limit).min(ranked.len());
        let page = if after < ranked.len() {
            &ranked[after..page_end]
        } else {
            &[]
        };

        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in page {
            match entry.kind {
                RecordKind::File => {
                    if let Some(f) = self.files.get(&FileId(entry.id.clone())) {
                        if !f.deleted {
                            files.push(f.clone());
                        }
                    }
                }
                RecordKind::Folder => {
                    if let Some(f) = self.folders.get(&FolderId(entry.id.clone())) {
                        if !f.deleted {
                            folders.push(f.clone());
                        }
                    }
                }
            }
        }

        SearchResults {
            total: folders.len() + files.len(),
            has_more: ranked.len() > after + limit,
            folders,
            files,
        }
    }
}

async fn persist_tables(backend: &dyn StorageBackend, set: &TableSet) -> anyhow::Result<()> {
    backend
        .persist_table(
            TableKind::FolderPathToId,
            serde_json::to_value(&set.folder_path_to_id)?,
        )
        .await?;
    backend
        .persist_table(
            TableKind::FilePathToId,
            serde_json::to_value(&set.file_path_to_id)?,
        )
        .await?;
    backend
        .persist_table(TableKind::FolderRecords, serde_json::to_value(&set.folders)?)
        .await?;
    backend
        .persist_table(TableKind::FileRecords, serde_json::to_value(&set.files)?)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkStore;
    use crate::types::StorageLocation;

    fn loc() -> StorageLocation {
        StorageLocation::BrowserCache
    }

    #[test]
    fn test_fetch_returns_folders_before_files() {
        let mut db = DriveDb::new();
        db.upsert_file("docs/readme.md", loc(), "u1", None);
        db.upsert_file("docs/notes.txt", loc(), "u1", None);
        db.create_folder(&FullPath::new(loc(), "docs/archive"), "u1")
            .unwrap();

        let page = db.fetch_files_at_folder_path(&FullPath::new(loc(), "docs/"), 10, 0);
        assert_eq!(page.folders.len(), 1);
        assert_eq!(page.files.len(), 2);
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }

    #[test]
    fn test_fetch_pagination_window() {
        let mut db = DriveDb::new();
        db.create_folder(&FullPath::new(loc(), "d/sub1"), "u1").unwrap();
        db.create_folder(&FullPath::new(loc(), "d/sub2"), "u1").unwrap();
        db.upsert_file("d/a.txt", loc(), "u1", None);
        db.upsert_file("d/b.txt", loc(), "u1", None);

        let path = FullPath::new(loc(), "d/");
        // Window of 3 over [sub1, sub2, a, b]
        let first = db.fetch_files_at_folder_path(&path, 3, 0);
        assert_eq!(first.folders.len(), 2);
        assert_eq!(first.files.len(), 1);
        assert_eq!(first.total, 3);
        assert!(first.has_more);

        let second = db.fetch_files_at_folder_path(&path, 3, 3);
        assert_eq!(second.folders.len(), 0);
        assert_eq!(second.files.len(), 1);
        assert!(!second.has_more);

        let past_end = db.fetch_files_at_folder_path(&path, 3, 10);
        assert_eq!(past_end.total, 0);
        assert!(!past_end.has_more);
    }

    #[test]
    fn test_fetch_unknown_path_is_empty() {
        let db = DriveDb::new();
        let page = db.fetch_files_at_folder_path(&FullPath::new(loc(), "nowhere/"), 5, 0);
        assert_eq!(page.total, 0);
        assert!(!page.has_more);
        assert!(page.folders.is_empty() && page.files.is_empty());
    }

    #[test]
    fn test_search_pagination_over_two_hits() {
        let mut db = DriveDb::new();
        db.upsert_file("Report.docx", loc(), "u1", None);
        db.create_folder(&FullPath::new(loc(), "Work Report"), "u1")
            .unwrap();

        let first = db.search_files_query("Report", 1, 0);
        assert_eq!(first.total, 1);
        assert!(first.has_more);

        let second = db.search_files_query("Report", 1, 1);
        assert_eq!(second.total, 1);
        assert!(!second.has_more);

        // The two pages cover one file and one folder between them
        let file_hits = first.files.len() + second.files.len();
        let folder_hits = first.folders.len() + second.folders.len();
        assert_eq!((file_hits, folder_hits), (1, 1));
    }

    #[test]
    fn test_search_filters_tombstones() {
        let mut db = DriveDb::new();
        db.upsert_file("Report.docx", loc(), "u1", None);
        db.delete_by_paths(&[FullPath::new(loc(), "Report.docx")]);

        let results = db.search_files_query("Report", 10, 0);
        assert_eq!(results.total, 0);
    }

    #[test]
    fn test_reindex_matches_incremental_indexing() {
        let mut db = DriveDb::new();
        db.upsert_file("docs/a.txt", loc(), "u1", None);

        let counts = db.reindex_fuzzy_search();
        // The file plus the "docs" folder; the empty-named root is skipped
        assert_eq!(counts, ReindexCounts { files: 1, folders: 1 });
        // The root must not surface as a match for arbitrary queries
        assert_eq!(db.search_files_query("zzz-unrelated", 10, 0).total, 0);
        assert_eq!(db.search_files_query("docs", 10, 0).folders.len(), 1);
    }

    #[tokio::test]
    async fn test_flusher_persists_mutations() {
        let temp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(ChunkStore::new(temp.path()).unwrap());

        let mut db = DriveDb::new();
        let handle = db.attach_flusher(store.clone());
        db.upsert_file("flushed.txt", loc(), "u1", None);
        drop(db); // closes the channel; the flusher drains and exits
        handle.await.unwrap();

        let restored = DriveDb::load(store.as_ref()).await.unwrap();
        assert!(restored
            .get_file_by_path(&FullPath::new(loc(), "flushed.txt"))
            .is_some());
    }

    #[tokio::test]
    async fn test_load_restores_tables_and_search() {
        let temp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(temp.path()).unwrap();

        let mut db = DriveDb::new();
        let file_id = db.upsert_file("docs/Report.docx", loc(), "u1", None);
        persist_tables(&store, &db.table_set()).await.unwrap();

        let restored = DriveDb::load(&store).await.unwrap();
        let file = restored.get_file_by_id(&file_id).expect("file survives restore");
        assert_eq!(file.name, "Report.docx");
        assert_eq!(
            restored
                .get_folder_by_path(&FullPath::new(loc(), "docs/"))
                .map(|f| f.name.as_str()),
            Some("docs")
        );
        // Search index rebuilt from restored tables
        assert_eq!(restored.search_files_query("Report", 5, 0).total, 1);
    }
}
