//! Folder creation and the path walker.
//!
//! Folder paths are built segment by segment, each segment carrying its
//! trailing `/`, with the bare location root at the empty path. Missing
//! ancestors materialize implicitly; only `create_folder` is strict about
//! the terminal segment already existing.

use super::DriveDb;
use crate::error::DriveError;
use crate::search::RecordKind;
use crate::types::{now_ms, FolderId, FolderRecord, FullPath, StorageLocation};
use chrono::Utc;

impl DriveDb {
    /// Id of the location root, creating the record on first touch. The
    /// root has the empty name and no parent.
    pub(crate) fn ensure_root(&mut self, location: &StorageLocation, owner: &str) -> FolderId {
        let root = FullPath::root(location.clone());
        if let Some(id) = self.folder_path_to_id.get(&root) {
            return id.clone();
        }
        let id = FolderId::generate();
        let record = FolderRecord {
            id: id.clone(),
            name: String::new(),
            parent_folder: None,
            subfolders: Vec::new(),
            file_ids: Vec::new(),
            full_path: root.clone(),
            tags: Vec::new(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            location: location.clone(),
            last_changed_ms: now_ms(),
            deleted: false,
        };
        self.folder_path_to_id.insert(root, id.clone());
        self.folders.insert(id.clone(), record);
        id
    }

    /// Walk every segment of `path` (sanitized here), creating any folder
    /// that does not exist yet and linking it under its parent. Returns the
    /// id of the terminal folder (the root id for an empty path).
    pub fn ensure_folder_path(
        &mut self,
        path: &str,
        location: &StorageLocation,
        owner: &str,
    ) -> FolderId {
        let sanitized = crate::path::sanitize(path);
        let mut parent_id = self.ensure_root(location, owner);
        let mut prefix = String::new();
        for segment in sanitized.split('/').filter(|s| !s.is_empty()) {
            prefix.push_str(segment);
            prefix.push('/');
            let full = FullPath::new(location.clone(), prefix.clone());
            if let Some(id) = self.folder_path_to_id.get(&full) {
                parent_id = id.clone();
                continue;
            }
            let id = FolderId::generate();
            let record = FolderRecord {
                id: id.clone(),
                name: segment.to_string(),
                parent_folder: Some(parent_id.clone()),
                subfolders: Vec::new(),
                file_ids: Vec::new(),
                full_path: full.clone(),
                tags: Vec::new(),
                owner: owner.to_string(),
                created_at: Utc::now(),
                location: location.clone(),
                last_changed_ms: now_ms(),
                deleted: false,
            };
            self.folder_path_to_id.insert(full, id.clone());
            self.folders.insert(id.clone(), record);
            if let Some(parent) = self.folders.get_mut(&parent_id) {
                parent.subfolders.push(id.clone());
            }
            self.search.add(RecordKind::Folder, id.as_str(), segment);
            tracing::debug!(%id, path = %prefix, "created folder");
            parent_id = id;
        }
        self.queue_flush();
        parent_id
    }

    /// Explicit folder creation. Unlike the implicit walker this rejects a
    /// terminal segment that already exists, or that collides with a file
    /// at the same path.
    pub fn create_folder(
        &mut self,
        path: &FullPath,
        owner: &str,
    ) -> Result<FolderRecord, DriveError> {
        let sanitized = crate::path::sanitize(&path.path);
        if sanitized.is_empty() {
            let root_id = self.ensure_root(&path.location, owner);
            self.queue_flush();
            return self
                .folders
                .get(&root_id)
                .cloned()
                .ok_or(DriveError::FolderNotFound);
        }

        let terminal = FullPath::new(path.location.clone(), format!("{sanitized}/"));
        if self.folder_path_to_id.contains_key(&terminal) {
            return Err(DriveError::NameConflict);
        }
        let as_file = FullPath::new(path.location.clone(), sanitized.clone());
        if self.file_path_to_id.contains_key(&as_file) {
            return Err(DriveError::NameConflict);
        }

        let id = self.ensure_folder_path(&sanitized, &path.location, owner);
        self.folders
            .get(&id)
            .cloned()
            .ok_or(DriveError::FolderNotFound)
    }
}
