//! Reconciliation with a remote peer.
//!
//! Three mechanisms: snapshot export (a named, timestamped clone of the
//! four hashtables), surgical id re-keying for records whose provisional
//! local id gets replaced by a server-assigned one, and merge-upserts that
//! overlay partial cloud records onto local state without disturbing
//! fields the patch does not mention.

use super::DriveDb;
use crate::error::DriveError;
use crate::search::RecordKind;
use crate::types::{
    now_ms, FileId, FileRecord, FolderId, FolderRecord, FullPath, StorageLocation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A self-describing export of the whole metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub snapshot_name: String,
    #[serde(rename = "fullFolderPathToUUID")]
    pub folder_path_to_id: HashMap<FullPath, FolderId>,
    #[serde(rename = "fullFilePathToUUID")]
    pub file_path_to_id: HashMap<FullPath, FileId>,
    #[serde(rename = "folderUUIDToMetadata")]
    pub folders: HashMap<FolderId, FolderRecord>,
    #[serde(rename = "fileUUIDToMetadata")]
    pub files: HashMap<FileId, FileRecord>,
}

/// Partial file record from a peer. Absent fields leave local state alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilePatch {
    pub name: Option<String>,
    pub folder: Option<FolderId>,
    pub version: Option<u32>,
    pub prior_version: Option<FileId>,
    pub next_version: Option<FileId>,
    pub extension: Option<String>,
    pub full_path: Option<FullPath>,
    pub tags: Option<Vec<String>>,
    pub owner: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub location: Option<StorageLocation>,
    pub size: Option<u64>,
    pub raw_location: Option<String>,
    pub last_changed_ms: Option<i64>,
    pub deleted: Option<bool>,
}

/// Partial folder record from a peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderPatch {
    pub name: Option<String>,
    pub full_path: Option<FullPath>,
    pub tags: Option<Vec<String>>,
    pub owner: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub location: Option<StorageLocation>,
    pub last_changed_ms: Option<i64>,
    pub deleted: Option<bool>,
}

impl DriveDb {
    /// Clone the four hashtables into a named snapshot for backup or
    /// hand-off to a peer.
    pub fn export_snapshot(&self, owner: &str) -> Snapshot {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        Snapshot {
            snapshot_name: format!(
                "snapshot_drivedb.id_{id}.userID_{owner}.timestamp_{}.json",
                created_at.timestamp()
            ),
            id,
            created_at,
            folder_path_to_id: self.folder_path_to_id.clone(),
            file_path_to_id: self.file_path_to_id.clone(),
            folders: self.folders.clone(),
            files: self.files.clone(),
        }
    }

    /// Re-key a file record from `old` to `new`, fixing every structure
    /// that referenced the old id: the path index, the owning folder's
    /// live set, both chain neighbors and the search index.
    pub fn surgically_sync_file_id(&mut self, old: &FileId, new: &FileId) -> Result<(), DriveError> {
        if old == new {
            return Ok(());
        }
        if new.as_str().is_empty() {
            return Err(DriveError::InvalidName);
        }
        let mut rec = self.files.remove(old).ok_or(DriveError::FileNotFound)?;
        rec.id = new.clone();

        if self.file_path_to_id.get(&rec.full_path) == Some(old) {
            self.file_path_to_id.insert(rec.full_path.clone(), new.clone());
        }
        if let Some(folder) = self.folders.get_mut(&rec.folder) {
            folder.file_ids.retain(|f| f != new);
            for slot in folder.file_ids.iter_mut() {
                if slot == old {
                    *slot = new.clone();
                }
            }
        }
        if let Some(prior) = rec.prior_version.clone() {
            if let Some(p) = self.files.get_mut(&prior) {
                p.next_version = Some(new.clone());
            }
        }
        if let Some(next) = rec.next_version.clone() {
            if let Some(n) = self.files.get_mut(&next) {
                n.prior_version = Some(new.clone());
            }
        }
        self.search.remove(RecordKind::File, old.as_str());
        if !rec.deleted {
            self.search.add(RecordKind::File, new.as_str(), &rec.name);
        }
        self.files.insert(new.clone(), rec);
        tracing::debug!(%old, %new, "re-keyed file id");
        self.queue_flush();
        Ok(())
    }

    /// Re-key a folder record from `old` to `new`: path index, the parent's
    /// subfolder list, every child's parent pointer, every owned file's
    /// folder pointer and the search index.
    pub fn surgically_sync_folder_id(
        &mut self,
        old: &FolderId,
        new: &FolderId,
    ) -> Result<(), DriveError> {
        if old == new {
            return Ok(());
        }
        if new.as_str().is_empty() {
            return Err(DriveError::InvalidName);
        }
        let mut rec = self.folders.remove(old).ok_or(DriveError::FolderNotFound)?;
        rec.id = new.clone();

        if self.folder_path_to_id.get(&rec.full_path) == Some(old) {
            self.folder_path_to_id
                .insert(rec.full_path.clone(), new.clone());
        }
        if let Some(parent_id) = rec.parent_folder.clone() {
            if let Some(parent) = self.folders.get_mut(&parent_id) {
                parent.subfolders.retain(|f| f != new);
                for slot in parent.subfolders.iter_mut() {
                    if slot == old {
                        *slot = new.clone();
                    }
                }
            }
        }
        for child_id in rec.subfolders.clone() {
            if let Some(child) = self.folders.get_mut(&child_id) {
                if child.parent_folder.as_ref() == Some(old) {
                    child.parent_folder = Some(new.clone());
                }
            }
        }
        for file_id in rec.file_ids.clone() {
            if let Some(file) = self.files.get_mut(&file_id) {
                if &file.folder == old {
                    file.folder = new.clone();
                }
            }
        }
        self.search.remove(RecordKind::Folder, old.as_str());
        if !rec.deleted {
            self.search.add(RecordKind::Folder, new.as_str(), &rec.name);
        }
        self.folders.insert(new.clone(), rec);
        tracing::debug!(%old, %new, "re-keyed folder id");
        self.queue_flush();
        Ok(())
    }

    /// Merge a cloud file record into local state under the peer's id.
    /// Unknown ids are created (the patch must then carry a full path);
    /// known ids are overlaid field by field.
    pub fn upsert_local_file_with_cloud_sync(
        &mut self,
        id: &FileId,
        patch: FilePatch,
    ) -> Result<FileId, DriveError> {
        if !self.files.contains_key(id) {
            let full = patch.full_path.clone().ok_or(DriveError::FileNotFound)?;
            let owner = patch.owner.clone().unwrap_or_default();
            let generated = self.upsert_file(&full.path, full.location.clone(), &owner, None);
            self.surgically_sync_file_id(&generated, id)?;
        }

        let (old_path, old_folder) = {
            let rec = self.files.get(id).ok_or(DriveError::FileNotFound)?;
            (rec.full_path.clone(), rec.folder.clone())
        };

        // A path change moves the record between folders and rekeys the
        // path index before the scalar overlay lands.
        if let Some(new_full) = patch.full_path.clone() {
            if new_full != old_path {
                let sanitized = crate::path::sanitize(&new_full.path);
                let new_full = FullPath::new(new_full.location.clone(), sanitized.clone());
                let parent = match sanitized.rfind('/') {
                    Some(i) => sanitized[..i].to_string(),
                    None => String::new(),
                };
                let owner = patch.owner.clone().unwrap_or_default();
                let folder_id =
                    self.ensure_folder_path(&parent, &new_full.location, &owner);

                if self.file_path_to_id.get(&old_path) == Some(id) {
                    self.file_path_to_id.remove(&old_path);
                }
                self.file_path_to_id.insert(new_full.clone(), id.clone());
                if let Some(folder) = self.folders.get_mut(&old_folder) {
                    folder.file_ids.retain(|f| f != id);
                }
                if let Some(folder) = self.folders.get_mut(&folder_id) {
                    if !folder.file_ids.contains(id) {
                        folder.file_ids.push(id.clone());
                    }
                }
                if let Some(rec) = self.files.get_mut(id) {
                    rec.name = crate::path::file_name(&sanitized).to_string();
                    rec.extension = crate::path::extension(&rec.name).to_string();
                    rec.full_path = new_full;
                    rec.folder = folder_id;
                }
            }
        }

        if let Some(prior) = patch.prior_version.clone() {
            if let Some(p) = self.files.get_mut(&prior) {
                p.next_version = Some(id.clone());
            }
        }
        if let Some(next) = patch.next_version.clone() {
            if let Some(n) = self.files.get_mut(&next) {
                n.prior_version = Some(id.clone());
            }
        }

        let (name, tombstoned) = {
            let rec = self.files.get_mut(id).ok_or(DriveError::FileNotFound)?;
            if let Some(v) = patch.name {
                rec.extension = crate::path::extension(&v).to_string();
                rec.name = v;
            }
            if let Some(v) = patch.folder {
                rec.folder = v;
            }
            if let Some(v) = patch.version {
                rec.version = v;
            }
            if let Some(v) = patch.prior_version {
                rec.prior_version = Some(v);
            }
            if let Some(v) = patch.next_version {
                rec.next_version = Some(v);
            }
            if let Some(v) = patch.extension {
                rec.extension = v;
            }
            if let Some(v) = patch.tags {
                rec.tags = v;
            }
            if let Some(v) = patch.owner {
                rec.owner = v;
            }
            if let Some(v) = patch.created_at {
                rec.created_at = v;
            }
            if let Some(v) = patch.location {
                rec.location = v;
            }
            if let Some(v) = patch.size {
                rec.size = v;
            }
            if let Some(v) = patch.raw_location {
                rec.raw_location = v;
            }
            rec.last_changed_ms = patch.last_changed_ms.unwrap_or_else(now_ms);
            (rec.name.clone(), patch.deleted == Some(true))
        };

        if tombstoned {
            self.delete_file_chain(id.clone());
        } else {
            self.search.add(RecordKind::File, id.as_str(), &name);
        }
        self.queue_flush();
        Ok(id.clone())
    }

    /// Merge a cloud folder record into local state under the peer's id.
    /// A path change drags the whole subtree along.
    pub fn upsert_local_folder_with_cloud_sync(
        &mut self,
        id: &FolderId,
        patch: FolderPatch,
    ) -> Result<FolderId, DriveError> {
        if !self.folders.contains_key(id) {
            let full = patch.full_path.clone().ok_or(DriveError::FolderNotFound)?;
            let owner = patch.owner.clone().unwrap_or_default();
            let generated = self.ensure_folder_path(&full.path, &full.location, &owner);
            self.surgically_sync_folder_id(&generated, id)?;
        }

        if let Some(new_full) = patch.full_path.clone() {
            let old_base = self
                .folders
                .get(id)
                .ok_or(DriveError::FolderNotFound)?
                .full_path
                .path
                .clone();
            let mut new_base = crate::path::sanitize(&new_full.path);
            if !new_base.is_empty() {
                new_base.push('/');
            }
            if new_base != old_base {
                self.rewrite_subtree(id, &old_base, &new_base);
                self.reparent_after_move(id, &new_base, patch.owner.as_deref().unwrap_or(""));
            }
        }

        let (name, tombstoned) = {
            let rec = self.folders.get_mut(id).ok_or(DriveError::FolderNotFound)?;
            if let Some(v) = patch.name {
                rec.name = v;
            }
            if let Some(v) = patch.tags {
                rec.tags = v;
            }
            if let Some(v) = patch.owner {
                rec.owner = v;
            }
            if let Some(v) = patch.created_at {
                rec.created_at = v;
            }
            if let Some(v) = patch.location {
                rec.location = v;
            }
            rec.last_changed_ms = patch.last_changed_ms.unwrap_or_else(now_ms);
            (rec.name.clone(), patch.deleted == Some(true))
        };

        if tombstoned {
            self.delete_folder_cascade(id.clone());
        } else {
            self.search.add(RecordKind::Folder, id.as_str(), &name);
        }
        self.queue_flush();
        Ok(id.clone())
    }

    /// After a subtree path rewrite, hook the folder under the parent its
    /// new path implies and unhook it from the old one.
    fn reparent_after_move(&mut self, id: &FolderId, new_base: &str, owner: &str) {
        let Some(rec) = self.folders.get(id) else {
            return;
        };
        let location = rec.location.clone();
        let old_parent = rec.parent_folder.clone();

        let trimmed = new_base.strip_suffix('/').unwrap_or(new_base);
        let parent_path = match trimmed.rfind('/') {
            Some(i) => trimmed[..=i].to_string(),
            None => String::new(),
        };
        let new_parent = self.ensure_folder_path(&parent_path, &location, owner);
        if old_parent.as_ref() == Some(&new_parent) {
            return;
        }

        if let Some(old_parent) = old_parent {
            if let Some(p) = self.folders.get_mut(&old_parent) {
                p.subfolders.retain(|f| f != id);
            }
        }
        if let Some(p) = self.folders.get_mut(&new_parent) {
            if !p.subfolders.contains(id) {
                p.subfolders.push(id.clone());
            }
        }
        if let Some(rec) = self.folders.get_mut(id) {
            rec.parent_folder = Some(new_parent);
        }
    }
}
