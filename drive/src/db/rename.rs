//! Renames and subtree path rewriting.
//!
//! Renames address records by id. Renaming a folder invalidates the stored
//! path of everything beneath it, so the rewrite walks the subtree with an
//! explicit worklist and rekeys the path maps as it goes. Tombstoned
//! records stay renameable: they have no path keys to move, only their
//! stored fields change.

use super::DriveDb;
use crate::error::DriveError;
use crate::search::RecordKind;
use crate::types::{now_ms, FileId, FileRecord, FolderId, FolderRecord, FullPath};

/// A display name, sanitized. Rejects empties and path separators.
fn clean_name(name: &str) -> Result<String, DriveError> {
    if name.contains('/') {
        return Err(DriveError::InvalidName);
    }
    let cleaned = crate::path::sanitize(name);
    if cleaned.is_empty() {
        return Err(DriveError::InvalidName);
    }
    Ok(cleaned)
}

/// The prefix up to and including the last `/` of a path with its trailing
/// slash already stripped; empty for a top-level item.
fn parent_prefix(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(i) => &trimmed[..=i],
        None => "",
    }
}

impl DriveDb {
    /// Rename the file with the given id in place. Version history is
    /// untouched; only this record (and, for the live head, its path key)
    /// moves.
    pub fn rename_file(&mut self, id: &FileId, new_name: &str) -> Result<FileRecord, DriveError> {
        let name = clean_name(new_name)?;
        let old = self
            .files
            .get(id)
            .map(|r| r.full_path.clone())
            .ok_or(DriveError::FileNotFound)?;

        let new_path = FullPath::new(
            old.location.clone(),
            format!("{}{}", parent_prefix(&old.path), name),
        );
        if new_path != old {
            if self
                .file_path_to_id
                .get(&new_path)
                .is_some_and(|other| other != id)
            {
                return Err(DriveError::NameConflict);
            }
            let as_folder =
                FullPath::new(new_path.location.clone(), format!("{}/", new_path.path));
            if self.folder_path_to_id.contains_key(&as_folder) {
                return Err(DriveError::NameConflict);
            }

            // Only the live head holds a path key; stale versions and
            // tombstones just get their stored fields updated.
            let was_head = self.file_path_to_id.get(&old) == Some(id);
            if was_head {
                self.file_path_to_id.remove(&old);
                self.file_path_to_id.insert(new_path.clone(), id.clone());
            }
            if let Some(rec) = self.files.get_mut(id) {
                rec.extension = crate::path::extension(&name).to_string();
                rec.name = name.clone();
                rec.full_path = new_path;
                rec.last_changed_ms = now_ms();
            }
            if was_head {
                self.search.add(RecordKind::File, id.as_str(), &name);
            }
            self.queue_flush();
        }
        self.files.get(id).cloned().ok_or(DriveError::FileNotFound)
    }

    /// Rename the folder with the given id and rewrite the stored paths of
    /// its entire subtree. The location root cannot be renamed.
    pub fn rename_folder(
        &mut self,
        id: &FolderId,
        new_name: &str,
    ) -> Result<FolderRecord, DriveError> {
        let name = clean_name(new_name)?;
        let (old_base, location, deleted) = match self.folders.get(id) {
            Some(f) if !f.full_path.is_root() => (
                f.full_path.path.clone(),
                f.full_path.location.clone(),
                f.deleted,
            ),
            Some(_) => return Err(DriveError::InvalidName),
            None => return Err(DriveError::FolderNotFound),
        };

        let new_base = format!("{}{}/", parent_prefix(&old_base), name);
        if new_base != old_base {
            if self
                .folder_path_to_id
                .get(&FullPath::new(location.clone(), new_base.clone()))
                .is_some_and(|other| other != id)
            {
                return Err(DriveError::NameConflict);
            }
            let as_file = FullPath::new(
                location,
                new_base.strip_suffix('/').unwrap_or(&new_base).to_string(),
            );
            if self.file_path_to_id.contains_key(&as_file) {
                return Err(DriveError::NameConflict);
            }

            if let Some(rec) = self.folders.get_mut(id) {
                rec.name = name.clone();
                rec.last_changed_ms = now_ms();
            }
            self.rewrite_subtree(id, &old_base, &new_base);
            if !deleted {
                self.search.add(RecordKind::Folder, id.as_str(), &name);
            }
            self.queue_flush();
        }
        self.folders.get(id).cloned().ok_or(DriveError::FolderNotFound)
    }

    /// Rewrite every stored path under `root` from `old_base…` to
    /// `new_base…`, rekeying the path maps for live records. `root`'s own
    /// path is rewritten too (its stored path must still start with
    /// `old_base` when this is called). Reachability bounds the rewrite:
    /// subfolder lists include tombstoned folders, but file rewrites only
    /// reach live heads — tombstoned files and superseded chain versions
    /// keep their old stored paths.
    pub(crate) fn rewrite_subtree(&mut self, root: &FolderId, old_base: &str, new_base: &str) {
        let mut work = vec![root.clone()];
        while let Some(folder_id) = work.pop() {
            let Some(folder) = self.folders.get(&folder_id) else {
                continue;
            };
            let old_path = folder.full_path.clone();
            let deleted = folder.deleted;
            let file_ids = folder.file_ids.clone();
            work.extend(folder.subfolders.iter().cloned());

            if let Some(rest) = old_path.path.strip_prefix(old_base) {
                let new_path =
                    FullPath::new(old_path.location.clone(), format!("{new_base}{rest}"));
                if !deleted {
                    self.folder_path_to_id.remove(&old_path);
                    self.folder_path_to_id
                        .insert(new_path.clone(), folder_id.clone());
                }
                if let Some(rec) = self.folders.get_mut(&folder_id) {
                    rec.full_path = new_path;
                }
            }

            for file_id in file_ids {
                let Some(file) = self.files.get(&file_id) else {
                    continue;
                };
                let old_file_path = file.full_path.clone();
                if let Some(rest) = old_file_path.path.strip_prefix(old_base) {
                    let new_path =
                        FullPath::new(old_file_path.location.clone(), format!("{new_base}{rest}"));
                    if self.file_path_to_id.get(&old_file_path) == Some(&file_id) {
                        self.file_path_to_id.remove(&old_file_path);
                        self.file_path_to_id.insert(new_path.clone(), file_id.clone());
                    }
                    if let Some(rec) = self.files.get_mut(&file_id) {
                        rec.full_path = new_path;
                    }
                }
            }
        }
    }
}
