//! Tombstoned deletes.
//!
//! Nothing is ever dropped from the id→record maps: deletes flip the
//! tombstone flag, remove the path keys, and detach the record from every
//! live listing, so a later sync can still observe the delete. When a
//! folder and a file both answer to the same address, the folder wins.

use super::DriveDb;
use crate::search::RecordKind;
use crate::types::{now_ms, FileId, FolderId, FullPath};
use std::collections::HashSet;

impl DriveDb {
    /// Tombstone each addressed item. Roots are refused, unknown paths are
    /// skipped, and both are logged rather than raised: a batch delete
    /// never fails halfway.
    pub fn delete_by_paths(&mut self, paths: &[FullPath]) {
        for raw in paths {
            let path = FullPath::new(raw.location.clone(), crate::path::sanitize(&raw.path));
            if path.is_root() {
                tracing::warn!(location = %path.location, "refusing to delete a storage root");
                continue;
            }
            if let Some(folder_id) = self.resolve_folder_path(&path) {
                self.delete_folder_cascade(folder_id);
            } else if let Some(file_id) = self.file_path_to_id.get(&path).cloned() {
                self.delete_file_chain(file_id);
            } else {
                tracing::warn!(%path, "delete target not found");
            }
        }
        self.queue_flush();
    }

    /// Tombstone a folder and everything beneath it, depth-first. The
    /// tombstoned folder stays listed under its parent's subfolders; its
    /// own live-file set empties out.
    pub(crate) fn delete_folder_cascade(&mut self, root: FolderId) {
        let mut stack = vec![root];
        while let Some(folder_id) = stack.pop() {
            let Some(folder) = self.folders.get(&folder_id) else {
                continue;
            };
            if folder.deleted {
                continue;
            }
            let full_path = folder.full_path.clone();
            let file_ids = folder.file_ids.clone();
            stack.extend(folder.subfolders.iter().cloned());

            for file_id in file_ids {
                self.delete_file_chain(file_id);
            }

            self.folder_path_to_id.remove(&full_path);
            self.search.remove(RecordKind::Folder, folder_id.as_str());
            if let Some(folder) = self.folders.get_mut(&folder_id) {
                folder.deleted = true;
                folder.file_ids.clear();
                folder.last_changed_ms = now_ms();
            }
        }
    }

    /// Tombstone every version reachable from `start`, walking the chain
    /// both directions. The path key (held by the head) and the folder's
    /// live set are cleared; every record stays resident.
    pub(crate) fn delete_file_chain(&mut self, start: FileId) {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();

        let mut cursor = Some(start.clone());
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = self.files.get(&id).and_then(|f| f.next_version.clone());
            chain.push(id);
        }
        cursor = self.files.get(&start).and_then(|f| f.prior_version.clone());
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = self.files.get(&id).and_then(|f| f.prior_version.clone());
            chain.push(id);
        }

        for id in chain {
            let Some(file) = self.files.get(&id) else {
                continue;
            };
            let full_path = file.full_path.clone();
            let folder_id = file.folder.clone();

            if self.file_path_to_id.get(&full_path) == Some(&id) {
                self.file_path_to_id.remove(&full_path);
            }
            if let Some(folder) = self.folders.get_mut(&folder_id) {
                folder.file_ids.retain(|f| f != &id);
            }
            self.search.remove(RecordKind::File, id.as_str());
            if let Some(file) = self.files.get_mut(&id) {
                file.deleted = true;
                file.last_changed_ms = now_ms();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageLocation;

    fn loc() -> StorageLocation {
        StorageLocation::BrowserCache
    }

    #[test]
    fn test_delete_file_tombstones_whole_chain() {
        let mut db = DriveDb::new();
        let v1 = db.upsert_file("notes.txt", loc(), "u1", None);
        let v2 = db.upsert_file("notes.txt", loc(), "u1", None);

        db.delete_by_paths(&[FullPath::new(loc(), "notes.txt")]);

        for id in [&v1, &v2] {
            let rec = db.get_file_by_id(id).expect("tombstone stays resident");
            assert!(rec.deleted);
        }
        assert!(db.get_file_by_path(&FullPath::new(loc(), "notes.txt")).is_none());
        let root = db.get_folder_by_path(&FullPath::root(loc())).unwrap();
        assert!(root.file_ids.is_empty());
    }

    #[test]
    fn test_delete_folder_cascades() {
        let mut db = DriveDb::new();
        let file_id = db.upsert_file("a/b/deep.txt", loc(), "u1", None);
        let top_id = db.resolve_folder_path(&FullPath::new(loc(), "a/")).unwrap();
        let mid_id = db.resolve_folder_path(&FullPath::new(loc(), "a/b/")).unwrap();

        db.delete_by_paths(&[FullPath::new(loc(), "a/")]);

        assert!(db.get_folder_by_id(&top_id).unwrap().deleted);
        assert!(db.get_folder_by_id(&mid_id).unwrap().deleted);
        assert!(db.get_file_by_id(&file_id).unwrap().deleted);
        assert!(db.get_folder_by_path(&FullPath::new(loc(), "a/")).is_none());
        assert!(db.get_folder_by_path(&FullPath::new(loc(), "a/b/")).is_none());

        // Tombstoned child stays listed under its parent for sync
        let root = db.get_folder_by_path(&FullPath::root(loc())).unwrap();
        assert!(root.subfolders.contains(&top_id));
    }

    #[test]
    fn test_folder_wins_over_file_at_same_address() {
        let mut db = DriveDb::new();
        // The implicit walker lets a file "shared" and a folder "shared/"
        // coexist; a slashless delete must resolve to the folder.
        let file_id = db.upsert_file("shared", loc(), "u1", None);
        db.upsert_file("shared/inner.txt", loc(), "u1", None);
        let folder_id = db
            .resolve_folder_path(&FullPath::new(loc(), "shared/"))
            .unwrap();

        db.delete_by_paths(&[FullPath::new(loc(), "shared")]);
        assert!(db.get_folder_by_id(&folder_id).unwrap().deleted);
        assert!(!db.get_file_by_id(&file_id).unwrap().deleted);
    }

    #[test]
    fn test_root_and_unknown_paths_are_skipped() {
        let mut db = DriveDb::new();
        let id = db.upsert_file("keep.txt", loc(), "u1", None);

        db.delete_by_paths(&[
            FullPath::root(loc()),
            FullPath::new(loc(), "never/existed.txt"),
        ]);

        assert!(!db.get_file_by_id(&id).unwrap().deleted);
        assert!(!db
            .get_folder_by_path(&FullPath::root(loc()))
            .unwrap()
            .deleted);
    }

    #[test]
    fn test_deleted_items_vanish_from_listings_and_search() {
        let mut db = DriveDb::new();
        db.upsert_file("docs/gone.txt", loc(), "u1", None);
        db.upsert_file("docs/kept.txt", loc(), "u1", None);
        db.delete_by_paths(&[FullPath::new(loc(), "docs/gone.txt")]);

        let page = db.fetch_files_at_folder_path(&FullPath::new(loc(), "docs/"), 10, 0);
        assert_eq!(page.files.len(), 1);
        assert_eq!(page.files[0].name, "kept.txt");
        assert!(db.search_files_query("gone", 10, 0).files.is_empty());
    }
}
