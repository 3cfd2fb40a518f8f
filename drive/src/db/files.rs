//! File upsert and version chaining.

use super::DriveDb;
use crate::search::RecordKind;
use crate::types::{now_ms, FileFragment, FileId, FileRecord, FullPath, StorageLocation};
use chrono::Utc;

impl DriveDb {
    /// Insert a file at `path`, or chain a new version onto whatever
    /// already lives there. The path is sanitized here; missing ancestor
    /// folders materialize implicitly.
    ///
    /// A backend fragment, when present, is authoritative for the new
    /// record's id, byte size and raw location. Re-upserting a fragment
    /// whose id is already the head at this path updates that record in
    /// place instead of minting a pointless self-version.
    pub fn upsert_file(
        &mut self,
        path: &str,
        location: StorageLocation,
        owner: &str,
        fragment: Option<&FileFragment>,
    ) -> FileId {
        let sanitized = crate::path::sanitize(path);
        let name = crate::path::file_name(&sanitized).to_string();
        let extension = crate::path::extension(&name).to_string();
        let full = FullPath::new(location.clone(), sanitized.clone());

        let prior_id = self.file_path_to_id.get(&full).cloned();
        let id = match fragment {
            Some(f) => f.id.clone(),
            None => FileId::generate(),
        };

        if prior_id.as_ref() == Some(&id) {
            if let Some(existing) = self.files.get_mut(&id) {
                if let Some(f) = fragment {
                    existing.size = f.size;
                    existing.raw_location = f.raw_location.clone();
                }
                existing.last_changed_ms = now_ms();
                self.queue_flush();
                return id;
            }
        }

        let version = prior_id
            .as_ref()
            .and_then(|p| self.files.get(p))
            .map(|p| p.version + 1)
            .unwrap_or(1);

        let parent = match sanitized.rfind('/') {
            Some(i) => &sanitized[..i],
            None => "",
        };
        let folder_id = self.ensure_folder_path(parent, &location, owner);

        let record = FileRecord {
            id: id.clone(),
            name: name.clone(),
            folder: folder_id.clone(),
            version,
            prior_version: prior_id.clone(),
            next_version: None,
            extension,
            full_path: full.clone(),
            tags: Vec::new(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            location,
            size: fragment.map(|f| f.size).unwrap_or(0),
            raw_location: fragment.map(|f| f.raw_location.clone()).unwrap_or_default(),
            last_changed_ms: now_ms(),
            deleted: false,
        };

        // The path key always points at the chain head.
        self.file_path_to_id.insert(full, id.clone());
        self.files.insert(id.clone(), record);

        if let Some(prior) = &prior_id {
            if let Some(prior_rec) = self.files.get_mut(prior) {
                prior_rec.next_version = Some(id.clone());
            }
            // Stale versions leave both the live set and the search index.
            self.search.remove(RecordKind::File, prior.as_str());
        }
        if let Some(folder) = self.folders.get_mut(&folder_id) {
            if let Some(prior) = &prior_id {
                folder.file_ids.retain(|f| f != prior);
            }
            if !folder.file_ids.contains(&id) {
                folder.file_ids.push(id.clone());
            }
        }
        self.search.add(RecordKind::File, id.as_str(), &name);

        tracing::debug!(%id, version, path = %sanitized, "upserted file");
        self.queue_flush();
        id
    }
}
