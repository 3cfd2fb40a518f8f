//! Core identifier and record types for the drive engine.
//!
//! Folder and file ids are distinct newtypes so they cannot be
//! cross-assigned. Full paths pair a storage location with a sanitized
//! relative path and serialize canonically as `"<location>::<path>"`.
//! Folder paths carry a trailing `/` per segment (the root is the empty
//! path), so a folder and a file can never collide on the same key.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Unique folder identifier (UUIDv4 in practice, opaque to the engine).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(pub String);

/// Unique file identifier. Each version of a file gets its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FolderId {
    pub fn generate() -> Self {
        FolderId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FileId {
    pub fn generate() -> Self {
        FileId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an item's bytes live. Unrecognized values are preserved verbatim
/// in `Other` rather than rejected, so records from newer peers round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageLocation {
    BrowserCache,
    HardDrive,
    Web3Storj,
    Other(String),
}

impl StorageLocation {
    pub fn as_str(&self) -> &str {
        match self {
            StorageLocation::BrowserCache => "BrowserCache",
            StorageLocation::HardDrive => "HardDrive",
            StorageLocation::Web3Storj => "Web3Storj",
            StorageLocation::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "BrowserCache" => StorageLocation::BrowserCache,
            "HardDrive" => StorageLocation::HardDrive,
            "Web3Storj" => StorageLocation::Web3Storj,
            other => StorageLocation::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StorageLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StorageLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(StorageLocation::parse(&s))
    }
}

/// Canonical address of a folder or file: storage location plus sanitized
/// relative path, rendered as `"<location>::<path>"`.
///
/// Folder paths end each segment with `/` (`"Work/2023/"`); the bare
/// location root is the empty path. File paths never carry a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullPath {
    pub location: StorageLocation,
    pub path: String,
}

impl FullPath {
    pub fn new(location: StorageLocation, path: impl Into<String>) -> Self {
        FullPath {
            location,
            path: path.into(),
        }
    }

    /// Root path for a storage location (`"<location>::"`).
    pub fn root(location: StorageLocation) -> Self {
        FullPath {
            location,
            path: String::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Parse the canonical `"<location>::<path>"` form. Input without the
    /// delimiter is treated as a bare location root.
    pub fn parse(s: &str) -> Self {
        match s.split_once("::") {
            Some((loc, path)) => FullPath {
                location: StorageLocation::parse(loc),
                path: path.to_string(),
            },
            None => FullPath {
                location: StorageLocation::parse(s),
                path: String::new(),
            },
        }
    }
}

impl fmt::Display for FullPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.location, self.path)
    }
}

impl Serialize for FullPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FullPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !s.contains("::") {
            return Err(D::Error::custom(format!("full path missing '::': {s}")));
        }
        Ok(FullPath::parse(&s))
    }
}

/// Folder metadata record. Tombstoned folders stay in the id map (and in
/// their parent's subfolder list) so a later sync can observe the delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: FolderId,
    pub name: String,
    pub parent_folder: Option<FolderId>,
    pub subfolders: Vec<FolderId>,
    /// Live file ids only: the head of each version chain, never stale
    /// versions, never tombstones.
    pub file_ids: Vec<FileId>,
    pub full_path: FullPath,
    pub tags: Vec<String>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub location: StorageLocation,
    pub last_changed_ms: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// File metadata record, one per version, linked into a doubly-linked
/// version chain via `prior_version`/`next_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub folder: FolderId,
    pub version: u32,
    pub prior_version: Option<FileId>,
    pub next_version: Option<FileId>,
    pub extension: String,
    pub full_path: FullPath,
    pub tags: Vec<String>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub location: StorageLocation,
    pub size: u64,
    /// Backend-specific locator (local object key, signed URL, ...).
    pub raw_location: String,
    pub last_changed_ms: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// The slice of file metadata a backend learns while uploading. Passed back
/// into the upsert so a backend that already allocated an id (and knows the
/// final byte size and raw location) is authoritative for those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFragment {
    pub id: FileId,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub raw_location: String,
}

/// An in-memory file handle queued for upload. `relative_path` mirrors a
/// directory-upload hint: when present it wins over the bare name when the
/// target path is computed.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub name: String,
    pub relative_path: Option<String>,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        UploadSource {
            name: name.into(),
            relative_path: None,
            mime_type: None,
            bytes,
        }
    }

    /// Mime type: explicit if set, else guessed from the name.
    pub fn mime(&self) -> String {
        match &self.mime_type {
            Some(m) => m.clone(),
            None => mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .to_string(),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
