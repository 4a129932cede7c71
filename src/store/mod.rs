//! Storage module for the per-room file tree, backed by Sled.
//!
//! Every file or folder a room shows its members is a `FileRecord` keyed by
//! `(room_id, path)`. Structural mutations (create, cascade delete, cascade
//! rename) are conditional or transactional at the database level so that a
//! partially applied cascade can never leave orphaned or duplicated paths.

mod sled_store;

pub use sled_store::{FileStore, StoreError, StoreResult, StoreStats};

use serde::{Deserialize, Serialize};

/// Whether a record is an editable file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Folder,
}

impl FileKind {
    pub fn is_file(&self) -> bool {
        matches!(self, FileKind::File)
    }
}

/// Persisted entity representing a file or folder within a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Room that owns this record (partition key).
    pub room_id: String,
    /// Final path segment, e.g. `main.rs`.
    pub name: String,
    /// Full slash-delimited path from the room root, e.g. `src/main.rs`.
    /// Unique within a room.
    pub path: String,
    /// File or folder.
    pub kind: FileKind,
    /// Current persisted content. Always empty for folders; for files this is
    /// the last debounced flush of the live document, not necessarily the
    /// latest keystroke.
    pub content: String,
    /// Path of the containing folder, `None` for root-level records.
    pub parent: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of last modification.
    pub updated_at: i64,
}

impl FileRecord {
    pub fn new(
        room_id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        kind: FileKind,
        parent: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            room_id: room_id.into(),
            name: name.into(),
            path: path.into(),
            kind,
            content: String::new(),
            parent,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }
}

/// Metadata for a room, stored independently of its file records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMeta {
    pub room_id: String,
    pub name: String,
    pub created_at: i64,
}

impl RoomMeta {
    pub fn new(room_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            name: name.into(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Configuration for the storage layer.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the Sled database directory.
    pub path: String,
    /// Cache size in bytes.
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate).
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./data/syncroom.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// True when `candidate` lies strictly under the folder at `prefix`,
/// segment-aware: `src` covers `src/main.rs` but never `src2/lib.rs`.
pub fn is_descendant_path(candidate: &str, prefix: &str) -> bool {
    candidate
        .strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('/'))
}

/// Parent path of a slash-delimited path, `None` for root-level paths.
pub fn parent_of(path: &str) -> Option<String> {
    path.rsplit_once('/').map(|(parent, _)| parent.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let record = FileRecord::new("room-1", "main.rs", "src/main.rs", FileKind::File, Some("src".into()));

        assert_eq!(record.room_id, "room-1");
        assert_eq!(record.path, "src/main.rs");
        assert!(record.content.is_empty());
        assert!(record.created_at > 0);
    }

    #[test]
    fn test_descendant_path_is_segment_aware() {
        assert!(is_descendant_path("src/main.rs", "src"));
        assert!(is_descendant_path("src/a/b.rs", "src"));
        assert!(!is_descendant_path("src2/lib.rs", "src"));
        assert!(!is_descendant_path("src", "src"));
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("src/main.rs"), Some("src".to_string()));
        assert_eq!(parent_of("docs/a/b.md"), Some("docs/a".to_string()));
        assert_eq!(parent_of("readme.md"), None);
    }
}
