//! Sled-based file store for room file trees.
//!
//! Records are stored under `room_id \x00 path` keys so a room's whole tree is
//! one prefix scan. The structural invariants the rest of the server relies on
//! are enforced here, not in the handlers:
//! - `create_file` runs as a transaction that checks the parent and claims the
//!   path key, so two concurrent creates for the same path cannot both succeed
//!   and no record can point at a missing or non-folder parent
//! - cascade rename and `update_content` each run as a single sled
//!   transaction, all-or-nothing; cascade delete re-scans until the subtree
//!   is empty

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::{is_descendant_path, parent_of, FileKind, FileRecord, RoomMeta, StoreConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid parent: {0}")]
    InvalidParent(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

const TREE_FILES: &str = "files";
const TREE_ROOMS: &str = "rooms";

const KEY_SEPARATOR: u8 = 0;

/// Sled-backed store for file records and room metadata
#[derive(Clone)]
pub struct FileStore {
    db: Arc<Db>,
    files: Tree,
    rooms: Tree,
    content_writes: Arc<AtomicU64>,
}

impl FileStore {
    /// Open or create a store at the configured path
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let files = db.open_tree(TREE_FILES)?;
        let rooms = db.open_tree(TREE_ROOMS)?;

        Ok(Self {
            db: Arc::new(db),
            files,
            rooms,
            content_writes: Arc::new(AtomicU64::new(0)),
        })
    }

    fn record_key(room_id: &str, path: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 1 + path.len());
        key.extend_from_slice(room_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(path.as_bytes());
        key
    }

    fn room_prefix(room_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 1);
        key.extend_from_slice(room_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    /// List every record in a room with content omitted, ordered by
    /// `(parent, name)` so clients can rebuild the tree deterministically.
    pub fn list_files(&self, room_id: &str) -> StoreResult<Vec<FileRecord>> {
        let mut records = Vec::new();
        for item in self.files.scan_prefix(Self::room_prefix(room_id)) {
            let (_, value) = item?;
            let mut record: FileRecord = bincode::deserialize(&value)?;
            record.content.clear();
            records.push(record);
        }
        records.sort_by(|a, b| {
            let pa = a.parent.as_deref().unwrap_or("");
            let pb = b.parent.as_deref().unwrap_or("");
            pa.cmp(pb).then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    /// Fetch a single record, content included
    pub fn get_file(&self, room_id: &str, path: &str) -> StoreResult<Option<FileRecord>> {
        match self.files.get(Self::record_key(room_id, path))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Create a record. Runs as a single transaction: the parent (when set)
    /// must exist as a folder record, and if another writer claimed the path
    /// key first the call fails with `AlreadyExists` and nothing is written.
    pub fn create_file(
        &self,
        room_id: &str,
        name: &str,
        path: &str,
        kind: FileKind,
        parent: Option<String>,
    ) -> StoreResult<FileRecord> {
        let record = FileRecord::new(room_id, name, path, kind, parent);
        let bytes = bincode::serialize(&record)?;
        let key = Self::record_key(room_id, path);
        let parent_key = record
            .parent
            .as_deref()
            .map(|p| (p.to_string(), Self::record_key(room_id, p)));

        let result = self.files.transaction(|tx| {
            if let Some((parent_path, parent_key)) = &parent_key {
                let parent_record: FileRecord = tx
                    .get(parent_key.clone())?
                    .as_deref()
                    .map(bincode::deserialize)
                    .transpose()
                    .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(StoreError::InvalidParent(format!(
                            "no folder at {}",
                            parent_path
                        )))
                    })?;
                if !parent_record.is_folder() {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::InvalidParent(format!("{} is not a folder", parent_path)),
                    ));
                }
            }

            if tx.get(key.clone())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    StoreError::AlreadyExists(path.to_string()),
                ));
            }
            tx.insert(key.clone(), bytes.clone())?;
            Ok(())
        });
        map_tx_result(result)?;

        Ok(record)
    }

    /// Delete the record at `path` and every descendant in one transaction.
    /// Returns the deleted records.
    ///
    /// The descendant scan cannot run inside the transaction (sled
    /// transactions do not iterate), so a create interleaved between scan and
    /// commit would survive as an orphan; the loop re-scans until the subtree
    /// is empty.
    pub fn delete_cascade(&self, room_id: &str, path: &str) -> StoreResult<Vec<FileRecord>> {
        let mut removed: Vec<FileRecord> = Vec::new();

        loop {
            let mut doomed: Vec<(Vec<u8>, FileRecord)> = Vec::new();
            for item in self.files.scan_prefix(Self::room_prefix(room_id)) {
                let (key, value) = item?;
                let record: FileRecord = bincode::deserialize(&value)?;
                if record.path == path || is_descendant_path(&record.path, path) {
                    doomed.push((key.to_vec(), record));
                }
            }

            if removed.is_empty() && !doomed.iter().any(|(_, r)| r.path == path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            if doomed.is_empty() {
                break;
            }

            let result = self.files.transaction(|tx| {
                for (key, _) in &doomed {
                    tx.remove(key.clone())?;
                }
                Ok(())
            });
            map_tx_result(result)?;

            removed.extend(doomed.into_iter().map(|(_, record)| record));
        }

        Ok(removed)
    }

    /// Rename the record at `old_path` to `new_path`, rewriting every
    /// descendant's path and parent by prefix replacement. Runs as a single
    /// transaction: on a target collision or storage failure the store is
    /// left exactly as it was.
    pub fn rename_cascade(
        &self,
        room_id: &str,
        old_path: &str,
        new_path: &str,
        new_name: &str,
    ) -> StoreResult<FileRecord> {
        let mut source = self
            .get_file(room_id, old_path)?
            .ok_or_else(|| StoreError::NotFound(old_path.to_string()))?;

        let mut descendants: Vec<FileRecord> = Vec::new();
        if source.is_folder() {
            for item in self.files.scan_prefix(Self::room_prefix(room_id)) {
                let (_, value) = item?;
                let record: FileRecord = bincode::deserialize(&value)?;
                if is_descendant_path(&record.path, old_path) {
                    descendants.push(record);
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        source.path = new_path.to_string();
        source.name = new_name.to_string();
        source.parent = parent_of(new_path);
        source.updated_at = now;

        let moved: Vec<FileRecord> = descendants
            .iter()
            .map(|record| {
                let mut moved = record.clone();
                moved.path = format!("{}{}", new_path, &record.path[old_path.len()..]);
                moved.parent = record
                    .parent
                    .as_deref()
                    .map(|p| format!("{}{}", new_path, &p[old_path.len()..]));
                moved.updated_at = now;
                moved
            })
            .collect();

        let new_key = Self::record_key(room_id, new_path);
        let result = self.files.transaction(|tx| {
            if tx.get(new_key.clone())?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    StoreError::AlreadyExists(new_path.to_string()),
                ));
            }

            tx.remove(Self::record_key(room_id, old_path))?;
            let bytes = bincode::serialize(&source)
                .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?;
            tx.insert(new_key.clone(), bytes)?;

            for (old, new) in descendants.iter().zip(moved.iter()) {
                tx.remove(Self::record_key(room_id, &old.path))?;
                let bytes = bincode::serialize(new)
                    .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?;
                tx.insert(Self::record_key(room_id, &new.path), bytes)?;
            }

            Ok(())
        });
        map_tx_result(result)?;

        Ok(source)
    }

    /// Overwrite a file's persisted content. Called by the debounced flush;
    /// folders and missing paths are rejected with `NotFound`.
    ///
    /// The read-modify-write runs as one transaction so it serializes against
    /// a concurrent rename or delete: a flush racing a rename cannot re-insert
    /// the record at its removed path.
    pub fn update_content(&self, room_id: &str, path: &str, content: &str) -> StoreResult<()> {
        let key = Self::record_key(room_id, path);
        let content = content.to_string();

        let result = self.files.transaction(|tx| {
            let mut record: FileRecord = tx
                .get(key.clone())?
                .as_deref()
                .map(bincode::deserialize)
                .transpose()
                .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?
                .filter(|r: &FileRecord| r.kind.is_file())
                .ok_or_else(|| {
                    ConflictableTransactionError::Abort(StoreError::NotFound(path.to_string()))
                })?;

            record.content = content.clone();
            record.updated_at = chrono::Utc::now().timestamp();

            let bytes = bincode::serialize(&record)
                .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?;
            tx.insert(key.clone(), bytes)?;
            Ok(())
        });
        map_tx_result(result)?;

        self.content_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Save room metadata
    pub fn save_room(&self, meta: &RoomMeta) -> StoreResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.rooms.insert(meta.room_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load room metadata
    pub fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomMeta>> {
        match self.rooms.get(room_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all known rooms
    pub fn list_rooms(&self) -> StoreResult<Vec<RoomMeta>> {
        let mut rooms = Vec::new();
        for item in self.rooms.iter() {
            let (_, value) = item?;
            rooms.push(bincode::deserialize(&value)?);
        }
        Ok(rooms)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            record_count: self.files.len(),
            room_count: self.rooms.len(),
            content_writes: self.content_writes.load(Ordering::Relaxed),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

fn map_tx_result<T>(result: Result<T, TransactionError<StoreError>>) -> StoreResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(StoreError::Sled(err)),
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub record_count: usize,
    pub room_count: usize,
    pub content_writes: u64,
    pub total_size_bytes: u64,
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> FileStore {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        FileStore::open(config).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let store = test_store();
        store
            .create_file("r1", "src", "src", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "main.rs", "src/main.rs", FileKind::File, Some("src".into()))
            .unwrap();

        let record = store.get_file("r1", "src/main.rs").unwrap().unwrap();
        assert_eq!(record.name, "main.rs");
        assert_eq!(record.parent.as_deref(), Some("src"));
        assert!(record.content.is_empty());
    }

    #[test]
    fn test_create_rejects_dangling_parent() {
        let store = test_store();

        // No `a` folder exists.
        let result = store.create_file("r1", "b.txt", "a/b.txt", FileKind::File, Some("a".into()));
        assert!(matches!(result, Err(StoreError::InvalidParent(_))));
        assert_eq!(store.stats().record_count, 0);

        // A file cannot be a parent either.
        store
            .create_file("r1", "a", "a", FileKind::File, None)
            .unwrap();
        let result = store.create_file("r1", "b.txt", "a/b.txt", FileKind::File, Some("a".into()));
        assert!(matches!(result, Err(StoreError::InvalidParent(_))));
        assert!(store.get_file("r1", "a/b.txt").unwrap().is_none());
    }

    #[test]
    fn test_create_collision_leaves_store_unchanged() {
        let store = test_store();
        store
            .create_file("r1", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();

        let result = store.create_file("r1", "a.txt", "a.txt", FileKind::File, None);
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.stats().record_count, 1);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let store = test_store();
        store
            .create_file("r1", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();
        store
            .create_file("r2", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();

        assert_eq!(store.list_files("r1").unwrap().len(), 1);
        assert_eq!(store.list_files("r2").unwrap().len(), 1);
    }

    #[test]
    fn test_list_omits_content_and_orders_by_parent_then_name() {
        let store = test_store();
        store
            .create_file("r1", "src", "src", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "b.rs", "src/b.rs", FileKind::File, Some("src".into()))
            .unwrap();
        store
            .create_file("r1", "a.rs", "src/a.rs", FileKind::File, Some("src".into()))
            .unwrap();
        store.update_content("r1", "src/a.rs", "hidden").unwrap();

        let files = store.list_files("r1").unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["src", "a.rs", "b.rs"]);
        assert!(files.iter().all(|f| f.content.is_empty()));
    }

    #[test]
    fn test_update_content() {
        let store = test_store();
        store
            .create_file("r1", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();

        store.update_content("r1", "a.txt", "hello").unwrap();

        let record = store.get_file("r1", "a.txt").unwrap().unwrap();
        assert_eq!(record.content, "hello");
        assert_eq!(store.stats().content_writes, 1);
    }

    #[test]
    fn test_update_content_rejects_folders_and_missing() {
        let store = test_store();
        store
            .create_file("r1", "src", "src", FileKind::Folder, None)
            .unwrap();

        assert!(matches!(
            store.update_content("r1", "src", "x"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_content("r1", "ghost.txt", "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_cascade() {
        let store = test_store();
        store
            .create_file("r1", "docs", "docs", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "a.md", "docs/a.md", FileKind::File, Some("docs".into()))
            .unwrap();
        store
            .create_file("r1", "sub", "docs/sub", FileKind::Folder, Some("docs".into()))
            .unwrap();
        store
            .create_file("r1", "b.md", "docs/sub/b.md", FileKind::File, Some("docs/sub".into()))
            .unwrap();
        store
            .create_file("r1", "docs2", "docs2", FileKind::Folder, None)
            .unwrap();

        let deleted = store.delete_cascade("r1", "docs").unwrap();
        assert_eq!(deleted.len(), 4);

        // Sibling with a shared name prefix must survive
        assert!(store.get_file("r1", "docs2").unwrap().is_some());
        assert!(store.get_file("r1", "docs/sub/b.md").unwrap().is_none());
        assert_eq!(store.stats().record_count, 1);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.delete_cascade("r1", "nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_cascade() {
        let store = test_store();
        store
            .create_file("r1", "docs", "docs", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "readme.md", "docs/readme.md", FileKind::File, Some("docs".into()))
            .unwrap();

        let renamed = store
            .rename_cascade("r1", "docs", "papers", "papers")
            .unwrap();
        assert_eq!(renamed.path, "papers");

        assert!(store.get_file("r1", "docs").unwrap().is_none());
        assert!(store.get_file("r1", "docs/readme.md").unwrap().is_none());

        let moved = store.get_file("r1", "papers/readme.md").unwrap().unwrap();
        assert_eq!(moved.parent.as_deref(), Some("papers"));
        assert_eq!(moved.name, "readme.md");
    }

    #[test]
    fn test_update_content_after_rename_does_not_resurrect() {
        let store = test_store();
        store
            .create_file("r1", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();
        store.rename_cascade("r1", "a.txt", "b.txt", "b.txt").unwrap();

        // A stale flush aimed at the old path must fail, not re-insert the
        // removed record.
        assert!(matches!(
            store.update_content("r1", "a.txt", "stale"),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get_file("r1", "a.txt").unwrap().is_none());
        assert_eq!(store.stats().record_count, 1);
    }

    #[test]
    fn test_rename_preserves_content() {
        let store = test_store();
        store
            .create_file("r1", "a.txt", "a.txt", FileKind::File, None)
            .unwrap();
        store.update_content("r1", "a.txt", "body").unwrap();

        store.rename_cascade("r1", "a.txt", "b.txt", "b.txt").unwrap();

        let record = store.get_file("r1", "b.txt").unwrap().unwrap();
        assert_eq!(record.content, "body");
    }

    #[test]
    fn test_rename_collision_leaves_store_unchanged() {
        let store = test_store();
        store
            .create_file("r1", "docs", "docs", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "a.md", "docs/a.md", FileKind::File, Some("docs".into()))
            .unwrap();
        store
            .create_file("r1", "papers", "papers", FileKind::Folder, None)
            .unwrap();

        let result = store.rename_cascade("r1", "docs", "papers", "papers");
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));

        // Nothing moved
        assert!(store.get_file("r1", "docs").unwrap().is_some());
        assert!(store.get_file("r1", "docs/a.md").unwrap().is_some());
        assert!(store.get_file("r1", "papers/a.md").unwrap().is_none());
    }

    #[test]
    fn test_path_invariant_after_mixed_operations() {
        let store = test_store();
        store
            .create_file("r1", "src", "src", FileKind::Folder, None)
            .unwrap();
        store
            .create_file("r1", "main.rs", "src/main.rs", FileKind::File, Some("src".into()))
            .unwrap();
        store
            .create_file("r1", "util", "src/util", FileKind::Folder, Some("src".into()))
            .unwrap();
        store
            .create_file("r1", "io.rs", "src/util/io.rs", FileKind::File, Some("src/util".into()))
            .unwrap();
        store.rename_cascade("r1", "src", "lib", "lib").unwrap();
        store.delete_cascade("r1", "lib/util").unwrap();

        let files = store.list_files("r1").unwrap();
        let mut paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let unique_before = paths.len();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), unique_before);

        // Every parent reference resolves to a folder record
        for record in &files {
            if let Some(parent) = &record.parent {
                let parent_record = store.get_file("r1", parent).unwrap();
                assert!(parent_record.map_or(false, |p| p.is_folder()), "dangling parent {parent}");
            }
        }
    }

    #[test]
    fn test_room_metadata() {
        let store = test_store();
        let meta = RoomMeta::new("r-abc", "Demo Room");

        store.save_room(&meta).unwrap();
        let loaded = store.get_room("r-abc").unwrap().unwrap();
        assert_eq!(loaded.name, "Demo Room");

        assert_eq!(store.list_rooms().unwrap().len(), 1);
        assert!(store.get_room("missing").unwrap().is_none());
    }
}
