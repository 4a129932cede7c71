//! Live document sessions and the registry that owns them.
//!
//! Each open file is backed by exactly one `DocSession` holding the
//! authoritative Automerge document, keyed by `(room_id, path)`. The document
//! has a single root `Text` object under `"content"`; clients bootstrap from a
//! full snapshot and then exchange incremental update bytes, which merge
//! commutatively and idempotently on both sides.
//!
//! Persistence is write-behind: every merged update re-arms a per-session
//! debounce timer, and only the timer's expiry writes the materialized text
//! back to the store. A burst of keystrokes therefore costs one database
//! write, and the store lags the live document by at most the debounce window.

use automerge::{transaction::Transactable, AutoCommit, ObjType, ReadDoc, Value, ROOT};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PeerId, RoomId, SyncError, SyncResult};
use crate::store::{is_descendant_path, FileStore, StoreError};

const CONTENT_KEY: &str = "content";

/// Registry key for a live session.
pub type DocKey = (RoomId, String);

/// A single file's live collaborative state.
pub struct DocSession {
    /// Current `(room_id, path)`. Interior-mutable so a rename can re-point a
    /// session (and its pending flush) at the new path without dropping edits.
    key: RwLock<DocKey>,
    /// Authoritative document. One root Text object under `"content"`.
    doc: Mutex<AutoCommit>,
    /// Peers that initialized this document and receive its update relays.
    subscribers: RwLock<HashSet<PeerId>>,
    /// Pending debounced flush, if any. Re-arming aborts the previous timer.
    flush: Mutex<Option<JoinHandle<()>>>,
    /// Last init/update/unsubscribe, for idle eviction.
    last_active: RwLock<Instant>,
}

impl DocSession {
    /// Create a session seeded with the file's persisted content.
    fn seeded(key: DocKey, content: &str) -> SyncResult<Self> {
        let mut doc = AutoCommit::new();
        let text_id = doc
            .put_object(ROOT, CONTENT_KEY, ObjType::Text)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if !content.is_empty() {
            doc.splice_text(&text_id, 0, 0, content)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        Ok(Self {
            key: RwLock::new(key),
            doc: Mutex::new(doc),
            subscribers: RwLock::new(HashSet::new()),
            flush: Mutex::new(None),
            last_active: RwLock::new(Instant::now()),
        })
    }

    /// Current `(room_id, path)` this session persists to.
    pub fn key(&self) -> DocKey {
        self.key.read().clone()
    }

    /// Full snapshot for bootstrapping a newly joining client.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc.lock().save()
    }

    /// Materialize the document's text.
    pub fn current_text(&self) -> SyncResult<String> {
        let doc = self.doc.lock();
        match doc
            .get(ROOT, CONTENT_KEY)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        {
            Some((Value::Object(ObjType::Text), text_id)) => doc
                .text(&text_id)
                .map_err(|e| SyncError::Storage(e.to_string())),
            _ => Ok(String::new()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    fn cancel_flush(&self) {
        if let Some(handle) = self.flush.lock().take() {
            handle.abort();
        }
    }
}

/// Owns every live `DocSession` and the store they flush to.
///
/// All lookups go through the internal map's entry API, so two peers opening
/// the same file concurrently always land on the same session.
pub struct SessionRegistry {
    sessions: DashMap<DocKey, Arc<DocSession>>,
    store: Arc<FileStore>,
    debounce: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<FileStore>, debounce: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            debounce,
        }
    }

    /// Open (or join) the session for a file and return its full snapshot.
    ///
    /// The first opener seeds the document from the persisted content, empty
    /// when no record exists yet; later openers get the live state, which may
    /// be ahead of the store.
    pub fn init(&self, room_id: &str, path: &str, peer_id: &str) -> SyncResult<Vec<u8>> {
        let record = self.store.get_file(room_id, path)?;
        if record.as_ref().map_or(false, |r| r.is_folder()) {
            return Err(SyncError::Malformed(format!(
                "cannot open folder as document: {}",
                path
            )));
        }
        let content = record.map(|r| r.content).unwrap_or_default();

        let key: DocKey = (room_id.to_string(), path.to_string());
        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                debug!(room_id, path, "Seeding document session from store");
                let session = Arc::new(DocSession::seeded(key, &content)?);
                entry.insert(Arc::clone(&session));
                session
            }
        };

        session.subscribers.write().insert(peer_id.to_string());
        session.touch();
        Ok(session.snapshot())
    }

    /// Merge an incremental update into a live session and re-arm its flush
    /// timer. Returns the other subscribers the update should be relayed to.
    ///
    /// Updates for files with no open session are rejected rather than
    /// silently dropped, so a client that missed an eviction learns to
    /// re-initialize.
    pub fn apply_update(
        &self,
        room_id: &str,
        path: &str,
        update: &[u8],
        peer_id: &str,
    ) -> SyncResult<Vec<PeerId>> {
        let key: DocKey = (room_id.to_string(), path.to_string());
        let session = self
            .sessions
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::NotFound(format!("no open document for {}", path)))?;

        session
            .doc
            .lock()
            .load_incremental(update)
            .map_err(|e| SyncError::Malformed(format!("bad document update: {}", e)))?;
        session.touch();
        self.schedule_flush(&session);

        let recipients = session
            .subscribers
            .read()
            .iter()
            .filter(|p| p.as_str() != peer_id)
            .cloned()
            .collect();
        Ok(recipients)
    }

    /// Other subscribers of a live session, if one exists.
    pub fn subscribers_except(&self, room_id: &str, path: &str, peer_id: &str) -> Vec<PeerId> {
        let key: DocKey = (room_id.to_string(), path.to_string());
        match self.sessions.get(&key) {
            Some(entry) => entry
                .subscribers
                .read()
                .iter()
                .filter(|p| p.as_str() != peer_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop a peer from every session it subscribed to. Sessions left with no
    /// subscribers stay resident until idle eviction reclaims them.
    pub fn unsubscribe_peer(&self, peer_id: &str) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.subscribers.write().remove(peer_id) {
                session.touch();
            }
        }
    }

    /// Evict the session at `path` and every descendant session, cancelling
    /// pending flushes. Used after a delete, when the records are gone and a
    /// late flush would only fail.
    pub fn evict_under(&self, room_id: &str, path: &str) -> usize {
        let doomed: Vec<DocKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                let (room, p) = entry.key();
                room == room_id && (p == path || is_descendant_path(p, path))
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in &doomed {
            if let Some((_, session)) = self.sessions.remove(key) {
                session.cancel_flush();
                debug!(room_id, path = %key.1, "Evicted document session");
            }
        }
        doomed.len()
    }

    /// Re-key the sessions under a renamed path so live documents (and any
    /// pending flush) follow the file to its new location. No edits are lost.
    pub fn rekey(&self, room_id: &str, old_path: &str, new_path: &str) -> usize {
        let affected: Vec<DocKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                let (room, p) = entry.key();
                room == room_id && (p == old_path || is_descendant_path(p, old_path))
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in &affected {
            if let Some((_, session)) = self.sessions.remove(key) {
                let moved = format!("{}{}", new_path, &key.1[old_path.len()..]);
                *session.key.write() = (room_id.to_string(), moved.clone());
                self.sessions.insert((room_id.to_string(), moved), session);
            }
        }
        affected.len()
    }

    /// Reclaim sessions with no subscribers that have been quiet for `ttl`.
    /// Each gets one final flush before removal so no edits are dropped.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let idle: Vec<DocKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.subscribers.read().is_empty()
                    && session.last_active.read().elapsed() >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in &idle {
            if let Some((_, session)) = self.sessions.remove(key) {
                session.cancel_flush();
                self.flush_session(&session);
                debug!(room_id = %key.0, path = %key.1, "Evicted idle document session");
            }
        }
        idle.len()
    }

    /// Synchronously flush every live session. Called on shutdown.
    pub fn flush_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            session.cancel_flush();
            self.flush_session(session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn flush_session(&self, session: &DocSession) {
        let (room_id, path) = session.key();
        let text = match session.current_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(room_id, path, error = %err, "Failed to read document for flush");
                return;
            }
        };
        match self.store.update_content(&room_id, &path, &text) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                warn!(room_id, path, error = %err, "Failed to flush document content");
            }
        }
    }

    /// Re-arm the write-behind timer: the previous pending flush (if any) is
    /// aborted, so a burst of updates collapses into one store write.
    fn schedule_flush(&self, session: &Arc<DocSession>) {
        let store = Arc::clone(&self.store);
        let debounce = self.debounce;
        let sess = Arc::clone(session);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;

                // Re-read the key each attempt: a rename may have re-pointed
                // this session while the timer was pending.
                let (room_id, path) = sess.key();
                let text = match sess.current_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(room_id, path, error = %err, "Failed to read document for flush");
                        break;
                    }
                };

                match store.update_content(&room_id, &path, &text) {
                    Ok(()) => break,
                    // File deleted out from under us; nothing left to persist.
                    Err(StoreError::NotFound(_)) => break,
                    Err(err) => {
                        warn!(room_id, path, error = %err, "Flush failed, retrying");
                    }
                }
            }
        });

        let mut slot = session.flush.lock();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileKind, StoreConfig};
    use tempfile::tempdir;

    fn test_registry(debounce_ms: u64) -> (SessionRegistry, Arc<FileStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("db").to_string_lossy().to_string());
        let store = Arc::new(FileStore::open(config).unwrap());
        let registry = SessionRegistry::new(
            Arc::clone(&store),
            Duration::from_millis(debounce_ms),
        );
        (registry, store, dir)
    }

    fn seed_file(store: &FileStore, room: &str, path: &str, content: &str) {
        let name = path.rsplit('/').next().unwrap();
        store
            .create_file(room, name, path, FileKind::File, None)
            .unwrap();
        if !content.is_empty() {
            store.update_content(room, path, content).unwrap();
        }
    }

    /// Build client-side update bytes: load the snapshot, splice text, and
    /// capture the incremental save.
    fn client_edit(snapshot: &[u8], pos: usize, del: isize, insert: &str) -> Vec<u8> {
        let mut doc = AutoCommit::load(snapshot).unwrap();
        let (_, text_id) = doc.get(ROOT, CONTENT_KEY).unwrap().unwrap();
        doc.splice_text(&text_id, pos, del, insert).unwrap();
        doc.save_incremental()
    }

    #[tokio::test]
    async fn test_init_seeds_from_store() {
        let (registry, store, _dir) = test_registry(50);
        seed_file(&store, "r1", "notes.md", "hello");

        let snapshot = registry.init("r1", "notes.md", "peer-a").unwrap();

        let doc = AutoCommit::load(&snapshot).unwrap();
        let (_, text_id) = doc.get(ROOT, CONTENT_KEY).unwrap().unwrap();
        assert_eq!(doc.text(&text_id).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_init_absent_path_seeds_empty_document() {
        let (registry, _store, _dir) = test_registry(50);

        let snapshot = registry.init("r1", "ghost.txt", "p1").unwrap();

        let doc = AutoCommit::load(&snapshot).unwrap();
        let (_, text_id) = doc.get(ROOT, CONTENT_KEY).unwrap().unwrap();
        assert_eq!(doc.text(&text_id).unwrap(), "");
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_init_rejects_folder() {
        let (registry, store, _dir) = test_registry(50);
        store
            .create_file("r1", "src", "src", FileKind::Folder, None)
            .unwrap();

        assert!(matches!(
            registry.init("r1", "src", "p"),
            Err(SyncError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_update_without_session_is_rejected() {
        let (registry, store, _dir) = test_registry(50);
        seed_file(&store, "r1", "a.txt", "");

        let result = registry.apply_update("r1", "a.txt", &[1, 2, 3], "peer-a");
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_update_is_rejected() {
        let (registry, store, _dir) = test_registry(50);
        seed_file(&store, "r1", "a.txt", "");
        registry.init("r1", "a.txt", "peer-a").unwrap();

        let result = registry.apply_update("r1", "a.txt", &[0xde, 0xad, 0xbe, 0xef], "peer-a");
        assert!(matches!(result, Err(SyncError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_updates_converge_regardless_of_order() {
        let (registry, store, _dir) = test_registry(5);
        seed_file(&store, "r1", "a.txt", "base");

        let snap = registry.init("r1", "a.txt", "p1").unwrap();

        // Two independent client edits against the same base state.
        let u1 = client_edit(&snap, 4, 0, " one");
        let u2 = client_edit(&snap, 0, 0, "zero ");

        // Server merges them in one order.
        registry.apply_update("r1", "a.txt", &u1, "p1").unwrap();
        registry.apply_update("r1", "a.txt", &u2, "p1").unwrap();

        // A client that started from the same snapshot merges them in the
        // opposite order.
        let mut mirror = AutoCommit::load(&snap).unwrap();
        mirror.load_incremental(&u2).unwrap();
        mirror.load_incremental(&u1).unwrap();
        let (_, text_id) = mirror.get(ROOT, CONTENT_KEY).unwrap().unwrap();
        let mirror_text = mirror.text(&text_id).unwrap();

        let server_text = registry
            .sessions
            .get(&("r1".to_string(), "a.txt".to_string()))
            .unwrap()
            .current_text()
            .unwrap();

        assert_eq!(server_text, mirror_text);
        assert!(server_text.contains("base"));
        assert!(server_text.contains("zero"));
        assert!(server_text.contains("one"));
    }

    #[tokio::test]
    async fn test_duplicate_update_is_idempotent() {
        let (registry, store, _dir) = test_registry(5);
        seed_file(&store, "r1", "a.txt", "hi");

        let snap = registry.init("r1", "a.txt", "p1").unwrap();
        let update = client_edit(&snap, 2, 0, " there");

        registry.apply_update("r1", "a.txt", &update, "p1").unwrap();
        registry.apply_update("r1", "a.txt", &update, "p1").unwrap();

        let session = registry
            .sessions
            .get(&("r1".to_string(), "a.txt".to_string()))
            .unwrap()
            .clone();
        assert_eq!(session.current_text().unwrap(), "hi there");
    }

    #[tokio::test]
    async fn test_debounce_coalesces_writes() {
        let (registry, store, _dir) = test_registry(40);
        seed_file(&store, "r1", "a.txt", "");

        let writes_before = store.stats().content_writes;

        let mut snap = registry.init("r1", "a.txt", "p1").unwrap();
        for i in 0..5 {
            let update = client_edit(&snap, i, 0, "x");
            registry.apply_update("r1", "a.txt", &update, "p1").unwrap();
            snap = registry
                .sessions
                .get(&("r1".to_string(), "a.txt".to_string()))
                .unwrap()
                .snapshot();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.stats().content_writes - writes_before, 1);
        let record = store.get_file("r1", "a.txt").unwrap().unwrap();
        assert_eq!(record.content, "xxxxx");
    }

    #[tokio::test]
    async fn test_relay_excludes_sender() {
        let (registry, store, _dir) = test_registry(5);
        seed_file(&store, "r1", "a.txt", "");

        let snap = registry.init("r1", "a.txt", "p1").unwrap();
        registry.init("r1", "a.txt", "p2").unwrap();
        registry.init("r1", "a.txt", "p3").unwrap();

        let update = client_edit(&snap, 0, 0, "y");
        let mut recipients = registry.apply_update("r1", "a.txt", &update, "p2").unwrap();
        recipients.sort();

        assert_eq!(recipients, vec!["p1".to_string(), "p3".to_string()]);
    }

    #[tokio::test]
    async fn test_rekey_preserves_live_edits() {
        let (registry, store, _dir) = test_registry(20);
        store
            .create_file("r1", "docs", "docs", FileKind::Folder, None)
            .unwrap();
        seed_file(&store, "r1", "docs/a.md", "draft");

        let snap = registry.init("r1", "docs/a.md", "p1").unwrap();
        let update = client_edit(&snap, 5, 0, " two");
        registry.apply_update("r1", "docs/a.md", &update, "p1").unwrap();

        // Simulate the rename cascade the coordinator performs.
        store.rename_cascade("r1", "docs", "papers", "papers").unwrap();
        let moved = registry.rekey("r1", "docs", "papers");
        assert_eq!(moved, 1);

        let session = registry
            .sessions
            .get(&("r1".to_string(), "papers/a.md".to_string()))
            .unwrap()
            .clone();
        assert_eq!(session.current_text().unwrap(), "draft two");

        // The pending flush lands at the new path.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let record = store.get_file("r1", "papers/a.md").unwrap().unwrap();
        assert_eq!(record.content, "draft two");
    }

    #[tokio::test]
    async fn test_evict_under_covers_descendants_only() {
        let (registry, store, _dir) = test_registry(20);
        seed_file(&store, "r1", "src/main.rs", "");
        seed_file(&store, "r1", "src2/lib.rs", "");

        registry.init("r1", "src/main.rs", "p1").unwrap();
        registry.init("r1", "src2/lib.rs", "p1").unwrap();

        let evicted = registry.evict_under("r1", "src");
        assert_eq!(evicted, 1);
        assert_eq!(registry.session_count(), 1);
        assert!(registry
            .sessions
            .contains_key(&("r1".to_string(), "src2/lib.rs".to_string())));
    }

    #[tokio::test]
    async fn test_idle_eviction_flushes_once() {
        let (registry, store, _dir) = test_registry(30_000);
        seed_file(&store, "r1", "a.txt", "");

        let snap = registry.init("r1", "a.txt", "p1").unwrap();
        let update = client_edit(&snap, 0, 0, "final");
        registry.apply_update("r1", "a.txt", &update, "p1").unwrap();
        registry.unsubscribe_peer("p1");

        // Still within TTL: nothing evicted.
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)), 0);

        // Past TTL: evicted with a final flush despite the long debounce.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.evict_idle(Duration::from_millis(10)), 1);
        assert_eq!(registry.session_count(), 0);

        let record = store.get_file("r1", "a.txt").unwrap().unwrap();
        assert_eq!(record.content, "final");
    }

    #[tokio::test]
    async fn test_flush_all_persists_everything() {
        let (registry, store, _dir) = test_registry(30_000);
        seed_file(&store, "r1", "a.txt", "");
        seed_file(&store, "r1", "b.txt", "");

        let snap_a = registry.init("r1", "a.txt", "p1").unwrap();
        let snap_b = registry.init("r1", "b.txt", "p1").unwrap();
        registry
            .apply_update("r1", "a.txt", &client_edit(&snap_a, 0, 0, "alpha"), "p1")
            .unwrap();
        registry
            .apply_update("r1", "b.txt", &client_edit(&snap_b, 0, 0, "beta"), "p1")
            .unwrap();

        registry.flush_all();

        assert_eq!(store.get_file("r1", "a.txt").unwrap().unwrap().content, "alpha");
        assert_eq!(store.get_file("r1", "b.txt").unwrap().unwrap().content, "beta");
    }
}
