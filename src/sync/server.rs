//! CollabServer: the room and document coordinator.
//!
//! This module implements the core coordination layer using:
//! - DashMap for lock-free concurrent access to rooms and peers
//! - Automerge sessions (via `SessionRegistry`) for per-file CRDT sync
//! - Per-peer outbound channels for targeted delivery
//!
//! Every operation is gated on room membership, and every structural mutation
//! hits the store first: only a successful conditional write or transaction
//! produces broadcasts, so other members never observe a mutation that did
//! not happen.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::protocol::{FileEntry, ServerMessage, TreeChange};
use super::session::SessionRegistry;
use super::{PeerId, RoomId, SyncError, SyncResult};
use crate::store::{parent_of, FileKind, FileStore, RoomMeta};

/// Configuration for the CollabServer
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum peers per room
    pub max_members_per_room: usize,
    /// Write-behind delay between a document update and its store flush
    pub debounce: Duration,
    /// Cleanup interval for idle sessions and empty rooms
    pub cleanup_interval: Duration,
    /// How long an unsubscribed document session stays resident
    pub idle_session_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_members_per_room: 50,
            debounce: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
            idle_session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// A single peer connection with its outbound channel
pub struct PeerConnection {
    /// Unique peer identifier
    pub peer_id: PeerId,
    /// Channel to send messages to this peer
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Rooms this peer has joined
    joined_rooms: Vec<RoomId>,
}

impl PeerConnection {
    pub fn new(peer_id: impl Into<String>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            peer_id: peer_id.into(),
            tx,
            joined_rooms: Vec::new(),
        }
    }

    /// Send a message to this peer
    pub fn send(&self, msg: ServerMessage) -> SyncResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionClosed(self.peer_id.clone()))
    }

    fn join_room(&mut self, room_id: &str) {
        if !self.joined_rooms.iter().any(|r| r == room_id) {
            self.joined_rooms.push(room_id.to_string());
        }
    }

    fn leave_room(&mut self, room_id: &str) {
        self.joined_rooms.retain(|r| r != room_id);
    }
}

/// A room's live membership
struct Room {
    room_id: RoomId,
    /// Member peer IDs and when they joined
    members: DashMap<PeerId, Instant>,
    created_at: Instant,
}

impl Room {
    fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            members: DashMap::new(),
            created_at: Instant::now(),
        }
    }

    fn member_count(&self) -> usize {
        self.members.len()
    }

    fn is_member(&self, peer_id: &str) -> bool {
        self.members.contains_key(peer_id)
    }

    fn member_ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|r| r.key().clone()).collect()
    }
}

/// The main coordination server
pub struct CollabServer {
    /// Server configuration
    config: ServerConfig,
    /// Active rooms
    rooms: DashMap<RoomId, Arc<Room>>,
    /// Connected peers (global)
    peers: DashMap<PeerId, Arc<parking_lot::RwLock<PeerConnection>>>,
    /// Live document sessions
    registry: SessionRegistry,
    /// Persistent storage
    store: Arc<FileStore>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl CollabServer {
    pub fn new(store: Arc<FileStore>, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = SessionRegistry::new(Arc::clone(&store), config.debounce);
        Self {
            config,
            rooms: DashMap::new(),
            peers: DashMap::new(),
            registry,
            store,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_store(store: Arc<FileStore>) -> Self {
        Self::new(store, ServerConfig::default())
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown: flush every live document, then signal
    /// background tasks.
    pub fn shutdown(&self) {
        self.registry.flush_all();
        if let Err(err) = self.store.flush() {
            warn!(error = %err, "Final store flush failed");
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Register a new peer connection
    pub fn register_peer(&self, peer_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        let connection = PeerConnection::new(peer_id, tx);
        self.peers
            .insert(peer_id.to_string(), Arc::new(parking_lot::RwLock::new(connection)));
        info!("Peer registered: {}", peer_id);
    }

    /// Unregister a peer: drop its room memberships and document
    /// subscriptions. Sessions it leaves behind are reclaimed by idle
    /// eviction, not immediately.
    pub fn unregister_peer(&self, peer_id: &str) {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            let joined = peer.read().joined_rooms.clone();
            for room_id in joined {
                if let Some(room) = self.rooms.get(&room_id) {
                    room.members.remove(peer_id);
                }
            }
            self.registry.unsubscribe_peer(peer_id);
            info!("Peer unregistered: {}", peer_id);
        }
    }

    /// Get a peer connection
    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<parking_lot::RwLock<PeerConnection>>> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Join a room, creating it (and its persisted metadata) on first use.
    /// Joining twice is harmless.
    pub fn join_room(&self, peer_id: &str, room_id: &str) -> SyncResult<ServerMessage> {
        if room_id.trim().is_empty() {
            return Err(SyncError::Malformed("empty room id".to_string()));
        }

        let room = self.get_or_create_room(room_id)?;

        if !room.is_member(peer_id) && room.member_count() >= self.config.max_members_per_room {
            return Err(SyncError::AccessDenied(room_id.to_string()));
        }

        room.members.insert(peer_id.to_string(), Instant::now());
        if let Some(peer) = self.peers.get(peer_id) {
            peer.write().join_room(room_id);
        }

        info!("Peer {} joined room {}", peer_id, room_id);
        Ok(ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
        })
    }

    /// List the room's file tree, content omitted.
    pub fn list_files(&self, peer_id: &str, room_id: &str) -> SyncResult<ServerMessage> {
        self.check_membership(peer_id, room_id)?;

        let files = self
            .store
            .list_files(room_id)?
            .iter()
            .map(FileEntry::from)
            .collect();

        Ok(ServerMessage::FileList {
            room_id: room_id.to_string(),
            files,
        })
    }

    /// Open a document session and return the full snapshot.
    pub fn doc_init(&self, peer_id: &str, room_id: &str, path: &str) -> SyncResult<ServerMessage> {
        self.check_membership(peer_id, room_id)?;

        let state = self.registry.init(room_id, path, peer_id)?;
        debug!("Peer {} opened document {}:{}", peer_id, room_id, path);

        Ok(ServerMessage::DocReady {
            room_id: room_id.to_string(),
            path: path.to_string(),
            state,
        })
    }

    /// Merge a document update and relay it to the file's other subscribers.
    /// The sender gets no echo and no ack; convergence is the CRDT's job.
    pub fn doc_update(
        &self,
        peer_id: &str,
        room_id: &str,
        path: &str,
        update: Vec<u8>,
    ) -> SyncResult<()> {
        self.check_membership(peer_id, room_id)?;

        let recipients = self.registry.apply_update(room_id, path, &update, peer_id)?;

        let msg = ServerMessage::DocUpdate {
            room_id: room_id.to_string(),
            path: path.to_string(),
            update,
            from_peer: peer_id.to_string(),
        };
        for recipient in recipients {
            self.send_to_peer(&recipient, msg.clone());
        }
        Ok(())
    }

    /// Create a file or folder. On success the requester gets a `FileAdded`
    /// ack and every room member (requester included) gets a `FileRefresh`;
    /// on a path collision nothing is written and nothing is broadcast.
    /// A claimed `parent` must agree with the path it would be derived from.
    pub fn file_add(
        &self,
        peer_id: &str,
        room_id: &str,
        name: &str,
        path: &str,
        kind: FileKind,
        parent: Option<String>,
    ) -> SyncResult<ServerMessage> {
        self.check_membership(peer_id, room_id)?;
        if name.trim().is_empty() || path.trim().is_empty() {
            return Err(SyncError::Malformed("empty file name or path".to_string()));
        }

        let derived = parent_of(path);
        if let Some(claimed) = &parent {
            if derived.as_deref() != Some(claimed.as_str()) {
                return Err(SyncError::Malformed(format!(
                    "parent {} does not match path {}",
                    claimed, path
                )));
            }
        }

        let created = self.store.create_file(room_id, name, path, kind, derived)?;
        let entry = FileEntry::from(&created);

        self.broadcast_to_room(
            room_id,
            "",
            ServerMessage::FileRefresh {
                room_id: room_id.to_string(),
                change: TreeChange::Created(entry.clone()),
            },
        );

        info!("Peer {} created {} in room {}", peer_id, path, room_id);
        Ok(ServerMessage::FileAdded {
            room_id: room_id.to_string(),
            entry,
        })
    }

    /// Delete a file, or a folder and its whole subtree, atomically. Live
    /// sessions under the deleted path are evicted so no stale flush can
    /// resurrect the content. Every member, requester included, gets the
    /// `FileRefresh`.
    pub fn file_delete(&self, peer_id: &str, room_id: &str, path: &str) -> SyncResult<()> {
        self.check_membership(peer_id, room_id)?;
        if path.trim().is_empty() {
            return Err(SyncError::Malformed("empty path".to_string()));
        }

        let removed = self.store.delete_cascade(room_id, path)?;
        let evicted = self.registry.evict_under(room_id, path);

        self.broadcast_to_room(
            room_id,
            "",
            ServerMessage::FileRefresh {
                room_id: room_id.to_string(),
                change: TreeChange::Deleted {
                    path: path.to_string(),
                },
            },
        );

        info!(
            "Peer {} deleted {} in room {} ({} records, {} sessions)",
            peer_id,
            path,
            room_id,
            removed.len(),
            evicted
        );
        Ok(())
    }

    /// Rename a file or folder, cascading to descendants. Live sessions under
    /// the old path are re-keyed, so in-flight edits follow the file. Every
    /// member, requester included, gets the `FileRefresh`.
    pub fn file_rename(
        &self,
        peer_id: &str,
        room_id: &str,
        old_path: &str,
        new_path: &str,
        new_name: &str,
    ) -> SyncResult<()> {
        self.check_membership(peer_id, room_id)?;
        if new_path.trim().is_empty() || new_name.trim().is_empty() {
            return Err(SyncError::Malformed("empty rename target".to_string()));
        }
        if old_path == new_path {
            return Err(SyncError::Malformed("rename to same path".to_string()));
        }

        self.store
            .rename_cascade(room_id, old_path, new_path, new_name)?;
        let moved = self.registry.rekey(room_id, old_path, new_path);

        self.broadcast_to_room(
            room_id,
            "",
            ServerMessage::FileRefresh {
                room_id: room_id.to_string(),
                change: TreeChange::Renamed {
                    old_path: old_path.to_string(),
                    new_path: new_path.to_string(),
                },
            },
        );

        info!(
            "Peer {} renamed {} -> {} in room {} ({} live sessions moved)",
            peer_id, old_path, new_path, room_id, moved
        );
        Ok(())
    }

    /// Broadcast a message to all members of a room. `exclude_peer` is
    /// skipped; pass an empty string to reach everyone.
    pub fn broadcast_to_room(&self, room_id: &str, exclude_peer: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            for member_id in room.member_ids() {
                if member_id != exclude_peer {
                    self.send_to_peer(&member_id, msg.clone());
                }
            }
        }
    }

    /// Send a message to a single peer, dropping it if the channel is gone
    pub fn send_to_peer(&self, peer_id: &str, msg: ServerMessage) {
        if let Some(peer) = self.peers.get(peer_id) {
            if peer.read().send(msg).is_err() {
                debug!("Dropping message for disconnected peer {}", peer_id);
            }
        }
    }

    /// Live member count for a room, zero if nobody is connected to it
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    fn check_membership(&self, peer_id: &str, room_id: &str) -> SyncResult<()> {
        let is_member = self
            .rooms
            .get(room_id)
            .map(|room| room.is_member(peer_id))
            .unwrap_or(false);
        if is_member {
            Ok(())
        } else {
            Err(SyncError::AccessDenied(room_id.to_string()))
        }
    }

    fn get_or_create_room(&self, room_id: &str) -> SyncResult<Arc<Room>> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(room.clone());
        }

        if self.store.get_room(room_id)?.is_none() {
            self.store.save_room(&RoomMeta::new(room_id, room_id))?;
        }

        let room = Arc::new(Room::new(room_id));
        self.rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    /// Reclaim idle document sessions and rooms nobody occupies.
    pub fn cleanup(&self) {
        let evicted = self.registry.evict_idle(self.config.idle_session_ttl);
        if evicted > 0 {
            debug!("Evicted {} idle document sessions", evicted);
        }

        // Empty rooms get a grace period before their live state is dropped;
        // the persisted metadata and files stay either way.
        let empty: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| {
                let room = entry.value();
                room.members.is_empty() && room.created_at.elapsed() > Duration::from_secs(300)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for room_id in empty {
            if let Some((_, room)) = self.rooms.remove(&room_id) {
                info!("Removed empty room: {}", room.room_id);
            }
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_rooms: self.rooms.len(),
            active_peers: self.peers.len(),
            live_sessions: self.registry.session_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Start the background cleanup loop
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup();
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_peers: usize,
    pub live_sessions: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.cleanup_task.await;
    }
}
