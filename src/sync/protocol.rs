//! Binary WebSocket protocol for room and document synchronization.
//!
//! Every payload that can arrive over the wire is a tagged variant with an
//! explicit schema, decoded and validated at the connection boundary before it
//! reaches any other component. Messages are framed as
//! `[version u8][type u8][len u24][bincode payload]`; document updates travel
//! as opaque CRDT bytes inside the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::{PeerId, RoomId};
use crate::store::{FileKind, FileRecord};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Welcome = 0x01,
    Error = 0x02,

    // Rooms
    JoinRoom = 0x10,
    RoomJoined = 0x11,

    // File tree
    ListFiles = 0x20,
    FileList = 0x21,
    FileAdd = 0x22,
    FileAdded = 0x23,
    FileDelete = 0x24,
    FileRename = 0x25,
    FileRefresh = 0x26,

    // Documents (binary CRDT payloads)
    DocInit = 0x30,
    DocReady = 0x31,
    DocUpdate = 0x32,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Welcome),
            0x02 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::JoinRoom),
            0x11 => Ok(MessageType::RoomJoined),
            0x20 => Ok(MessageType::ListFiles),
            0x21 => Ok(MessageType::FileList),
            0x22 => Ok(MessageType::FileAdd),
            0x23 => Ok(MessageType::FileAdded),
            0x24 => Ok(MessageType::FileDelete),
            0x25 => Ok(MessageType::FileRename),
            0x26 => Ok(MessageType::FileRefresh),
            0x30 => Ok(MessageType::DocInit),
            0x31 => Ok(MessageType::DocReady),
            0x32 => Ok(MessageType::DocUpdate),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Error classification reported to the requesting connection. Failed
/// operations never broadcast anything to other room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Membership check failed
    AccessDenied,
    /// Operation on a nonexistent path or room
    NotFound,
    /// Structural collision on a path
    AlreadyExists,
    /// Database operation failed
    StorageFailure,
    /// Payload could not be decoded
    DecodeFailure,
    /// Payload decoded fine but failed validation
    InvalidRequest,
}

///// A file record as shipped to clients: content is never included in tree
/// listings, only through document sessions or the raw-content endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub parent: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&FileRecord> for FileEntry {
    fn from(record: &FileRecord) -> Self {
        Self {
            name: record.name.clone(),
            path: record.path.clone(),
            kind: record.kind,
            parent: record.parent.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Structural delta carried by a `FileRefresh` broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeChange {
    Created(FileEntry),
    Deleted { path: String },
    Renamed { old_path: String, new_path: String },
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a room; membership is required for every other operation
    JoinRoom {
        room_id: RoomId,
    },

    /// Request the room's file tree (content omitted)
    ListFiles {
        room_id: RoomId,
    },

    /// Open a document session for a file, requesting the full snapshot
    DocInit {
        room_id: RoomId,
        path: String,
    },

    /// Incremental CRDT update produced by the client's local document
    DocUpdate {
        room_id: RoomId,
        path: String,
        update: Vec<u8>,
    },

    /// Create a file or folder
    FileAdd {
        room_id: RoomId,
        name: String,
        path: String,
        kind: FileKind,
        parent: Option<String>,
    },

    /// Delete a file, or a folder and its entire subtree
    FileDelete {
        room_id: RoomId,
        path: String,
    },

    /// Rename a file or folder, cascading to descendants
    FileRename {
        room_id: RoomId,
        old_path: String,
        new_path: String,
        new_name: String,
    },

    /// Ping for keepalive
    Ping {
        timestamp: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent once on connect with the assigned peer ID
    Welcome {
        protocol_version: u8,
        peer_id: PeerId,
        server_time: i64,
    },

    /// Error response, delivered only to the requester
    Error {
        kind: ErrorKind,
        message: String,
        room_id: Option<RoomId>,
    },

    /// Acknowledgement of a room join
    RoomJoined {
        room_id: RoomId,
    },

    /// Current file tree, ordered by parent then name
    FileList {
        room_id: RoomId,
        files: Vec<FileEntry>,
    },

    /// Full CRDT snapshot for bootstrapping a document session
    DocReady {
        room_id: RoomId,
        path: String,
        state: Vec<u8>,
    },

    /// Relayed CRDT update from another subscriber of the same document
    DocUpdate {
        room_id: RoomId,
        path: String,
        update: Vec<u8>,
        from_peer: PeerId,
    },

    /// Acknowledgement to the requester of a successful add
    FileAdded {
        room_id: RoomId,
        entry: FileEntry,
    },

    /// Structural refresh broadcast to every room member
    FileRefresh {
        room_id: RoomId,
        change: TreeChange,
    },

    /// Pong response
    Pong {
        timestamp: u64,
        server_time: i64,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>, room_id: Option<RoomId>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
            room_id,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct WireCodec;

impl WireCodec {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::JoinRoom { .. } => MessageType::JoinRoom,
            ClientMessage::ListFiles { .. } => MessageType::ListFiles,
            ClientMessage::DocInit { .. } => MessageType::DocInit,
            ClientMessage::DocUpdate { .. } => MessageType::DocUpdate,
            ClientMessage::FileAdd { .. } => MessageType::FileAdd,
            ClientMessage::FileDelete { .. } => MessageType::FileDelete,
            ClientMessage::FileRename { .. } => MessageType::FileRename,
            ClientMessage::Ping { .. } => MessageType::Ping,
        };

        let payload = bincode::serialize(msg)?;
        Self::frame(msg_type, payload)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::RoomJoined { .. } => MessageType::RoomJoined,
            ServerMessage::FileList { .. } => MessageType::FileList,
            ServerMessage::DocReady { .. } => MessageType::DocReady,
            ServerMessage::DocUpdate { .. } => MessageType::DocUpdate,
            ServerMessage::FileAdded { .. } => MessageType::FileAdded,
            ServerMessage::FileRefresh { .. } => MessageType::FileRefresh,
            ServerMessage::Pong { .. } => MessageType::Pong,
        };

        let payload = bincode::serialize(msg)?;
        Self::frame(msg_type, payload)
    }

    fn frame(msg_type: MessageType, payload: Vec<u8>) -> Result<Bytes, ProtocolError> {
        if payload.len() + 5 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + 5,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let payload = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let payload = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        Ok(msg)
    }

    fn unframe(data: &[u8]) -> Result<&[u8], ProtocolError> {
        if data.len() < 5 {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = cursor.get_u8();
        MessageType::try_from(msg_type)?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < 5 + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                5 + payload_len,
                data.len()
            )));
        }

        Ok(&data[5..5 + payload_len])
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
