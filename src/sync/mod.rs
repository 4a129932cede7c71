//! Synchronization module for CRDT-based real-time collaboration.
//!
//! This module owns the live side of the server:
//! - Tagged binary wire protocol between clients and the server
//! - Per-file CRDT document sessions with debounced persistence
//! - Room membership gating and file-tree mutation coordination

pub mod protocol;
pub mod server;
pub mod session;

pub use server::{CollabServer, ServerConfig};
pub use session::SessionRegistry;

use crate::store::StoreError;
use protocol::ErrorKind;
use thiserror::Error;

/// Unique identifier for a room
pub type RoomId = String;

/// Unique identifier for a connected peer
pub type PeerId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while handling a client operation. Every variant is
/// non-fatal and is reported only to the requesting connection.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Access denied: not a member of room {0}")]
    AccessDenied(RoomId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Connection closed for peer {0}")]
    ConnectionClosed(PeerId),
}

impl SyncError {
    /// Wire-level error classification for the requester
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::AccessDenied(_) => ErrorKind::AccessDenied,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::Malformed(_) => ErrorKind::InvalidRequest,
            SyncError::Storage(_) => ErrorKind::StorageFailure,
            SyncError::ConnectionClosed(_) => ErrorKind::StorageFailure,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => SyncError::NotFound(path),
            StoreError::AlreadyExists(path) => SyncError::AlreadyExists(path),
            StoreError::InvalidParent(msg) => SyncError::Malformed(msg),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            SyncError::AccessDenied("r1".into()).kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            SyncError::from(StoreError::NotFound("x".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SyncError::from(StoreError::AlreadyExists("x".into())).kind(),
            ErrorKind::AlreadyExists
        );
        // Requests that decode fine but fail validation are not decode errors.
        assert_eq!(
            SyncError::Malformed("bad".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            SyncError::from(StoreError::InvalidParent("x".into())).kind(),
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::AccessDenied("room-9".into());
        assert_eq!(err.to_string(), "Access denied: not a member of room room-9");
    }
}
