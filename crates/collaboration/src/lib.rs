//! Collaborative document synchronization core
//! Operational transformation for text, CRDT merges for shared state, and the
//! per-document sequencer that ties them together
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod clock;
pub use clock::*;

mod operations;
pub use operations::*;

mod transform;
pub use transform::*;

pub mod crdt;
pub use crdt::{CrdtState, CrdtUpdate};

mod config;
pub use config::*;

mod events;
pub use events::*;

mod presence;
pub use presence::*;

mod snapshot;
pub use snapshot::*;

mod session;
pub use session::*;

mod sync;
pub use sync::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaborationError {
    #[error("operation references future version {base_version} (current {current_version})")]
    FutureVersion {
        base_version: u64,
        current_version: u64,
    },

    #[error("base version {base_version} is older than retained window floor {floor}")]
    StaleVersion { base_version: u64, floor: u64 },

    #[error("operation expects document length {expected}, found {actual}")]
    VersionMismatch { expected: usize, actual: usize },

    #[error("sequencer busy for document {0}")]
    SequencerBusy(DocumentId),

    #[error("cannot merge {left} state with {right} state")]
    CrdtTypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("session ended: {0}")]
    SessionEnded(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already active for document {0}")]
    SessionExists(DocumentId),

    #[error("session full ({0} users)")]
    SessionFull(usize),

    #[error("user {0} is not in the session")]
    UserNotInSession(UserId),

    #[error("operation {0} was already applied")]
    DuplicateOperation(OperationId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("document mismatch: {left} vs {right}")]
    DocumentMismatch { left: DocumentId, right: DocumentId },

    #[error("{0} not supported in {1} mode")]
    ModeNotSupported(&'static str, CollaborationMode),

    #[error("edit lock held by {0}")]
    LockHeld(UserId),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CollaborationError {
    /// Stable machine-readable code sent back to clients
    pub fn code(&self) -> &'static str {
        match self {
            CollaborationError::FutureVersion { .. } => "future_version",
            CollaborationError::StaleVersion { .. } => "stale_version",
            CollaborationError::VersionMismatch { .. } => "version_mismatch",
            CollaborationError::SequencerBusy(_) => "sequencer_busy",
            CollaborationError::CrdtTypeMismatch { .. } => "crdt_type_mismatch",
            CollaborationError::SessionEnded(_) => "session_ended",
            CollaborationError::SessionNotFound(_) => "session_not_found",
            CollaborationError::SessionExists(_) => "session_exists",
            CollaborationError::SessionFull(_) => "session_full",
            CollaborationError::UserNotInSession(_) => "user_not_in_session",
            CollaborationError::DuplicateOperation(_) => "duplicate_operation",
            CollaborationError::InvalidOperation(_) => "invalid_operation",
            CollaborationError::DocumentMismatch { .. } => "document_mismatch",
            CollaborationError::ModeNotSupported(..) => "mode_not_supported",
            CollaborationError::LockHeld(_) => "lock_held",
            CollaborationError::Serialization(_) => "serialization",
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaborationError::FutureVersion { .. }
                | CollaborationError::SequencerBusy(_)
                | CollaborationError::LockHeld(_)
        )
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        CollaborationError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier, as issued by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier for collaborative editing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Document identifier; one active session per document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a CRDT replica (usually one per connected client)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
