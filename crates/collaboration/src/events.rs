/// Lifecycle and audit events published by sessions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CollaborationMode, DocumentId, PresenceStatus, SessionId, UserId};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Closed,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: SessionId,
        document_id: DocumentId,
        mode: CollaborationMode,
    },

    #[serde(rename = "session.ended")]
    SessionEnded {
        session_id: SessionId,
        document_id: DocumentId,
        reason: EndReason,
    },

    #[serde(rename = "user.joined")]
    UserJoined {
        session_id: SessionId,
        user_id: UserId,
    },

    #[serde(rename = "user.left")]
    UserLeft {
        session_id: SessionId,
        user_id: UserId,
    },

    /// Presence status changed
    #[serde(rename = "user.updated")]
    UserUpdated {
        session_id: SessionId,
        user_id: UserId,
        status: PresenceStatus,
    },

    /// Audit record for a refused submission
    #[serde(rename = "operation.rejected")]
    OperationRejected {
        session_id: SessionId,
        document_id: DocumentId,
        user_id: UserId,
        code: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session.created",
            SessionEvent::SessionEnded { .. } => "session.ended",
            SessionEvent::UserJoined { .. } => "user.joined",
            SessionEvent::UserLeft { .. } => "user.left",
            SessionEvent::UserUpdated { .. } => "user.updated",
            SessionEvent::OperationRejected { .. } => "operation.rejected",
        }
    }
}
