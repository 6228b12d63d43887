/// User presence tracking for collaborative editing
/// Shows where users are working, what they have selected and whether they
/// are still around. Entries are last-write-wins and stamped on receipt.
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    transform_index, CollaborationError, DocumentId, Operation, Result, SessionConfig,
    SessionEvent, SessionId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
    Viewing,
    Disconnected,
}

/// Selection range; `anchor` stays put while `head` follows the caret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// How other clients should draw a user's cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorStyle {
    /// `#RRGGBB`
    pub color: String,
    pub label: Option<String>,
}

impl CursorStyle {
    /// Deterministic color derived from the user ID
    pub fn for_user(user_id: &UserId) -> Self {
        let hash = user_id
            .0
            .bytes()
            .fold(0x811c_9dc5_u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
        let [_, r, g, b] = hash.to_be_bytes();
        Self {
            color: format!("#{:02X}{:02X}{:02X}", r, g, b),
            label: None,
        }
    }
}

/// A user's caret in one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeCursor {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub position: usize,
    pub selection: Option<Selection>,
    pub style: CursorStyle,
    pub is_typing: bool,

    /// Receipt time, overwritten by the tracker
    pub last_update: DateTime<Utc>,
}

impl CollaborativeCursor {
    pub fn new(
        user_id: UserId,
        session_id: SessionId,
        document_id: DocumentId,
        position: usize,
    ) -> Self {
        let style = CursorStyle::for_user(&user_id);
        Self {
            user_id,
            session_id,
            document_id,
            position,
            selection: None,
            style,
            is_typing: false,
            last_update: Utc::now(),
        }
    }
}

/// User's current state in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUserState {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub status: PresenceStatus,
    pub current_document: Option<DocumentId>,
    pub last_activity: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
    pub permissions: Option<Vec<String>>,
}

impl AwarenessUserState {
    pub fn new(user_id: UserId, session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            session_id,
            status: PresenceStatus::Active,
            current_document: None,
            last_activity: now,
            joined_at: now,
            permissions: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status != PresenceStatus::Disconnected
    }
}

/// Partial awareness change sent by a client; absent fields are kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub user_id: UserId,
    #[serde(default)]
    pub status: Option<PresenceStatus>,
    #[serde(default)]
    pub current_document: Option<DocumentId>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
}

/// Presence and cursors for one session
///
/// Never touches the document sequencer; every method only locks the
/// individual map shards it reads or writes.
#[derive(Debug)]
pub struct AwarenessTracker {
    session_id: SessionId,
    users: DashMap<UserId, AwarenessUserState>,
    cursors: DashMap<(UserId, DocumentId), CollaborativeCursor>,
    idle_after: Duration,
    disconnect_after: Duration,
}

impl AwarenessTracker {
    pub fn new(session_id: SessionId, config: &SessionConfig) -> Self {
        Self {
            session_id,
            users: DashMap::new(),
            cursors: DashMap::new(),
            idle_after: config.presence_idle_delta(),
            disconnect_after: config.presence_disconnect_delta(),
        }
    }

    /// Register (or reconnect) a user as active
    pub fn join(&self, mut state: AwarenessUserState) -> AwarenessUserState {
        let now = Utc::now();
        state.session_id = self.session_id;
        state.status = PresenceStatus::Active;
        state.last_activity = now;
        if let Some(previous) = self.users.get(&state.user_id) {
            state.joined_at = previous.joined_at;
        }
        self.users.insert(state.user_id.clone(), state.clone());
        state
    }

    /// Forget a user and their cursors
    pub fn leave(&self, user_id: &UserId) -> Option<AwarenessUserState> {
        self.drop_cursors(user_id);
        self.users.remove(user_id).map(|(_, state)| state)
    }

    /// Mark a user disconnected, keeping their state for a later rejoin
    pub fn disconnect(&self, user_id: &UserId) -> Option<SessionEvent> {
        let mut state = self.users.get_mut(user_id)?;
        if !state.is_connected() {
            return None;
        }
        state.status = PresenceStatus::Disconnected;
        drop(state);

        self.drop_cursors(user_id);
        Some(SessionEvent::UserLeft {
            session_id: self.session_id,
            user_id: user_id.clone(),
        })
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.users
            .get(user_id)
            .map(|state| state.is_connected())
            .unwrap_or(false)
    }

    /// Count of users not disconnected
    pub fn member_count(&self) -> usize {
        self.users.iter().filter(|s| s.is_connected()).count()
    }

    /// Replace a user's cursor in one document
    pub fn update_cursor(&self, mut cursor: CollaborativeCursor) -> Result<CollaborativeCursor> {
        let now = Utc::now();
        self.touch(&cursor.user_id, now)?;

        cursor.session_id = self.session_id;
        cursor.last_update = now;
        self.cursors.insert(
            (cursor.user_id.clone(), cursor.document_id.clone()),
            cursor.clone(),
        );
        Ok(cursor)
    }

    /// Apply a partial awareness change
    pub fn update_awareness(&self, update: AwarenessUpdate) -> Result<AwarenessUserState> {
        let not_member = || CollaborationError::UserNotInSession(update.user_id.clone());

        // Disconnecting goes through `disconnect` so cursors are dropped
        if update.status == Some(PresenceStatus::Disconnected) {
            self.disconnect(&update.user_id).ok_or_else(not_member)?;
            return self.user(&update.user_id).ok_or_else(not_member);
        }

        let mut state = self
            .users
            .get_mut(&update.user_id)
            .filter(|state| state.is_connected())
            .ok_or_else(not_member)?;

        state.last_activity = Utc::now();
        state.status = update.status.unwrap_or(PresenceStatus::Active);
        if update.current_document.is_some() {
            state.current_document = update.current_document.clone();
        }
        if update.permissions.is_some() {
            state.permissions = update.permissions.clone();
        }
        Ok(state.clone())
    }

    /// Record activity from a member, waking them if idle
    pub fn touch(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self
            .users
            .get_mut(user_id)
            .filter(|state| state.is_connected())
            .ok_or_else(|| CollaborationError::UserNotInSession(user_id.clone()))?;
        state.last_activity = now;
        if state.status == PresenceStatus::Idle {
            state.status = PresenceStatus::Active;
        }
        Ok(())
    }

    /// Age out inactive users
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let mut disconnected = Vec::new();

        for mut entry in self.users.iter_mut() {
            let state = entry.value_mut();
            if !state.is_connected() {
                continue;
            }

            let inactive = now - state.last_activity;
            if inactive >= self.disconnect_after {
                state.status = PresenceStatus::Disconnected;
                disconnected.push(state.user_id.clone());
                events.push(SessionEvent::UserLeft {
                    session_id: self.session_id,
                    user_id: state.user_id.clone(),
                });
            } else if inactive >= self.idle_after && state.status != PresenceStatus::Idle {
                state.status = PresenceStatus::Idle;
                events.push(SessionEvent::UserUpdated {
                    session_id: self.session_id,
                    user_id: state.user_id.clone(),
                    status: PresenceStatus::Idle,
                });
            }
        }

        for user_id in &disconnected {
            self.drop_cursors(user_id);
        }
        events
    }

    /// Shift every other user's cursor in `op`'s document through `op`
    pub fn rebase_cursors(&self, op: &Operation) {
        for mut entry in self.cursors.iter_mut() {
            let cursor = entry.value_mut();
            if cursor.document_id != op.document_id || cursor.user_id == op.user_id {
                continue;
            }
            cursor.position = transform_index(op, cursor.position, true);
            if let Some(selection) = cursor.selection.as_mut() {
                selection.anchor = transform_index(op, selection.anchor, true);
                selection.head = transform_index(op, selection.head, true);
            }
        }
    }

    pub fn user(&self, user_id: &UserId) -> Option<AwarenessUserState> {
        self.users.get(user_id).map(|s| s.clone())
    }

    pub fn users(&self) -> Vec<AwarenessUserState> {
        let mut users: Vec<_> = self.users.iter().map(|s| s.clone()).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn cursor(&self, user_id: &UserId, document_id: &DocumentId) -> Option<CollaborativeCursor> {
        self.cursors
            .get(&(user_id.clone(), document_id.clone()))
            .map(|c| c.clone())
    }

    pub fn cursors(&self) -> Vec<CollaborativeCursor> {
        let mut cursors: Vec<_> = self.cursors.iter().map(|c| c.clone()).collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    fn drop_cursors(&self, user_id: &UserId) {
        self.cursors.retain(|(owner, _), _| owner != user_id);
    }
}
