/// Synchronization protocol and server-side session management
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    AwarenessUpdate, AwarenessUserState, CollaborationConfig, CollaborationError,
    CollaborationSession, CollaborativeCursor, CrdtState, CrdtUpdate, DocumentId, EndReason,
    Operation, OperationId, Result, SessionConfig, SessionEvent, SessionId, SessionInfo,
    SessionStatus, Snapshot, UserId, VectorClock,
};

/// Message types exchanged between clients and the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Session membership
    #[serde(rename = "join")]
    Join {
        document_id: DocumentId,
        user_id: UserId,
        #[serde(default)]
        permissions: Option<Vec<String>>,
    },

    #[serde(rename = "joined")]
    Joined {
        session_id: SessionId,
        user_id: UserId,
        snapshot: Snapshot,
    },

    #[serde(rename = "leave")]
    Leave {
        document_id: DocumentId,
        user_id: UserId,
    },

    #[serde(rename = "left")]
    Left {
        document_id: DocumentId,
        user_id: UserId,
    },

    // Text operations
    #[serde(rename = "operation")]
    Operation { operation: Operation },

    #[serde(rename = "operation_ack")]
    OperationAck {
        operation_id: OperationId,
        version: u64,
    },

    /// Rebased operation as committed
    #[serde(rename = "committed")]
    Committed { operation: Operation, version: u64 },

    // Replicated state
    #[serde(rename = "crdt_update")]
    CrdtUpdate { update: CrdtUpdate },

    #[serde(rename = "crdt_merged")]
    CrdtMerged {
        document_id: DocumentId,
        key: String,
        state: CrdtState,
    },

    #[serde(rename = "crdt_state")]
    CrdtState {
        document_id: DocumentId,
        user_id: UserId,
        key: String,
        state: CrdtState,
    },

    // Awareness
    #[serde(rename = "cursor")]
    Cursor { cursor: CollaborativeCursor },

    #[serde(rename = "cursor_moved")]
    CursorMoved { cursor: CollaborativeCursor },

    #[serde(rename = "awareness")]
    Awareness {
        document_id: DocumentId,
        update: AwarenessUpdate,
    },

    #[serde(rename = "awareness_changed")]
    AwarenessChanged {
        document_id: DocumentId,
        state: AwarenessUserState,
    },

    // Edit lock
    #[serde(rename = "acquire_lock")]
    AcquireLock {
        document_id: DocumentId,
        user_id: UserId,
    },

    #[serde(rename = "release_lock")]
    ReleaseLock {
        document_id: DocumentId,
        user_id: UserId,
    },

    #[serde(rename = "lock")]
    Lock {
        document_id: DocumentId,
        holder: Option<UserId>,
    },

    // Catch-up
    #[serde(rename = "sync_request")]
    SyncRequest {
        document_id: DocumentId,
        since_version: u64,
    },

    #[serde(rename = "sync_response")]
    SyncResponse {
        document_id: DocumentId,
        operations: Vec<Operation>,
        version: u64,
        vector_clock: VectorClock,
    },

    #[serde(rename = "snapshot_request")]
    SnapshotRequest { document_id: DocumentId },

    #[serde(rename = "snapshot")]
    Snapshot { snapshot: Snapshot },

    // Lifecycle and audit
    #[serde(rename = "event")]
    Event { event: SessionEvent },

    // Error handling
    #[serde(rename = "error")]
    Error { code: String, message: String },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SyncMessage {
    /// User whose action produced this message, for echo suppression
    pub fn origin(&self) -> Option<&UserId> {
        match self {
            SyncMessage::Committed { operation, .. } => Some(&operation.user_id),
            SyncMessage::CrdtState { user_id, .. } => Some(user_id),
            SyncMessage::CursorMoved { cursor } => Some(&cursor.user_id),
            SyncMessage::AwarenessChanged { state, .. } => Some(&state.user_id),
            SyncMessage::Event { event } => match event {
                SessionEvent::UserJoined { user_id, .. }
                | SessionEvent::UserLeft { user_id, .. }
                | SessionEvent::UserUpdated { user_id, .. }
                | SessionEvent::OperationRejected { user_id, .. } => Some(user_id),
                SessionEvent::SessionCreated { .. } | SessionEvent::SessionEnded { .. } => None,
            },
            _ => None,
        }
    }
}

impl From<CollaborationError> for SyncMessage {
    fn from(err: CollaborationError) -> Self {
        SyncMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Server-side session manager
///
/// Sessions are keyed by document; the map is sharded so submissions to
/// different documents never contend.
pub struct SessionManager {
    config: CollaborationConfig,
    sessions: DashMap<DocumentId, Arc<CollaborationSession>>,
    by_id: DashMap<SessionId, DocumentId>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(config: CollaborationConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            sessions: DashMap::new(),
            by_id: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    /// Session lifecycle events across all documents
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session with the default session config
    pub fn create_session(&self, document_id: DocumentId) -> Result<Arc<CollaborationSession>> {
        self.create_session_with(document_id, self.config.session.clone())
    }

    pub fn create_session_with(
        &self,
        document_id: DocumentId,
        config: SessionConfig,
    ) -> Result<Arc<CollaborationSession>> {
        let session = CollaborationSession::new(document_id, config)?;
        self.register(session)
    }

    /// Resume a document from persisted state
    pub fn load_snapshot(&self, snapshot: Snapshot) -> Result<Arc<CollaborationSession>> {
        let session = CollaborationSession::resume(snapshot, self.config.session.clone())?;
        self.register(session)
    }

    fn register(&self, session: CollaborationSession) -> Result<Arc<CollaborationSession>> {
        let session = Arc::new(session);
        let document_id = session.document_id().clone();

        match self.sessions.entry(document_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().status() != SessionStatus::Ended {
                    return Err(CollaborationError::SessionExists(document_id));
                }
                self.by_id.remove(&entry.get().session_id());
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
        self.by_id.insert(session.session_id(), document_id.clone());

        self.emit(SessionEvent::SessionCreated {
            session_id: session.session_id(),
            document_id,
            mode: session.config().mode,
        });
        Ok(session)
    }

    pub fn get(&self, document_id: &DocumentId) -> Result<Arc<CollaborationSession>> {
        self.sessions
            .get(document_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollaborationError::SessionNotFound(document_id.to_string()))
    }

    pub fn get_by_id(&self, session_id: SessionId) -> Result<Arc<CollaborationSession>> {
        let document_id = self
            .by_id
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollaborationError::SessionNotFound(session_id.to_string()))?;
        self.get(&document_id)
    }

    fn get_or_create(&self, document_id: &DocumentId) -> Result<Arc<CollaborationSession>> {
        match self.get(document_id) {
            Ok(session) => Ok(session),
            Err(CollaborationError::SessionNotFound(_)) => {
                match self.create_session(document_id.clone()) {
                    // Lost a race with another join
                    Err(CollaborationError::SessionExists(_)) => self.get(document_id),
                    other => other,
                }
            }
            Err(err) => Err(err),
        }
    }

    /// End a session and hand back its final state for persistence
    pub async fn end_session(&self, document_id: &DocumentId) -> Result<Snapshot> {
        let session = self.get(document_id)?;
        let snapshot = session.get_snapshot().await?;
        if let Some(event) = session.end(EndReason::Closed) {
            self.emit(event);
        }
        self.remove(&session);
        Ok(snapshot)
    }

    fn remove(&self, session: &CollaborationSession) {
        let session_id = session.session_id();
        self.sessions
            .remove_if(session.document_id(), |_, current| {
                current.session_id() == session_id
            });
        self.by_id.remove(&session_id);
    }

    /// Run presence and lifecycle timers; ended sessions are dropped
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut events = Vec::new();
        for session in sessions {
            let session_events = session.sweep(now);
            for event in &session_events {
                if matches!(event, SessionEvent::SessionEnded { .. }) {
                    self.emit(event.clone());
                }
            }
            events.extend(session_events);

            if session.status() == SessionStatus::Ended {
                self.remove(&session);
            }
        }
        events
    }

    /// Periodically sweep on the runtime until the manager is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let events = manager.sweep(Utc::now());
                if !events.is_empty() {
                    debug!(count = events.len(), "Sweep produced events");
                }
            }
        })
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        infos
    }

    /// Current state of every live session
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.get_snapshot().await?);
        }
        snapshots.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(snapshots)
    }

    /// Handle one inbound message and produce the direct reply
    ///
    /// Failures come back as `SyncMessage::Error`; broadcasts to other
    /// participants go out on the session channel.
    pub async fn handle_message(&self, message: SyncMessage) -> SyncMessage {
        match self.dispatch(message).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(code = err.code(), error = %err, "Request failed");
                err.into()
            }
        }
    }

    async fn dispatch(&self, message: SyncMessage) -> Result<SyncMessage> {
        match message {
            SyncMessage::Join {
                document_id,
                user_id,
                permissions,
            } => {
                let session = self.get_or_create(&document_id)?;
                let mut state = AwarenessUserState::new(user_id, session.session_id());
                state.current_document = Some(document_id);
                state.permissions = permissions;
                let state = session.join_session(state)?;

                Ok(SyncMessage::Joined {
                    session_id: session.session_id(),
                    user_id: state.user_id,
                    snapshot: session.get_snapshot().await?,
                })
            }

            SyncMessage::Leave {
                document_id,
                user_id,
            } => {
                self.get(&document_id)?.leave_session(&user_id)?;
                Ok(SyncMessage::Left {
                    document_id,
                    user_id,
                })
            }

            SyncMessage::Operation { operation } => {
                let session = self.get(&operation.document_id)?;
                let committed = session.submit_operation(operation).await?;
                Ok(SyncMessage::OperationAck {
                    operation_id: committed.operation_id,
                    version: committed.base_version + 1,
                })
            }

            SyncMessage::CrdtUpdate { update } => {
                let session = self.get(&update.document_id)?;
                let document_id = update.document_id.clone();
                let key = update.key.clone();
                let state = session.submit_crdt_update(update)?;
                Ok(SyncMessage::CrdtMerged {
                    document_id,
                    key,
                    state,
                })
            }

            SyncMessage::Cursor { cursor } => {
                let cursor = self.get(&cursor.document_id)?.update_cursor(cursor)?;
                Ok(SyncMessage::CursorMoved { cursor })
            }

            SyncMessage::Awareness {
                document_id,
                update,
            } => {
                let state = self.get(&document_id)?.update_awareness(update)?;
                Ok(SyncMessage::AwarenessChanged { document_id, state })
            }

            SyncMessage::AcquireLock {
                document_id,
                user_id,
            } => {
                let session = self.get(&document_id)?;
                session.acquire_edit_lock(&user_id)?;
                Ok(SyncMessage::Lock {
                    document_id,
                    holder: session.lock_holder(),
                })
            }

            SyncMessage::ReleaseLock {
                document_id,
                user_id,
            } => {
                let session = self.get(&document_id)?;
                session.release_edit_lock(&user_id)?;
                Ok(SyncMessage::Lock {
                    document_id,
                    holder: session.lock_holder(),
                })
            }

            SyncMessage::SyncRequest {
                document_id,
                since_version,
            } => {
                let session = self.get(&document_id)?;
                let (operations, version) = session.operations_since(since_version).await?;
                Ok(SyncMessage::SyncResponse {
                    document_id,
                    operations,
                    version,
                    vector_clock: session.vector_clock(),
                })
            }

            SyncMessage::SnapshotRequest { document_id } => Ok(SyncMessage::Snapshot {
                snapshot: self.get(&document_id)?.get_snapshot().await?,
            }),

            SyncMessage::Ping => Ok(SyncMessage::Pong),

            other => Err(CollaborationError::InvalidOperation(format!(
                "unexpected inbound message: {}",
                serde_json::to_value(&other)?["type"]
            ))),
        }
    }

    fn emit(&self, event: SessionEvent) {
        info!(event = event.name(), "Session lifecycle event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(CollaborationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Component, OperationBuilder};
    use chrono::Duration;

    fn join(document: &str, user: &str) -> SyncMessage {
        SyncMessage::Join {
            document_id: DocumentId::from(document),
            user_id: UserId::from(user),
            permissions: None,
        }
    }

    #[tokio::test]
    async fn test_session_creation() {
        let manager = SessionManager::default();
        let mut events = manager.subscribe_events();
        let document_id = DocumentId::from("doc");

        let session = manager.create_session(document_id.clone()).unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SessionCreated { .. })
        ));

        // Try creating again - should fail
        let result = manager.create_session(document_id.clone());
        assert_eq!(
            result.err(),
            Some(CollaborationError::SessionExists(document_id.clone()))
        );

        assert_eq!(
            manager.get_by_id(session.session_id()).unwrap().session_id(),
            session.session_id()
        );
    }

    #[tokio::test]
    async fn test_join_creates_session() {
        let manager = SessionManager::default();

        let reply = manager.handle_message(join("doc", "alice")).await;
        match reply {
            SyncMessage::Joined {
                user_id, snapshot, ..
            } => {
                assert_eq!(user_id, UserId::from("alice"));
                assert_eq!(snapshot.version, 0);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let infos = manager.sessions();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].user_count, 1);
    }

    #[tokio::test]
    async fn test_operation_round_trip() {
        let manager = SessionManager::default();
        manager.handle_message(join("doc", "alice")).await;
        let session = manager.get(&DocumentId::from("doc")).unwrap();
        let mut rx = session.subscribe();

        let operation = Operation::new(
            DocumentId::from("doc"),
            UserId::from("alice"),
            session.session_id(),
            0,
            vec![Component::insert("hi")],
        );
        let operation_id = operation.operation_id;

        let reply = manager
            .handle_message(SyncMessage::Operation { operation })
            .await;
        assert_eq!(
            reply,
            SyncMessage::OperationAck {
                operation_id,
                version: 1
            }
        );

        // Broadcast carries the author for echo suppression
        let broadcast = rx.try_recv().unwrap();
        assert_eq!(broadcast.origin(), Some(&UserId::from("alice")));

        let reply = manager
            .handle_message(SyncMessage::SyncRequest {
                document_id: DocumentId::from("doc"),
                since_version: 0,
            })
            .await;
        match reply {
            SyncMessage::SyncResponse {
                operations,
                version,
                vector_clock,
                ..
            } => {
                assert_eq!(operations.len(), 1);
                assert_eq!(version, 1);
                assert_eq!(vector_clock.get(&"alice".into()), 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errors_become_replies() {
        let manager = SessionManager::default();

        let reply = manager
            .handle_message(SyncMessage::SnapshotRequest {
                document_id: DocumentId::from("missing"),
            })
            .await;
        assert!(matches!(
            reply,
            SyncMessage::Error { ref code, .. } if code == "session_not_found"
        ));

        let reply = manager.handle_message(SyncMessage::Pong).await;
        assert!(matches!(
            reply,
            SyncMessage::Error { ref code, .. } if code == "invalid_operation"
        ));

        assert_eq!(manager.handle_message(SyncMessage::Ping).await, SyncMessage::Pong);
    }

    #[tokio::test]
    async fn test_end_session_returns_final_state() {
        let manager = SessionManager::default();
        manager.handle_message(join("doc", "alice")).await;
        let session = manager.get(&DocumentId::from("doc")).unwrap();
        session
            .submit_operation(Operation::new(
                DocumentId::from("doc"),
                UserId::from("alice"),
                session.session_id(),
                0,
                OperationBuilder::new().insert("done").build(),
            ))
            .await
            .unwrap();

        let snapshot = manager.end_session(&DocumentId::from("doc")).await.unwrap();
        assert_eq!(snapshot.text(), "done");
        assert_eq!(session.status(), SessionStatus::Ended);
        assert!(manager.get(&DocumentId::from("doc")).is_err());
        assert!(manager.get_by_id(session.session_id()).is_err());

        // The document can be reopened from its snapshot
        let resumed = manager.load_snapshot(snapshot).unwrap();
        assert_eq!(resumed.version(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_ended_sessions() {
        let manager = SessionManager::default();
        manager.create_session(DocumentId::from("quiet")).unwrap();

        let events = manager.sweep(Utc::now() + Duration::seconds(600));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionEnded { .. })));
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_with_manager() {
        let mut config = CollaborationConfig::default();
        config.sweep_interval_ms = 10;
        let manager = Arc::new(SessionManager::new(config));

        let handle = manager.spawn_sweeper();
        drop(manager);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(SyncMessage::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping"}));

        let message: SyncMessage = serde_json::from_str(
            r#"{"type": "sync_request", "document_id": "doc", "since_version": 3}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            SyncMessage::SyncRequest {
                document_id: DocumentId::from("doc"),
                since_version: 3
            }
        );
    }
}
