/// Per-document collaboration session
/// Owns the authoritative version, the retained operation window, the keyed
/// CRDT store and the awareness tracker for one document.
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{vec_deque, BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    AwarenessTracker, AwarenessUpdate, AwarenessUserState, ClockService, CollaborationError,
    CollaborationMode, CollaborativeCursor, CrdtState, CrdtUpdate, Document, DocumentId,
    EndReason, Operation, OperationId, ReplicaId, Result, SessionConfig, SessionEvent, SessionId,
    Snapshot, SyncMessage, Transformer, UserId, VectorClock,
};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

/// Single-writer core of a session: version, retained window and content
///
/// `window[i]` is the operation committed at version `floor + i`, already
/// rebased onto that version.
#[derive(Debug)]
pub struct Sequencer {
    version: u64,
    floor: u64,
    window: VecDeque<Operation>,
    committed: HashSet<OperationId>,
    document: Document,
    max_retained: usize,
    transformer: Transformer,
}

impl Sequencer {
    pub fn new(
        document: Document,
        version: u64,
        max_retained: usize,
        transformer: Transformer,
    ) -> Self {
        Self {
            version,
            floor: version,
            window: VecDeque::new(),
            committed: HashSet::new(),
            document,
            max_retained: max_retained.max(1),
            transformer,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Oldest base version that can still be rebased
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Operations committed at or after `base_version`
    pub fn since(&self, base_version: u64) -> Result<vec_deque::Iter<'_, Operation>> {
        if base_version > self.version {
            return Err(CollaborationError::FutureVersion {
                base_version,
                current_version: self.version,
            });
        }
        if base_version < self.floor {
            return Err(CollaborationError::StaleVersion {
                base_version,
                floor: self.floor,
            });
        }
        Ok(self.window.range((base_version - self.floor) as usize..))
    }

    /// Rebase, apply and record `op`; nothing changes on error
    pub fn commit(&mut self, op: &Operation) -> Result<Operation> {
        op.validate()?;

        let rebased = {
            let applied = self.since(op.base_version)?;
            if self.committed.contains(&op.operation_id) {
                return Err(CollaborationError::DuplicateOperation(op.operation_id));
            }
            self.transformer.rebase(op, applied)?
        };
        self.document = self.document.apply(&rebased)?;

        self.version += 1;
        self.committed.insert(rebased.operation_id);
        self.window.push_back(rebased.clone());
        while self.window.len() > self.max_retained {
            if let Some(evicted) = self.window.pop_front() {
                self.committed.remove(&evicted.operation_id);
                self.floor += 1;
            }
        }

        Ok(rebased)
    }
}

#[derive(Debug)]
struct Lifecycle {
    status: SessionStatus,
    last_activity: DateTime<Utc>,
}

/// Snapshot of session metadata for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub mode: CollaborationMode,
    pub status: SessionStatus,
    pub version: u64,
    pub user_count: usize,
    pub crdt_keys: usize,
    pub lock_holder: Option<UserId>,
}

/// One live document
pub struct CollaborationSession {
    session_id: SessionId,
    document_id: DocumentId,
    config: SessionConfig,
    sequencer: AsyncMutex<Sequencer>,

    /// Last committed version, readable without the sequencer
    version: AtomicU64,

    crdt_store: DashMap<String, CrdtState>,
    awareness: AwarenessTracker,
    clocks: Mutex<ClockService>,
    lifecycle: RwLock<Lifecycle>,
    lock_holder: Mutex<Option<UserId>>,
    tx: broadcast::Sender<SyncMessage>,
}

impl CollaborationSession {
    pub fn new(document_id: DocumentId, config: SessionConfig) -> Result<Self> {
        Self::resume(Snapshot::empty(document_id), config)
    }

    /// Session positioned at a snapshot's version with an empty window
    pub fn resume(snapshot: Snapshot, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let session_id = SessionId::new();
        let transformer = Transformer::new(config.conflict_resolution);
        let sequencer = Sequencer::new(
            snapshot.content,
            snapshot.version,
            config.max_retained_operations,
            transformer,
        );

        let mut clocks = ClockService::new();
        for (key, state) in &snapshot.crdt_states {
            if let CrdtState::Text(text) = state {
                if text.document_id != snapshot.document_id {
                    return Err(CollaborationError::DocumentMismatch {
                        left: snapshot.document_id.clone(),
                        right: text.document_id.clone(),
                    });
                }
            }
            observe_state(&mut clocks, state);
            debug!(key = %key, kind = state.kind(), "Restored CRDT state");
        }

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let session = Self {
            session_id,
            awareness: AwarenessTracker::new(session_id, &config),
            document_id: snapshot.document_id,
            version: AtomicU64::new(snapshot.version),
            sequencer: AsyncMutex::new(sequencer),
            crdt_store: snapshot.crdt_states.into_iter().collect(),
            clocks: Mutex::new(clocks),
            lifecycle: RwLock::new(Lifecycle {
                status: SessionStatus::Active,
                last_activity: Utc::now(),
            }),
            lock_holder: Mutex::new(None),
            config,
            tx,
        };

        info!(
            session_id = %session.session_id,
            document_id = %session.document_id,
            mode = %session.config.mode,
            version = snapshot.version,
            "Collaboration session started"
        );
        Ok(session)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.lifecycle.read().status
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.clocks.lock().vector().clone()
    }

    /// Receive everything this session broadcasts
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }

    /// Sequence a text operation
    ///
    /// Returns the operation rebased onto the version it was committed at.
    /// The same value is broadcast to every subscriber. `op.session_id` is
    /// carried through untouched and not checked against this session.
    pub async fn submit_operation(&self, op: Operation) -> Result<Operation> {
        self.ensure_open()?;
        if !self.config.mode.accepts_operations() {
            return Err(CollaborationError::ModeNotSupported(
                "operations",
                self.config.mode,
            ));
        }
        self.check_document(&op.document_id)?;
        self.check_member(&op.user_id)?;
        if self.config.mode == CollaborationMode::Lock {
            match self.lock_holder.lock().as_ref() {
                Some(holder) if holder == &op.user_id => {}
                Some(holder) => return Err(CollaborationError::LockHeld(holder.clone())),
                None => {
                    return Err(CollaborationError::InvalidOperation(
                        "edit lock must be acquired before editing".to_string(),
                    ))
                }
            }
        }

        let mut sequencer = self.acquire_sequencer().await?;
        // The session may have ended while we waited
        self.ensure_open()?;

        let rebased = match sequencer.commit(&op) {
            Ok(rebased) => rebased,
            Err(err) => {
                self.reject(&op.user_id, &err);
                return Err(err);
            }
        };
        let version = sequencer.version();
        self.version.store(version, Ordering::Release);

        debug!(
            document_id = %self.document_id,
            operation_id = %rebased.operation_id,
            user_id = %rebased.user_id,
            base_version = op.base_version,
            version,
            "Committed operation"
        );

        self.clocks
            .lock()
            .tick(&ReplicaId(rebased.user_id.0.clone()));
        self.awareness.rebase_cursors(&rebased);
        // The author may have left while the operation was in flight
        let _ = self.awareness.touch(&rebased.user_id, Utc::now());
        self.touch();

        self.publish(SyncMessage::Committed {
            operation: rebased.clone(),
            version,
        });

        let interval = self.config.snapshot_interval;
        if interval > 0 && version % interval == 0 {
            let snapshot = self.snapshot_from(&sequencer);
            drop(sequencer);
            debug!(document_id = %self.document_id, version, "Broadcasting snapshot");
            self.publish(SyncMessage::Snapshot { snapshot });
        }

        Ok(rebased)
    }

    /// Merge a CRDT fragment into the keyed store, returning the merged state
    pub fn submit_crdt_update(&self, update: CrdtUpdate) -> Result<CrdtState> {
        self.ensure_open()?;
        if !self.config.mode.accepts_crdt() {
            return Err(CollaborationError::ModeNotSupported(
                "CRDT updates",
                self.config.mode,
            ));
        }
        self.check_document(&update.document_id)?;
        self.check_member(&update.user_id)?;
        if let CrdtState::Text(text) = &update.state {
            self.check_document(&text.document_id)?;
        }

        let merged = match self.crdt_store.entry(update.key.clone()) {
            Entry::Occupied(mut entry) => {
                if let Err(err) = entry.get_mut().merge_from(&update.state) {
                    drop(entry);
                    self.reject(&update.user_id, &err);
                    return Err(err);
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(update.state.clone().normalized()).value().clone(),
        };

        observe_state(&mut self.clocks.lock(), &update.state);
        let _ = self.awareness.touch(&update.user_id, Utc::now());
        self.touch();

        debug!(
            document_id = %self.document_id,
            key = %update.key,
            kind = merged.kind(),
            user_id = %update.user_id,
            "Merged CRDT update"
        );

        self.publish(SyncMessage::CrdtState {
            document_id: self.document_id.clone(),
            user_id: update.user_id,
            key: update.key,
            state: merged.clone(),
        });
        Ok(merged)
    }

    pub fn crdt_state(&self, key: &str) -> Option<CrdtState> {
        self.crdt_store.get(key).map(|state| state.value().clone())
    }

    pub fn join_session(&self, state: AwarenessUserState) -> Result<AwarenessUserState> {
        self.ensure_open()?;
        if !self.awareness.is_member(&state.user_id)
            && self.awareness.member_count() >= self.config.max_users
        {
            return Err(CollaborationError::SessionFull(self.config.max_users));
        }

        let state = self.awareness.join(state);
        self.touch();

        info!(
            session_id = %self.session_id,
            user_id = %state.user_id,
            "User joined session"
        );
        self.publish(SyncMessage::Event {
            event: SessionEvent::UserJoined {
                session_id: self.session_id,
                user_id: state.user_id.clone(),
            },
        });
        Ok(state)
    }

    pub fn leave_session(&self, user_id: &UserId) -> Result<()> {
        if self.awareness.leave(user_id).is_none() {
            return Err(CollaborationError::UserNotInSession(user_id.clone()));
        }
        self.release_lock_of(user_id);

        info!(session_id = %self.session_id, user_id = %user_id, "User left session");
        self.publish(SyncMessage::Event {
            event: SessionEvent::UserLeft {
                session_id: self.session_id,
                user_id: user_id.clone(),
            },
        });
        Ok(())
    }

    pub fn update_cursor(&self, cursor: CollaborativeCursor) -> Result<CollaborativeCursor> {
        self.ensure_open()?;
        self.check_document(&cursor.document_id)?;

        let cursor = self.awareness.update_cursor(cursor)?;
        self.touch();
        self.publish(SyncMessage::CursorMoved {
            cursor: cursor.clone(),
        });
        Ok(cursor)
    }

    pub fn update_awareness(&self, update: AwarenessUpdate) -> Result<AwarenessUserState> {
        self.ensure_open()?;

        let state = self.awareness.update_awareness(update)?;
        if !state.is_connected() {
            self.release_lock_of(&state.user_id);
        }
        self.touch();
        self.publish(SyncMessage::AwarenessChanged {
            document_id: self.document_id.clone(),
            state: state.clone(),
        });
        Ok(state)
    }

    /// Take the edit lock (lock mode only); re-acquiring is a no-op
    pub fn acquire_edit_lock(&self, user_id: &UserId) -> Result<()> {
        self.ensure_open()?;
        if self.config.mode != CollaborationMode::Lock {
            return Err(CollaborationError::ModeNotSupported(
                "edit lock",
                self.config.mode,
            ));
        }
        self.check_member(user_id)?;

        let mut holder = self.lock_holder.lock();
        match holder.as_ref() {
            Some(current) if current != user_id => {
                Err(CollaborationError::LockHeld(current.clone()))
            }
            _ => {
                *holder = Some(user_id.clone());
                info!(document_id = %self.document_id, user_id = %user_id, "Edit lock acquired");
                Ok(())
            }
        }
    }

    /// Release the edit lock if `user_id` holds it
    pub fn release_edit_lock(&self, user_id: &UserId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.release_lock_of(user_id))
    }

    pub fn lock_holder(&self) -> Option<UserId> {
        self.lock_holder.lock().clone()
    }

    /// Committed operations since `base_version` and the current version
    pub async fn operations_since(&self, base_version: u64) -> Result<(Vec<Operation>, u64)> {
        let sequencer = self.acquire_sequencer().await?;
        let operations = sequencer.since(base_version)?.cloned().collect();
        Ok((operations, sequencer.version()))
    }

    pub async fn get_snapshot(&self) -> Result<Snapshot> {
        let sequencer = self.acquire_sequencer().await?;
        Ok(self.snapshot_from(&sequencer))
    }

    /// Advance idle/ended state and age out presence
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        if self.status() == SessionStatus::Ended {
            return Vec::new();
        }

        let mut events = self.awareness.sweep(now);
        for event in &events {
            if let SessionEvent::UserLeft { user_id, .. } = event {
                self.release_lock_of(user_id);
            }
        }

        let mut lifecycle = self.lifecycle.write();
        let inactive = now - lifecycle.last_activity;
        let idle_timeout = self.config.idle_timeout_delta();
        let idle_after = self.config.idle_after_delta();
        if inactive >= idle_timeout {
            drop(lifecycle);
            events.extend(self.end(EndReason::IdleTimeout));
        } else if inactive >= idle_after && lifecycle.status == SessionStatus::Active {
            lifecycle.status = SessionStatus::Idle;
            drop(lifecycle);
            info!(session_id = %self.session_id, "Session idle");
        }

        for event in &events {
            if !matches!(event, SessionEvent::SessionEnded { .. }) {
                self.publish(SyncMessage::Event {
                    event: event.clone(),
                });
            }
        }
        events
    }

    /// End the session; returns the event only the first time
    pub fn end(&self, reason: EndReason) -> Option<SessionEvent> {
        {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.status == SessionStatus::Ended {
                return None;
            }
            lifecycle.status = SessionStatus::Ended;
        }

        info!(
            session_id = %self.session_id,
            document_id = %self.document_id,
            ?reason,
            "Collaboration session ended"
        );
        let event = SessionEvent::SessionEnded {
            session_id: self.session_id,
            document_id: self.document_id.clone(),
            reason,
        };
        self.publish(SyncMessage::Event {
            event: event.clone(),
        });
        Some(event)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            document_id: self.document_id.clone(),
            mode: self.config.mode,
            status: self.status(),
            version: self.version(),
            user_count: self.awareness.member_count(),
            crdt_keys: self.crdt_store.len(),
            lock_holder: self.lock_holder(),
        }
    }

    async fn acquire_sequencer(&self) -> Result<MutexGuard<'_, Sequencer>> {
        tokio::time::timeout(self.config.sequencer_wait(), self.sequencer.lock())
            .await
            .map_err(|_| {
                warn!(document_id = %self.document_id, "Timed out waiting for sequencer");
                CollaborationError::SequencerBusy(self.document_id.clone())
            })
    }

    fn snapshot_from(&self, sequencer: &Sequencer) -> Snapshot {
        let crdt_states: BTreeMap<String, CrdtState> = self
            .crdt_store
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        Snapshot {
            document_id: self.document_id.clone(),
            session_id: self.session_id,
            version: sequencer.version(),
            content: sequencer.document().clone(),
            crdt_states,
            taken_at: Utc::now(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status() == SessionStatus::Ended {
            return Err(CollaborationError::SessionEnded(self.session_id));
        }
        Ok(())
    }

    fn check_document(&self, document_id: &DocumentId) -> Result<()> {
        if document_id != &self.document_id {
            return Err(CollaborationError::DocumentMismatch {
                left: self.document_id.clone(),
                right: document_id.clone(),
            });
        }
        Ok(())
    }

    fn check_member(&self, user_id: &UserId) -> Result<()> {
        if !self.awareness.is_member(user_id) {
            return Err(CollaborationError::UserNotInSession(user_id.clone()));
        }
        Ok(())
    }

    fn touch(&self) {
        let mut lifecycle = self.lifecycle.write();
        lifecycle.last_activity = Utc::now();
        if lifecycle.status == SessionStatus::Idle {
            lifecycle.status = SessionStatus::Active;
        }
    }

    fn release_lock_of(&self, user_id: &UserId) -> bool {
        let mut holder = self.lock_holder.lock();
        if holder.as_ref() == Some(user_id) {
            *holder = None;
            info!(document_id = %self.document_id, user_id = %user_id, "Edit lock released");
            return true;
        }
        false
    }

    /// Audit trail for refusals a client cannot fix by retrying
    fn reject(&self, user_id: &UserId, err: &CollaborationError) {
        if !matches!(
            err,
            CollaborationError::StaleVersion { .. } | CollaborationError::CrdtTypeMismatch { .. }
        ) {
            debug!(document_id = %self.document_id, user_id = %user_id, error = %err, "Rejected submission");
            return;
        }

        warn!(
            target: "collaboration::audit",
            session_id = %self.session_id,
            document_id = %self.document_id,
            user_id = %user_id,
            code = err.code(),
            "{}",
            err
        );
        self.publish(SyncMessage::Event {
            event: SessionEvent::OperationRejected {
                session_id: self.session_id,
                document_id: self.document_id.clone(),
                user_id: user_id.clone(),
                code: err.code().to_string(),
                message: err.to_string(),
                at: Utc::now(),
            },
        });
    }

    fn publish(&self, message: SyncMessage) {
        // No subscribers is fine
        let _ = self.tx.send(message);
    }
}

fn observe_state(clocks: &mut ClockService, state: &CrdtState) {
    let vector = state.vector_clock().cloned().unwrap_or_default();
    clocks.observe(state.lamport().unwrap_or(0), &vector);
}
