//! Conflict-free replicated data types.
//!
//! Every state here merges commutatively, associatively and idempotently, so
//! replicas converge regardless of delivery order or duplication. The set of
//! types is closed: [`CrdtState`] is matched exhaustively wherever states are
//! merged or inspected.

use serde::{Deserialize, Serialize};

use crate::{CollaborationError, DocumentId, Result, SessionId, UserId, VectorClock};

mod counter;
mod or_set;
mod register;
mod text;

pub use counter::{GCounter, PnCounter};
pub use or_set::{OrSet, OrSetElement};
pub use register::LwwRegister;
pub use text::{CharId, TextCrdtOp, TextCrdtOpKind, TextCrdtState};

/// State-based CRDT
pub trait Crdt: Clone {
    /// Merge another replica's state into this one
    fn merge(&mut self, other: &Self);

    /// Pure form of [`Crdt::merge`]
    fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }
}

/// Any replicated state the session can store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrdtState {
    LwwRegister(LwwRegister),
    GCounter(GCounter),
    PnCounter(PnCounter),
    OrSet(OrSet),
    Text(TextCrdtState),
}

impl CrdtState {
    pub fn kind(&self) -> &'static str {
        match self {
            CrdtState::LwwRegister(_) => "lww_register",
            CrdtState::GCounter(_) => "g_counter",
            CrdtState::PnCounter(_) => "pn_counter",
            CrdtState::OrSet(_) => "or_set",
            CrdtState::Text(_) => "text",
        }
    }

    /// Merge two copies of the same CRDT
    pub fn merge(&self, other: &CrdtState) -> Result<CrdtState> {
        let mut out = self.clone();
        out.merge_from(other)?;
        Ok(out)
    }

    /// Merge `other` into `self`; on error `self` is unchanged
    pub fn merge_from(&mut self, other: &CrdtState) -> Result<()> {
        match (self, other) {
            (CrdtState::LwwRegister(a), CrdtState::LwwRegister(b)) => a.merge(b),
            (CrdtState::GCounter(a), CrdtState::GCounter(b)) => a.merge(b),
            (CrdtState::PnCounter(a), CrdtState::PnCounter(b)) => a.merge(b),
            (CrdtState::OrSet(a), CrdtState::OrSet(b)) => a.merge(b),
            (CrdtState::Text(a), CrdtState::Text(b)) => {
                if a.document_id != b.document_id {
                    return Err(CollaborationError::DocumentMismatch {
                        left: a.document_id.clone(),
                        right: b.document_id.clone(),
                    });
                }
                a.merge(b)
            }
            (left, right) => {
                return Err(CollaborationError::CrdtTypeMismatch {
                    left: left.kind(),
                    right: right.kind(),
                })
            }
        }
        Ok(())
    }

    /// Rebuild derived fields of states that arrived from elsewhere
    pub fn normalized(mut self) -> Self {
        if let CrdtState::Text(text) = &mut self {
            text.normalize();
        }
        self
    }

    /// Highest Lamport time carried by the state, if it tracks one
    pub fn lamport(&self) -> Option<u64> {
        match self {
            CrdtState::LwwRegister(reg) => Some(reg.timestamp),
            CrdtState::OrSet(set) => set.elements().iter().map(|e| e.timestamp).max(),
            CrdtState::Text(text) => Some(text.lamport_clock),
            CrdtState::GCounter(_) | CrdtState::PnCounter(_) => None,
        }
    }

    pub fn vector_clock(&self) -> Option<&VectorClock> {
        match self {
            CrdtState::LwwRegister(reg) => reg.vector_clock.as_ref(),
            CrdtState::Text(text) => Some(&text.vector_clock),
            CrdtState::GCounter(_) | CrdtState::PnCounter(_) | CrdtState::OrSet(_) => None,
        }
    }
}

/// Merge two CRDT states
pub fn merge(a: &CrdtState, b: &CrdtState) -> Result<CrdtState> {
    a.merge(b)
}

/// CRDT fragment submitted by a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtUpdate {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub session_id: SessionId,

    /// Name of the shared object within the document
    pub key: String,

    pub state: CrdtState,
}
