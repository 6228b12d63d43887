use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::Crdt;
use crate::{CollaborationError, DocumentId, LamportClock, ReplicaId, Result, VectorClock};

/// Identity of one inserted character: `(lamport, replica)`, totally ordered
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CharId {
    pub lamport: u64,
    pub replica: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TextCrdtOpKind {
    /// Insert `ch` immediately after `origin` (or at the start)
    Insert { ch: char, origin: Option<CharId> },
    /// Tombstone the character `target`
    Delete { target: CharId },
}

/// Entry of the text operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCrdtOp {
    pub id: CharId,
    /// Visible index on the originating replica, kept for diagnostics
    pub position: usize,
    pub kind: TextCrdtOpKind,
}

/// Replicated plain text
///
/// The log is kept sorted and unique by op id. Every insert anchors to the id
/// of its left neighbour rather than a raw offset, so the inserts form a tree
/// rooted at the start of the text. The visible order is a pre-order walk of
/// that tree with siblings visited newest first. Two replicas holding the
/// same set of ops therefore hold the same content.
///
/// Deserialized states are normalized: the log is sorted and deduplicated,
/// `content` is rebuilt from it and `lamport_clock` covers every op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TextCrdtRepr")]
pub struct TextCrdtState {
    pub document_id: DocumentId,
    /// Materialized visible text
    pub content: String,
    pub operations: Vec<TextCrdtOp>,
    pub lamport_clock: u64,
    pub vector_clock: VectorClock,
}

/// Wire form; the log may arrive unsorted and `content` is not trusted
#[derive(Deserialize)]
struct TextCrdtRepr {
    document_id: DocumentId,
    #[serde(default)]
    operations: Vec<TextCrdtOp>,
    #[serde(default)]
    lamport_clock: u64,
    #[serde(default)]
    vector_clock: VectorClock,
}

impl From<TextCrdtRepr> for TextCrdtState {
    fn from(repr: TextCrdtRepr) -> Self {
        let mut state = Self {
            document_id: repr.document_id,
            content: String::new(),
            operations: repr.operations,
            lamport_clock: repr.lamport_clock,
            vector_clock: repr.vector_clock,
        };
        state.normalize();
        state
    }
}

struct Slot<'a> {
    id: &'a CharId,
    ch: char,
    deleted: bool,
}

impl TextCrdtState {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            content: String::new(),
            operations: Vec::new(),
            lamport_clock: 0,
            vector_clock: VectorClock::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.content
    }

    /// Visible length in characters
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Insert `text` at visible `position`, returning the new log entries
    pub fn insert(
        &mut self,
        replica: &ReplicaId,
        position: usize,
        text: &str,
    ) -> Result<Vec<TextCrdtOp>> {
        let len = self.len();
        if position > len {
            return Err(CollaborationError::InvalidOperation(format!(
                "insert at {} past end of text ({})",
                position, len
            )));
        }

        let mut origin = if position == 0 {
            None
        } else {
            Some(self.visible_id(position - 1)?)
        };

        // New ids exceed every id in the log, so appending keeps it sorted
        let mut ops = Vec::with_capacity(text.len());
        for (offset, ch) in text.chars().enumerate() {
            let id = self.next_id(replica);
            let op = TextCrdtOp {
                id: id.clone(),
                position: position + offset,
                kind: TextCrdtOpKind::Insert {
                    ch,
                    origin: origin.replace(id),
                },
            };
            self.operations.push(op.clone());
            ops.push(op);
        }

        self.content = self.replay();
        Ok(ops)
    }

    /// Delete `count` visible characters starting at `position`
    pub fn delete(
        &mut self,
        replica: &ReplicaId,
        position: usize,
        count: usize,
    ) -> Result<Vec<TextCrdtOp>> {
        let len = self.len();
        if position + count > len {
            return Err(CollaborationError::InvalidOperation(format!(
                "delete {}..{} past end of text ({})",
                position,
                position + count,
                len
            )));
        }

        let targets: Vec<CharId> = self
            .slots()
            .into_iter()
            .filter(|slot| !slot.deleted)
            .skip(position)
            .take(count)
            .map(|slot| slot.id.clone())
            .collect();

        let mut ops = Vec::with_capacity(count);
        for target in targets {
            let id = self.next_id(replica);
            let op = TextCrdtOp {
                id,
                position,
                kind: TextCrdtOpKind::Delete { target },
            };
            self.operations.push(op.clone());
            ops.push(op);
        }

        self.content = self.replay();
        Ok(ops)
    }

    /// Restore the log invariants and rebuild `content` from the log
    pub fn normalize(&mut self) {
        if !self.has_sorted_log() {
            self.operations.sort_by(|a, b| a.id.cmp(&b.id));
            self.operations.dedup_by(|later, earlier| later.id == earlier.id);
        }
        let newest = self.operations.last().map(|op| op.id.lamport).unwrap_or(0);
        self.lamport_clock = self.lamport_clock.max(newest);
        self.content = self.replay();
    }

    /// Strictly ascending ids
    fn has_sorted_log(&self) -> bool {
        self.operations.windows(2).all(|pair| pair[0].id < pair[1].id)
    }

    fn next_id(&mut self, replica: &ReplicaId) -> CharId {
        let mut clock = LamportClock(self.lamport_clock);
        let lamport = clock.tick();
        self.lamport_clock = lamport;
        self.vector_clock.increment(replica);
        CharId {
            lamport,
            replica: replica.clone(),
        }
    }

    fn visible_id(&self, index: usize) -> Result<CharId> {
        self.slots()
            .into_iter()
            .filter(|slot| !slot.deleted)
            .nth(index)
            .map(|slot| slot.id.clone())
            .ok_or_else(|| {
                CollaborationError::InvalidOperation(format!("no character at {}", index))
            })
    }

    /// Lay out every inserted character in visible order
    ///
    /// Linear in the log size: children are grouped by origin, then walked
    /// with an explicit stack so long typing chains cannot overflow.
    fn slots(&self) -> Vec<Slot<'_>> {
        let mut placed: HashSet<&CharId> = HashSet::with_capacity(self.operations.len());
        let mut deleted: HashSet<&CharId> = HashSet::new();
        let mut roots = Vec::new();
        let mut orphans = Vec::new();
        let mut children: HashMap<&CharId, Vec<(&CharId, char)>> = HashMap::new();

        // Ascending id order, so each child list is oldest first
        for op in &self.operations {
            match &op.kind {
                TextCrdtOpKind::Insert { ch, origin } => {
                    let node = (&op.id, *ch);
                    match origin {
                        None => roots.push(node),
                        Some(origin) if placed.contains(origin) => {
                            children.entry(origin).or_default().push(node)
                        }
                        // Origin never seen: park after the rooted text
                        Some(_) => orphans.push(node),
                    }
                    placed.insert(&op.id);
                }
                TextCrdtOpKind::Delete { target } => {
                    deleted.insert(target);
                }
            }
        }

        // Pop order: roots newest first, then orphans oldest first
        let mut stack: Vec<(&CharId, char)> = orphans.into_iter().rev().collect();
        stack.extend(roots);

        let mut slots = Vec::with_capacity(placed.len());
        while let Some((id, ch)) = stack.pop() {
            slots.push(Slot {
                id,
                ch,
                deleted: deleted.contains(id),
            });
            if let Some(next) = children.remove(id) {
                stack.extend(next);
            }
        }

        slots
    }

    fn replay(&self) -> String {
        self.slots()
            .into_iter()
            .filter(|slot| !slot.deleted)
            .map(|slot| slot.ch)
            .collect()
    }
}

impl Crdt for TextCrdtState {
    /// Both states must describe the same document
    fn merge(&mut self, other: &Self) {
        if !self.has_sorted_log() {
            self.normalize();
        }
        let sorted;
        let other = if other.has_sorted_log() {
            other
        } else {
            let mut copy = other.clone();
            copy.normalize();
            sorted = copy;
            &sorted
        };

        let mine = std::mem::take(&mut self.operations);
        let mut merged = Vec::with_capacity(mine.len().max(other.operations.len()));
        let mut left = mine.into_iter().peekable();
        let mut right = other.operations.iter().peekable();

        loop {
            let order = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.id.cmp(&b.id),
            };
            match order {
                Ordering::Less => merged.extend(left.next()),
                Ordering::Greater => merged.extend(right.next().cloned()),
                Ordering::Equal => {
                    right.next();
                    merged.extend(left.next());
                }
            }
        }

        self.operations = merged;
        self.lamport_clock = self.lamport_clock.max(other.lamport_clock);
        self.vector_clock.merge(&other.vector_clock);
        self.content = self.replay();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> TextCrdtState {
        TextCrdtState::new(DocumentId::from("notes"))
    }

    #[test]
    fn test_local_edits() {
        let r1 = ReplicaId::from("r1");
        let mut text = doc();

        text.insert(&r1, 0, "hello").unwrap();
        text.insert(&r1, 5, " world").unwrap();
        text.delete(&r1, 0, 1).unwrap();
        text.insert(&r1, 0, "J").unwrap();

        assert_eq!(text.text(), "Jello world");
        assert_eq!(text.lamport_clock, 13);
        assert_eq!(text.vector_clock.get(&r1), 13);
    }

    #[test]
    fn test_out_of_range() {
        let mut text = doc();
        let r1 = ReplicaId::from("r1");
        assert!(text.insert(&r1, 1, "x").is_err());
        assert!(text.delete(&r1, 0, 1).is_err());
        assert!(text.operations.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_do_not_interleave() {
        let r1 = ReplicaId::from("r1");
        let r2 = ReplicaId::from("r2");

        let mut base = doc();
        base.insert(&r1, 0, "[]").unwrap();

        let mut a = base.clone();
        a.insert(&r1, 1, "abc").unwrap();
        let mut b = base.clone();
        b.insert(&r2, 1, "xyz").unwrap();

        let ab = a.merged(&b);
        let ba = b.merged(&a);
        assert_eq!(ab, ba);
        let merged = ab.text();
        assert!(merged == "[abcxyz]" || merged == "[xyzabc]", "{}", merged);
    }

    #[test]
    fn test_concurrent_delete_and_insert() {
        let r1 = ReplicaId::from("r1");
        let r2 = ReplicaId::from("r2");

        let mut base = doc();
        base.insert(&r1, 0, "hello").unwrap();

        let mut a = base.clone();
        a.delete(&r1, 1, 3).unwrap();
        let mut b = base.clone();
        b.insert(&r2, 3, "XY").unwrap();

        let merged = a.merged(&b);
        assert_eq!(merged.text(), "hXYo");
        assert_eq!(merged, b.merged(&a));
        assert_eq!(merged.lamport_clock, 8);
    }

    #[test]
    fn test_merge_idempotent_and_preserves_later_edits() {
        let r1 = ReplicaId::from("r1");
        let mut a = doc();
        a.insert(&r1, 0, "abc").unwrap();
        assert_eq!(a.merged(&a), a);

        let mut merged = a.merged(&a);
        merged.insert(&r1, 3, "d").unwrap();
        assert_eq!(merged.text(), "abcd");
    }

    #[test]
    fn test_long_range_delete() {
        let r1 = ReplicaId::from("r1");
        let mut text = doc();
        text.insert(&r1, 0, &"x".repeat(3000)).unwrap();

        let ops = text.delete(&r1, 0, 1500).unwrap();
        assert_eq!(ops.len(), 1500);
        assert_eq!(text.len(), 1500);

        // Deleted ids are distinct, one per character
        let targets: HashSet<_> = ops
            .iter()
            .filter_map(|op| match &op.kind {
                TextCrdtOpKind::Delete { target } => Some(target.clone()),
                TextCrdtOpKind::Insert { .. } => None,
            })
            .collect();
        assert_eq!(targets.len(), 1500);
    }

    #[test]
    fn test_deserialize_normalizes_log() {
        let r1 = ReplicaId::from("r1");
        let r2 = ReplicaId::from("r2");
        let mut base = doc();
        base.insert(&r1, 0, "ab").unwrap();

        let mut peer = base.clone();
        peer.insert(&r2, 1, "X").unwrap();

        let mut wire = serde_json::to_value(&base).unwrap();
        wire["content"] = serde_json::json!("bogus");
        wire["lamport_clock"] = serde_json::json!(0);
        let ops = wire["operations"].as_array_mut().unwrap();
        ops.reverse();
        let duplicate = ops[0].clone();
        ops.push(duplicate);

        let received: TextCrdtState = serde_json::from_value(wire).unwrap();
        assert_eq!(received, base);
        assert_eq!(received.text(), "ab");
        assert_eq!(received.lamport_clock, 2);
        assert_eq!(received.merged(&peer).text(), "aXb");
    }

    #[test]
    fn test_merge_accepts_unsorted_peer() {
        let r1 = ReplicaId::from("r1");
        let mut a = doc();
        a.insert(&r1, 0, "ab").unwrap();

        let mut shuffled = a.clone();
        shuffled.operations.reverse();
        assert_eq!(doc().merged(&shuffled), a);
    }
}
